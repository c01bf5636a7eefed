//! 配额池（Quota Pool）模块。
//!
//! 按（凭证，配额分区）记录上游返回的剩余额度与重置时间，供负载均衡选择凭证。

mod tracker;
mod types;

pub use tracker::QuotaTracker;
pub use types::{QuotaSnapshot, Resource};
