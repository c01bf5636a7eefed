//! 多凭证负载均衡：按配额选择凭证，并在后台定期刷新配额。

pub mod refresher;
pub mod router;
pub mod selector;

pub use refresher::spawn_refresh_task;
pub use router::BalancingRouter;
