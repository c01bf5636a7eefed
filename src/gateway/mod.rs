//! 入站 HTTP：路由、请求头整理、Link 改写。

pub mod handler;
pub mod rewrite;

pub use handler::{GatewayState, build_router};
