//! 上游请求链路：共享 HTTP 客户端、按凭证鉴权的 transport、可选限速。
//!
//! 每一层都实现 [`Transport`]，并以 `Arc<dyn Transport>` 持有下一层。

pub mod client;
pub mod headers;
pub mod ratelimit;
pub mod transport;

use crate::error::AppError;
use crate::quota_pool::Resource;
use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};

/// 发往上游的一次请求（body 已完整读入）。
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// 该请求消耗的配额分区；轮询探测等不计配额的请求为 None。
    pub resource: Option<Resource>,
}

impl UpstreamRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            resource: None,
        }
    }
}

/// 上游响应（body 已完整读入）。
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: UpstreamRequest) -> Result<UpstreamResponse, AppError>;
}
