use crate::config::Config;
use crate::credential::hash_token;
use crate::error::AppError;
use crate::logging::{self, LogLevel};
use crate::prometheus;
use crate::upstream::headers::{
    X_GITHUB_MEDIA_TYPE, X_GITHUB_REQUEST_ID, X_RATELIMIT_REMAINING, X_RATELIMIT_RESOURCE,
    header_str, header_u64,
};
use crate::upstream::{Transport, UpstreamRequest, UpstreamResponse};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, USER_AGENT};
use std::time::{Duration, Instant};
use tracing::{error, info};

const DEFAULT_USER_AGENT: &str = concat!("ghproxy/", env!("CARGO_PKG_VERSION"));

/// 所有凭证共享的上游 HTTP 客户端，同时负责请求日志与耗时指标。
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    log_level: LogLevel,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> Result<Self, AppError> {
        // 代理不跟随重定向，Location 原样交给客户端（会被改写为代理地址）。
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(DEFAULT_USER_AGENT);

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }

        if !cfg.proxy.trim().is_empty() {
            let proxy = reqwest::Proxy::all(cfg.proxy.trim())
                .map_err(|e| AppError::config(format!("出站代理地址无效: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let http = builder
            .build()
            .map_err(|e| AppError::config(format!("构建 HTTP 客户端失败: {e}")))?;
        Ok(Self {
            http,
            log_level: cfg.log_level(),
        })
    }

    /// 供安装令牌换取等控制面请求复用连接池。
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

#[async_trait]
impl Transport for UpstreamClient {
    async fn round_trip(&self, req: UpstreamRequest) -> Result<UpstreamResponse, AppError> {
        if self.log_level.backend_enabled() {
            logging::backend_request(
                self.log_level,
                req.method.as_str(),
                req.url.as_str(),
                &req.headers,
                &req.body,
            );
        }

        let start = Instant::now();
        let result = self.send(&req).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(resp) => {
                prometheus::record_latency(resp.status.as_u16(), elapsed);
                if !is_rate_limit_probe(&req) {
                    log_completed(&req, resp, elapsed);
                }
                if self.log_level.backend_enabled() {
                    logging::backend_response(
                        self.log_level,
                        resp.status.as_u16(),
                        elapsed,
                        &resp.headers,
                        &resp.body,
                    );
                }
            }
            Err(e) if !is_rate_limit_probe(&req) => {
                error!(
                    method = %req.method,
                    url = %req.url,
                    duration_ms = logging::format_duration_ms(elapsed),
                    hashed_token = %hashed_authorization(&req.headers),
                    "上游请求失败: {e}"
                );
            }
            Err(_) => {}
        }

        result
    }
}

impl UpstreamClient {
    async fn send(&self, req: &UpstreamRequest) -> Result<UpstreamResponse, AppError> {
        let resp = self
            .http
            .request(req.method.clone(), req.url.clone())
            .headers(req.headers.clone())
            .body(req.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::upstream(format!("请求超时: {e}"))
                } else {
                    AppError::upstream(e.to_string())
                }
            })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| AppError::upstream(format!("读取上游响应失败: {e}")))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn is_rate_limit_probe(req: &UpstreamRequest) -> bool {
    req.url.path().trim_end_matches('/').ends_with("/rate_limit")
}

/// 出站 Authorization 的指纹，日志中用它区分凭证。
fn hashed_authorization(headers: &HeaderMap) -> String {
    match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(v) if !v.is_empty() => hash_token(v),
        _ => String::new(),
    }
}

fn log_completed(req: &UpstreamRequest, resp: &UpstreamResponse, elapsed: Duration) {
    info!(
        method = %req.method,
        url = %req.url,
        status = resp.status.as_u16(),
        duration_ms = logging::format_duration_ms(elapsed),
        size = resp.body.len(),
        user_agent = header_str(&req.headers, USER_AGENT),
        hashed_token = %hashed_authorization(&req.headers),
        request_id = header_str(&resp.headers, X_GITHUB_REQUEST_ID),
        media_type = header_str(&resp.headers, X_GITHUB_MEDIA_TYPE),
        content_type = header_str(&resp.headers, CONTENT_TYPE),
        ratelimit_remaining = header_u64(&resp.headers, X_RATELIMIT_REMAINING),
        ratelimit_resource = header_str(&resp.headers, X_RATELIMIT_RESOURCE),
        "HTTP request"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    #[test]
    fn rate_limit_probe_is_detected_under_any_base() {
        let probe = UpstreamRequest::get(Url::parse("https://ghe.example/api/v3/rate_limit").unwrap());
        assert!(is_rate_limit_probe(&probe));
        let other = UpstreamRequest::get(Url::parse("https://api.github.com/repos/a/b").unwrap());
        assert!(!is_rate_limit_probe(&other));
    }

    #[test]
    fn token_fingerprint_is_empty_without_authorization() {
        assert_eq!(hashed_authorization(&HeaderMap::new()), "");
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, "Bearer x".parse().unwrap());
        assert_eq!(hashed_authorization(&h).len(), 44);
    }
}
