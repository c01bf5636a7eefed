//! 条件请求缓存：为 GET/HEAD 保存带校验器的响应，命中时以 `If-None-Match` /
//! `If-Modified-Since` 重验证，上游返回 304 时用缓存内容应答（304 不消耗配额）。

pub mod storage;

use crate::credential::hash_token;
use crate::error::AppError;
use crate::upstream::{Transport, UpstreamRequest, UpstreamResponse};
use async_trait::async_trait;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, HeaderName,
    IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE, LAST_MODIFIED, RANGE,
    TRANSFER_ENCODING,
};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use storage::{CachedResponse, Storage};
use tracing::{debug, warn};

pub struct CachingStage {
    inner: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
}

impl CachingStage {
    pub fn new(inner: Arc<dyn Transport>, storage: Arc<dyn Storage>) -> Self {
        Self { inner, storage }
    }
}

/// 只有不带客户端条件头的 GET/HEAD 参与缓存。
fn cache_key(req: &UpstreamRequest) -> Option<String> {
    if req.method != Method::GET && req.method != Method::HEAD {
        return None;
    }
    let conditional = [IF_NONE_MATCH, IF_MODIFIED_SINCE, IF_MATCH, IF_UNMODIFIED_SINCE, RANGE];
    if conditional.iter().any(|h| req.headers.contains_key(h)) {
        return None;
    }

    let header = |name: HeaderName| {
        req.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };
    let auth = match header(AUTHORIZATION) {
        "" => String::new(),
        v => hash_token(v),
    };

    let mut hasher = Sha256::new();
    for part in [req.method.as_str(), req.url.as_str(), header(ACCEPT), auth.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut key = String::with_capacity(64);
    for b in digest {
        let _ = write!(key, "{b:02x}");
    }
    Some(key)
}

fn has_validator(headers: &HeaderMap) -> bool {
    headers.contains_key(ETAG) || headers.contains_key(LAST_MODIFIED)
}

/// 304 的新头覆盖缓存头；实体相关的头保留缓存里的值。
fn revalidated(mut cached: CachedResponse, fresh: &HeaderMap) -> CachedResponse {
    let entity = [CONTENT_TYPE, CONTENT_LENGTH, CONTENT_ENCODING, TRANSFER_ENCODING];
    for name in fresh.keys() {
        if entity.contains(name) {
            continue;
        }
        cached.headers.remove(name);
        for value in fresh.get_all(name) {
            cached.headers.append(name.clone(), value.clone());
        }
    }
    cached
}

#[async_trait]
impl Transport for CachingStage {
    async fn round_trip(&self, mut req: UpstreamRequest) -> Result<UpstreamResponse, AppError> {
        let Some(key) = cache_key(&req) else {
            return self.inner.round_trip(req).await;
        };

        let cached = match self.storage.lookup(&key).await {
            Ok(v) => v,
            Err(e) => {
                warn!("缓存读取失败，按未命中处理: {e}");
                None
            }
        };

        if let Some(c) = &cached {
            if let Some(etag) = c.headers.get(ETAG) {
                req.headers.insert(IF_NONE_MATCH, etag.clone());
            }
            if let Some(lm) = c.headers.get(LAST_MODIFIED) {
                req.headers.insert(IF_MODIFIED_SINCE, lm.clone());
            }
        }

        let url = req.url.clone();
        let resp = self.inner.round_trip(req).await?;

        if resp.status == StatusCode::NOT_MODIFIED
            && let Some(c) = cached
        {
            debug!(url = %url, "缓存重验证命中");
            let merged = revalidated(c, &resp.headers);
            if let Err(e) = self.storage.store(&key, &merged).await {
                warn!("缓存写入失败: {e}");
            }
            return Ok(merged.into());
        }

        if resp.status == StatusCode::OK && has_validator(&resp.headers) {
            if let Err(e) = self.storage.store(&key, &CachedResponse::from(&resp)).await {
                warn!("缓存写入失败: {e}");
            }
        }

        Ok(resp)
    }
}
