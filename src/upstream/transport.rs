use crate::credential::Credential;
use crate::error::AppError;
use crate::prometheus::MetricsSink;
use crate::quota_pool::{QuotaTracker, Resource};
use crate::upstream::headers::parse_quota;
use crate::upstream::{Transport, UpstreamRequest, UpstreamResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    resources: BTreeMap<String, RateWindow>,
}

#[derive(Debug, Deserialize)]
struct RateWindow {
    remaining: i64,
    reset: i64,
}

/// 单个凭证的出站层：写入认证信息，并把响应里的配额回写到 [`QuotaTracker`]。
pub struct CredentialTransport {
    credential: Credential,
    inner: Arc<dyn Transport>,
    tracker: Arc<QuotaTracker>,
    sink: Arc<dyn MetricsSink>,
}

impl CredentialTransport {
    pub fn new(
        credential: Credential,
        inner: Arc<dyn Transport>,
        tracker: Arc<QuotaTracker>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            credential,
            inner,
            tracker,
            sink,
        }
    }

    pub fn identity(&self) -> &str {
        &self.credential.identity
    }

    pub fn tracker(&self) -> &QuotaTracker {
        &self.tracker
    }

    fn observe(&self, resource: &Resource, remaining: u64, reset_at: DateTime<Utc>, stamp: u64) -> bool {
        let applied = self.tracker.observe_stamped(
            self.identity(),
            resource,
            remaining,
            reset_at,
            stamp,
        );
        if applied {
            self.sink
                .record(self.identity(), resource.as_str(), remaining, reset_at.timestamp());
        }
        applied
    }

    /// 从响应头提取一次配额观测；头缺失或不合法时不写入。
    pub fn observe_headers(&self, headers: &HeaderMap, stamp: u64) -> bool {
        match parse_quota(headers) {
            Some(q) => self.observe(&q.resource, q.remaining, q.reset_at, stamp),
            None => false,
        }
    }

    /// 解析 `/rate_limit` 响应体，逐个分区写入；返回生效的分区数。
    pub fn observe_rate_limit_body(&self, body: &[u8], stamp: u64) -> usize {
        let parsed = match sonic_rs::from_slice::<RateLimitBody>(body) {
            Ok(v) => v,
            Err(e) => {
                debug!("rate_limit 响应体无法解析（{}）：{e}", self.identity());
                return 0;
            }
        };

        let mut applied = 0;
        for (name, window) in parsed.resources {
            let (Ok(remaining), Ok(_)) = (
                u64::try_from(window.remaining),
                u64::try_from(window.reset),
            ) else {
                continue;
            };
            let Some(reset_at) = DateTime::<Utc>::from_timestamp(window.reset, 0) else {
                continue;
            };
            if self.observe(&Resource::new(name), remaining, reset_at, stamp) {
                applied += 1;
            }
        }
        applied
    }
}

#[async_trait]
impl Transport for CredentialTransport {
    async fn round_trip(&self, mut req: UpstreamRequest) -> Result<UpstreamResponse, AppError> {
        self.credential.auth.authenticate(&mut req.headers).await?;
        let resp = self.inner.round_trip(req).await?;
        // 以响应到达的时刻为准领取序号。
        let stamp = self.tracker.stamp();
        self.observe_headers(&resp.headers, stamp);
        Ok(resp)
    }
}
