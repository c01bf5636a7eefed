use crate::balancer::selector::{self, Candidate};
use crate::error::AppError;
use crate::quota_pool::Resource;
use crate::upstream::transport::CredentialTransport;
use crate::upstream::{Transport, UpstreamRequest, UpstreamResponse};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

struct Member {
    transport: Arc<CredentialTransport>,
    /// 最近一次被选中时的全局序号，0 表示从未使用。
    last_used: AtomicU64,
}

/// 在全部凭证之间按剩余配额分发请求。成员集合在启动时固定。
pub struct BalancingRouter {
    members: Vec<Member>,
    cursor: AtomicUsize,
    uses: AtomicU64,
}

impl BalancingRouter {
    pub fn new(transports: Vec<Arc<CredentialTransport>>) -> Self {
        Self {
            members: transports
                .into_iter()
                .map(|transport| Member {
                    transport,
                    last_used: AtomicU64::new(0),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
            uses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn transports(&self) -> impl Iterator<Item = &Arc<CredentialTransport>> {
        self.members.iter().map(|m| &m.transport)
    }

    /// 为该分区选一个凭证；全部耗尽时仍返回最久未用的那个。
    pub fn route(&self, resource: &Resource) -> Result<&Arc<CredentialTransport>, AppError> {
        if self.members.is_empty() {
            return Err(AppError::NoRoute);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let candidates: Vec<Candidate> = self
            .members
            .iter()
            .map(|m| Candidate {
                snapshot: m.transport.tracker().snapshot(m.transport.identity(), resource),
                last_used: m.last_used.load(Ordering::Relaxed),
            })
            .collect();

        let idx = selector::select(&candidates, start, now).ok_or(AppError::NoRoute)?;
        let member = &self.members[idx];
        let seq = self.uses.fetch_add(1, Ordering::Relaxed) + 1;
        member.last_used.store(seq, Ordering::Relaxed);

        debug!(
            credential = member.transport.identity(),
            resource = %resource,
            remaining = candidates[idx].snapshot.remaining,
            known = candidates[idx].snapshot.known,
            "已选择凭证"
        );
        Ok(&member.transport)
    }
}

#[async_trait]
impl Transport for BalancingRouter {
    async fn round_trip(&self, req: UpstreamRequest) -> Result<UpstreamResponse, AppError> {
        let resource = req.resource.clone().unwrap_or_else(Resource::core);
        let transport = self.route(&resource)?;
        transport.round_trip(req).await
    }
}
