use crate::error::AppError;
use crate::upstream::{Transport, UpstreamRequest, UpstreamResponse};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// 按固定间隔放行请求的限速层（每小时 `rph` 次，均匀分布）。
///
/// 配额探测请求（`resource == None`）不占用名额。
pub struct Paced {
    inner: Arc<dyn Transport>,
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Paced {
    pub fn new(inner: Arc<dyn Transport>, requests_per_hour: u64) -> Self {
        let rph = u32::try_from(requests_per_hour.max(1)).unwrap_or(u32::MAX);
        let interval = Duration::from_secs(3600) / rph;
        Self {
            inner,
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// 预约下一个放行时刻，返回需要等待的时长。锁只在计算期间持有。
    fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut next = self
            .next_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = next.map_or(now, |n| n.max(now));
        *next = Some(slot + self.interval);
        slot - now
    }
}

#[async_trait]
impl Transport for Paced {
    async fn round_trip(&self, req: UpstreamRequest) -> Result<UpstreamResponse, AppError> {
        if req.resource.is_some() {
            let wait = self.reserve();
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        self.inner.round_trip(req).await
    }
}
