use crate::balancer::router::BalancingRouter;
use crate::error::AppError;
use crate::upstream::transport::CredentialTransport;
use crate::upstream::{Transport, UpstreamRequest};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 启动后台配额轮询任务：每个间隔通过所有凭证并发探测一次 `/rate_limit`。
///
/// 首次探测立即执行；`cancel` 触发后在当前探测结束前即退出。
pub fn spawn_refresh_task(
    router: Arc<BalancingRouter>,
    probe_url: Url,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("配额轮询任务已停止");
                    return;
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("配额轮询任务已停止");
                    return;
                }
                ok = refresh_once(&router, &probe_url) => {
                    tracing::debug!(ok, total = router.len(), "配额轮询完成");
                }
            }
        }
    })
}

/// 执行一轮探测，返回成功的凭证数。单个凭证失败只记录日志。
pub async fn refresh_once(router: &BalancingRouter, probe_url: &Url) -> usize {
    let probes = router.transports().map(|t| async move {
        match probe(t, probe_url).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(credential = t.identity(), "配额探测失败: {e}");
                false
            }
        }
    });
    futures::future::join_all(probes)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count()
}

async fn probe(transport: &Arc<CredentialTransport>, probe_url: &Url) -> Result<(), AppError> {
    let resp = transport
        .round_trip(UpstreamRequest::get(probe_url.clone()))
        .await?;
    if !resp.status.is_success() {
        return Err(AppError::upstream(format!("HTTP {}", resp.status.as_u16())));
    }
    let stamp = transport.tracker().stamp();
    transport.observe_rate_limit_body(&resp.body, stamp);
    Ok(())
}
