//! Prometheus 指标。
//!
//! - `github_rate_limit_remaining{client_id,resource}`：当前窗口剩余请求数
//! - `github_rate_limit_reset{client_id,resource}`：当前窗口重置的 Unix 时间戳
//! - `github_latency_seconds{status}`：上游请求耗时

use metrics::{describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// 配额观测的接收方。调用发生在请求路径上，实现必须是非阻塞的。
pub trait MetricsSink: Send + Sync {
    fn record(&self, credential: &str, resource: &str, remaining: u64, reset_at_unix: i64);
}

/// 写入全局 metrics recorder 的实现。
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn record(&self, credential: &str, resource: &str, remaining: u64, reset_at_unix: i64) {
        gauge!(
            "github_rate_limit_remaining",
            "client_id" => credential.to_string(),
            "resource" => resource.to_string()
        )
        .set(remaining as f64);
        gauge!(
            "github_rate_limit_reset",
            "client_id" => credential.to_string(),
            "resource" => resource.to_string()
        )
        .set(reset_at_unix as f64);
    }
}

/// 安装全局 Prometheus recorder，返回用于 /metrics 渲染的 handle。
pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_gauge!(
        "github_rate_limit_remaining",
        "Number of requests remaining in the current rate limit window"
    );
    describe_gauge!(
        "github_rate_limit_reset",
        "Unix timestamp when the current rate limit window resets"
    );
    describe_histogram!("github_latency_seconds", "The latency of the GitHub API");

    Ok(handle)
}

pub fn record_latency(status: u16, elapsed: Duration) {
    histogram!("github_latency_seconds", "status" => status.to_string())
        .record(elapsed.as_secs_f64());
}
