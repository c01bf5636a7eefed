// === Jemalloc 全局分配器配置 ===
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod balancer;
pub mod cache;
pub mod config;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod prometheus;
pub mod quota_pool;
pub mod server;
pub mod upstream;

use anyhow::Context;
use balancer::{BalancingRouter, spawn_refresh_task};
use cache::CachingStage;
use cache::storage::{FileStorage, MemoryStorage, Storage};
use config::{Config, StorageKind};
use gateway::GatewayState;
use prometheus::{MetricsSink, PrometheusSink};
use quota_pool::QuotaTracker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use upstream::Transport;
use upstream::client::UpstreamClient;
use upstream::ratelimit::Paced;
use upstream::transport::CredentialTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load().context("加载配置失败")?;

    init_tracing();

    let metrics = prometheus::install().context("初始化 Prometheus 失败")?;
    let client = UpstreamClient::new(&cfg).context("初始化上游客户端失败")?;
    let credentials =
        credential::load_all(&cfg, client.http()).context("加载凭证失败")?;

    let cancel = CancellationToken::new();
    let base: Arc<dyn Transport> = Arc::new(client);

    // 没有配置凭证时直接透传客户端自带的 Authorization。
    let chain: Arc<dyn Transport> = if !cfg.has_credentials() {
        tracing::info!("未配置凭证，透传客户端鉴权");
        paced(base, cfg.rph)
    } else {
        let tracker = Arc::new(QuotaTracker::new());
        let sink: Arc<dyn MetricsSink> = Arc::new(PrometheusSink);
        let transports = credentials
            .into_iter()
            .map(|c| {
                Arc::new(CredentialTransport::new(
                    c,
                    paced(base.clone(), cfg.rph),
                    tracker.clone(),
                    sink.clone(),
                ))
            })
            .collect();
        let router = Arc::new(BalancingRouter::new(transports));

        // 后台配额轮询：周期性探测 /rate_limit，取消令牌触发时退出。
        let probe_url = cfg
            .api_url
            .join("rate_limit")
            .context("构造 rate_limit 地址失败")?;
        spawn_refresh_task(router.clone(), probe_url, cfg.rate_interval, cancel.clone());
        router as Arc<dyn Transport>
    };

    let storage: Arc<dyn Storage> = match cfg.storage {
        StorageKind::Memory => Arc::new(MemoryStorage::new(cfg.cache_capacity)),
        StorageKind::File => {
            tracing::info!("缓存目录: {}", cfg.cache_dir.display());
            Arc::new(FileStorage::new(&cfg.cache_dir))
        }
    };

    let state = Arc::new(GatewayState {
        upstream: Arc::new(CachingStage::new(chain, storage)),
        api_url: cfg.api_url.clone(),
        tls: cfg.tls_enabled(),
        metrics,
        log_level: cfg.log_level(),
    });
    let app = gateway::build_router(state);

    tracing::info!("上游地址: {}", cfg.api_url);
    tokio::spawn(server::shutdown_signal(cancel.clone()));
    server::run(app, &cfg, cancel).await
}

fn paced(inner: Arc<dyn Transport>, rph: u64) -> Arc<dyn Transport> {
    if rph > 0 {
        Arc::new(Paced::new(inner, rph))
    } else {
        inner
    }
}

fn init_tracing() {
    // 默认把依赖库日志控制在 warn，但确保本项目自身日志至少为 info，
    // 以免环境中预设的 RUST_LOG=warn 把上游请求摘要过滤掉。
    // 设为 RUST_LOG=off 可完全静默；DEBUG 只控制逐请求的详细日志块。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,ghproxy=info")
    } else if env == "off" || env.contains("ghproxy") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},ghproxy=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}
