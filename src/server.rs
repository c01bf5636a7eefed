use crate::config::Config;
use anyhow::Context;
use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 等待 Ctrl-C / SIGTERM，随后触发取消令牌。
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!("注册 SIGTERM 失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => return,
    }
    info!("收到退出信号，准备关闭服务...");
    cancel.cancel();
}

/// 按配置选择明文或 TLS 监听，直到取消令牌触发并完成排空。
pub async fn run(app: Router, cfg: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    match (&cfg.tls_cert, &cfg.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .with_context(|| format!("加载 TLS 证书失败: {}", cert.display()))?;
            info!("Server listening on https://{}", cfg.listen);
            serve_tls(cfg.listen, tls, app, cancel, cfg.shutdown_timeout).await
        }
        _ => {
            let listener = TcpListener::bind(cfg.listen)
                .await
                .context("绑定监听端口失败")?;
            info!("Server listening on http://{}", cfg.listen);
            serve_plain(listener, app, cancel, cfg.shutdown_timeout).await
        }
    }
}

pub async fn serve_plain(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
    window: Duration,
) -> anyhow::Result<()> {
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.clone().cancelled_owned());
    let task = tokio::spawn(async move { server.await.context("服务异常退出") });
    drain(task, &cancel, window).await
}

pub async fn serve_tls(
    addr: SocketAddr,
    tls: RustlsConfig,
    app: Router,
    cancel: CancellationToken,
    window: Duration,
) -> anyhow::Result<()> {
    let handle = Handle::new();
    let server = axum_server::bind_rustls(addr, tls)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let task = tokio::spawn(async move { server.await.context("服务异常退出") });

    let watcher = cancel.clone();
    tokio::spawn(async move {
        watcher.cancelled().await;
        // 不设上限：排空时长由 drain 统一控制。
        handle.graceful_shutdown(None);
    });
    drain(task, &cancel, window).await
}

/// 取消后最多等待 `window` 让在途请求结束，超时视为失败。
async fn drain(
    mut task: JoinHandle<anyhow::Result<()>>,
    cancel: &CancellationToken,
    window: Duration,
) -> anyhow::Result<()> {
    tokio::select! {
        res = &mut task => return res.context("服务任务异常")?,
        _ = cancel.cancelled() => {}
    }

    info!("停止接受新连接，等待在途请求结束（最长 {:?}）", window);
    match tokio::time::timeout(window, &mut task).await {
        Ok(res) => {
            res.context("服务任务异常")??;
            info!("服务已关闭");
            Ok(())
        }
        Err(_) => {
            task.abort();
            anyhow::bail!("优雅关闭超时：{:?} 内仍有请求未完成", window)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn slow_app(delay: Duration) -> Router {
        Router::new().route(
            "/slow",
            get(move || async move {
                tokio::time::sleep(delay).await;
                "done"
            }),
        )
    }

    #[tokio::test]
    async fn in_flight_request_finishes_after_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_plain(
            listener,
            slow_app(Duration::from_millis(600)),
            cancel.clone(),
            Duration::from_secs(5),
        ));

        let client = reqwest::Client::new();
        let inflight = tokio::spawn(async move {
            client
                .get(format!("http://{addr}/slow"))
                .send()
                .await?
                .text()
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        // 排空期间：在途请求未结束，新连接已被拒绝。
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!inflight.is_finished());
        assert!(!server.is_finished());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        assert_eq!(inflight.await.unwrap().unwrap(), "done");
        server.await.unwrap().unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn drain_window_exceeded_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_plain(
            listener,
            slow_app(Duration::from_secs(30)),
            cancel.clone(),
            Duration::from_millis(100),
        ));

        let _stuck = tokio::spawn(async move {
            let _ = reqwest::get(format!("http://{addr}/slow")).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert!(server.await.unwrap().is_err());
    }
}
