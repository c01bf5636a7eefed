use crate::error::AppError;
use crate::gateway::rewrite::{ClientOrigin, rewrite_links, target_url};
use crate::logging::{self, LogLevel};
use crate::quota_pool::Resource;
use crate::upstream::headers::{sanitize_response, strip_hop_by_hop};
use crate::upstream::{Transport, UpstreamRequest};
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, FORWARDED, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Url;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

/// 请求体上限。
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
/// GitHub Enterprise 兼容前缀。
const COMPAT_PREFIX: &str = "/api/v3";

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

#[derive(Clone)]
pub struct GatewayState {
    /// 请求链路入口（缓存层）。
    pub upstream: Arc<dyn Transport>,
    pub api_url: Url,
    pub tls: bool,
    pub metrics: PrometheusHandle,
    pub log_level: LogLevel,
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route(COMPAT_PREFIX, any(handle_compat))
        .route("/api/v3/", any(handle_compat))
        .route("/api/v3/{*rest}", any(handle_compat))
        .fallback(handle_proxy)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn handle_metrics(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub async fn handle_proxy(
    State(state): State<Arc<GatewayState>>,
    parts: Parts,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let path = parts.uri.path().to_string();
    proxy(&state, parts, body, &path).await.into_response()
}

pub async fn handle_compat(
    State(state): State<Arc<GatewayState>>,
    parts: Parts,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let stripped = parts
        .uri
        .path()
        .strip_prefix(COMPAT_PREFIX)
        .unwrap_or_default();
    let path = if stripped.is_empty() { "/" } else { stripped }.to_string();
    proxy(&state, parts, body, &path).await.into_response()
}

async fn proxy(
    state: &GatewayState,
    parts: Parts,
    body: Result<Bytes, BytesRejection>,
    path: &str,
) -> Result<Response, AppError> {
    let start = Instant::now();

    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    let origin = client_origin(&parts.headers, &parts.uri, state.tls);
    let body = read_body(&parts.headers, body)?;

    if state.log_level.client_enabled() {
        logging::client_request(
            state.log_level,
            parts.method.as_str(),
            path,
            &parts.headers,
            &body,
        );
    }

    let url = target_url(&state.api_url, path, parts.uri.query());
    let resource = Resource::classify(&parts.method, path);
    let headers = forward_headers(&parts.headers, client_ip, &origin);
    let is_head = parts.method == Method::HEAD;

    let resp = state
        .upstream
        .round_trip(UpstreamRequest {
            method: parts.method,
            url,
            headers,
            body,
            resource: Some(resource),
        })
        .await?;

    let bodiless = is_head
        || resp.status.is_informational()
        || resp.status == StatusCode::NO_CONTENT
        || resp.status == StatusCode::NOT_MODIFIED;
    let mut headers = resp.headers;
    sanitize_response(&mut headers, bodiless);
    rewrite_links(&mut headers, state.api_url.as_str(), &origin);

    if state.log_level.client_enabled() {
        logging::client_response(state.log_level, resp.status.as_u16(), start.elapsed(), &resp.body);
    }

    let mut out = Response::new(Body::from(resp.body));
    *out.status_mut() = resp.status;
    *out.headers_mut() = headers;
    Ok(out)
}

/// 声明长度超限时直接拒绝；分块上传在读取过程中由 `DefaultBodyLimit` 截断。
fn read_body(headers: &HeaderMap, body: Result<Bytes, BytesRejection>) -> Result<Bytes, AppError> {
    let too_large = || AppError::PayloadTooLarge(format!("请求体超过 {MAX_BODY_BYTES} 字节"));

    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|n| n > MAX_BODY_BYTES) {
        return Err(too_large());
    }

    match body {
        Ok(b) => Ok(b),
        Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
            Err(too_large())
        }
        Err(e) => Err(AppError::bad_request(format!("读取请求体失败: {e}"))),
    }
}

/// Host 优先取请求头，HTTP/2 时退回 `:authority`。
fn client_origin(headers: &HeaderMap, uri: &axum::http::Uri, tls: bool) -> ClientOrigin {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "localhost".to_string());
    ClientOrigin {
        proto: if tls { "https" } else { "http" },
        host,
    }
}

/// 构造转发给上游的请求头。客户端自带的 X-Forwarded-* 一律丢弃，由代理重新设置。
fn forward_headers(inbound: &HeaderMap, client_ip: Option<IpAddr>, origin: &ClientOrigin) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    for name in [HOST, CONTENT_LENGTH, ACCEPT_ENCODING, FORWARDED] {
        headers.remove(name);
    }
    let forwarded: Vec<HeaderName> = headers
        .keys()
        .filter(|k| k.as_str().starts_with("x-forwarded-"))
        .cloned()
        .collect();
    for name in forwarded {
        headers.remove(name);
    }

    if let Some(ip) = client_ip
        && let Ok(v) = HeaderValue::from_str(&ip.to_string())
    {
        headers.insert(X_FORWARDED_FOR, v);
    }
    if let Ok(v) = HeaderValue::from_str(&origin.host) {
        headers.insert(X_FORWARDED_HOST, v);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(origin.proto));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::testing::{FakeUpstream, response};
    use axum::http::header::{AUTHORIZATION, LINK};
    use axum::http::Request as HttpRequest;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn app(fake: Arc<FakeUpstream>, api_url: &str, tls: bool) -> Router {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        build_router(Arc::new(GatewayState {
            upstream: fake,
            api_url: Url::parse(api_url).unwrap(),
            tls,
            metrics: handle,
            log_level: LogLevel::Off,
        }))
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header(HOST, "proxy.example")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn compat_prefix_is_stripped() {
        let fake = Arc::new(FakeUpstream::ok());
        let app = app(fake.clone(), "https://api.github.com/", false);

        for uri in ["/api/v3/repos/o/r?per_page=2", "/repos/o/r?per_page=2"] {
            let resp = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = app.clone().oneshot(get("/api/v3")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let urls: Vec<String> = fake.requests().iter().map(|r| r.url.to_string()).collect();
        assert_eq!(
            urls,
            vec![
                "https://api.github.com/repos/o/r?per_page=2",
                "https://api.github.com/repos/o/r?per_page=2",
                "https://api.github.com/",
            ]
        );
    }

    #[tokio::test]
    async fn forwarded_headers_are_set_by_proxy() {
        let fake = Arc::new(FakeUpstream::ok());
        let app = app(fake.clone(), "https://api.github.com/", false);

        let mut req = HttpRequest::builder()
            .uri("/user")
            .header(HOST, "proxy.example")
            .header("x-forwarded-for", "6.6.6.6")
            .header("x-forwarded-proto", "https")
            .header(ACCEPT_ENCODING, "br")
            .header("connection", "close")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 5555))));
        app.oneshot(req).await.unwrap();

        let seen = &fake.requests()[0];
        assert_eq!(seen.headers["x-forwarded-for"], "10.1.2.3");
        assert_eq!(seen.headers["x-forwarded-host"], "proxy.example");
        assert_eq!(seen.headers["x-forwarded-proto"], "http");
        assert!(seen.headers.get(HOST).is_none());
        assert!(seen.headers.get(ACCEPT_ENCODING).is_none());
        assert!(seen.headers.get("connection").is_none());
        assert_eq!(seen.resource.as_ref().map(Resource::as_str), Some("core"));
    }

    #[tokio::test]
    async fn metrics_endpoint_is_not_proxied() {
        let fake = Arc::new(FakeUpstream::ok());
        let app = app(fake.clone(), "https://api.github.com/", false);
        let resp = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(fake.requests().is_empty());
    }

    #[tokio::test]
    async fn link_header_is_rewritten_for_client() {
        let fake = Arc::new(FakeUpstream::new(|_| {
            Ok(response(
                StatusCode::OK,
                &[
                    ("link", "<https://upstream.example/resource?page=2>; rel=\"next\""),
                    ("content-length", "999"),
                ],
                "[]",
            ))
        }));
        let app = app(fake, "https://upstream.example/", true);
        let resp = app.oneshot(get("/resource")).await.unwrap();
        assert_eq!(
            resp.headers()[LINK],
            "<https://proxy.example/resource?page=2>; rel=\"next\""
        );
        // 上游声明的长度作废，按实际响应体重新计算。
        assert_eq!(resp.headers()[CONTENT_LENGTH], "2");
    }

    #[tokio::test]
    async fn upstream_status_and_body_pass_through() {
        let fake = Arc::new(FakeUpstream::new(|r| {
            assert_eq!(r.body, "{\"title\":\"bug\"}");
            assert_eq!(r.headers[AUTHORIZATION], "token client");
            Ok(response(StatusCode::UNPROCESSABLE_ENTITY, &[], "{\"message\":\"Validation Failed\"}"))
        }));
        let app = app(fake, "https://api.github.com/", false);
        let req = HttpRequest::builder()
            .method(Method::POST)
            .uri("/repos/o/r/issues")
            .header(AUTHORIZATION, "token client")
            .header(CONTENT_LENGTH, "15")
            .body(Body::from("{\"title\":\"bug\"}"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(body, "{\"message\":\"Validation Failed\"}");
    }

    #[tokio::test]
    async fn no_route_renders_service_unavailable() {
        let fake = Arc::new(FakeUpstream::new(|_| Err(AppError::NoRoute)));
        let app = app(fake, "https://api.github.com/", false);
        let resp = app.oneshot(get("/user")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let fake = Arc::new(FakeUpstream::ok());
        let app = app(fake.clone(), "https://api.github.com/", false);
        let req = HttpRequest::builder()
            .method(Method::POST)
            .uri("/markdown")
            .header(CONTENT_LENGTH, (MAX_BODY_BYTES + 1).to_string())
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(fake.requests().is_empty());
    }

    #[tokio::test]
    async fn chunked_body_over_limit_is_rejected() {
        let fake = Arc::new(FakeUpstream::ok());
        let app = app(fake.clone(), "https://api.github.com/", false);
        let chunk = Bytes::from(vec![b'x'; 1024 * 1024]);
        let chunks = (0..=MAX_BODY_BYTES / chunk.len())
            .map(move |_| Ok::<_, std::io::Error>(chunk.clone()));
        let req = HttpRequest::builder()
            .method(Method::POST)
            .uri("/markdown")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(fake.requests().is_empty());
    }

    #[tokio::test]
    async fn head_keeps_upstream_content_length() {
        let fake = Arc::new(FakeUpstream::new(|r| {
            assert_eq!(r.method, Method::HEAD);
            Ok(response(StatusCode::OK, &[("content-length", "1234")], ""))
        }));
        let app = app(fake, "https://api.github.com/", false);
        let req = HttpRequest::builder()
            .method(Method::HEAD)
            .uri("/repos/o/r")
            .header(HOST, "proxy.example")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_LENGTH], "1234");
    }
}
