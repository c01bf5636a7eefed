use crate::quota_pool::Resource;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderName};

pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
pub const X_RATELIMIT_RESOURCE: &str = "x-ratelimit-resource";
pub const X_GITHUB_REQUEST_ID: &str = "x-github-request-id";
pub const X_GITHUB_MEDIA_TYPE: &str = "x-github-media-type";

/// 逐跳头（RFC 9110 §7.6.1），代理两侧都不转发。
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// 从响应头解析出的一次配额观测。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaHeaders {
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub resource: Resource,
}

/// 解析 `X-RateLimit-*`；remaining 与 reset 必须同时存在且合法，否则视为无观测。
///
/// 负数、非数字一律当作缺失，不会写入配额表。
pub fn parse_quota(headers: &HeaderMap) -> Option<QuotaHeaders> {
    let remaining = header_u64(headers, X_RATELIMIT_REMAINING)?;
    let reset = header_u64(headers, X_RATELIMIT_RESET)?;
    let reset_at = DateTime::<Utc>::from_timestamp(i64::try_from(reset).ok()?, 0)?;

    let resource = headers
        .get(X_RATELIMIT_RESOURCE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Resource::new)
        .unwrap_or_else(Resource::core);

    Some(QuotaHeaders {
        remaining,
        reset_at,
        resource,
    })
}

pub fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse::<u64>().ok()
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// 删除逐跳头，包括 `Connection` 中点名的自定义头。
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

/// 上游响应回写客户端前的清理：有响应体时长度由本地连接重新决定；
/// HEAD 与 204/304 这类无响应体的应答保留上游声明的长度。
pub fn sanitize_response(headers: &mut HeaderMap, bodiless: bool) {
    strip_hop_by_hop(headers);
    if !bodiless {
        headers.remove(header::CONTENT_LENGTH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn parses_github_quota_headers() {
        let h = map(&[
            ("x-ratelimit-remaining", "4987"),
            ("x-ratelimit-reset", "1700000000"),
            ("x-ratelimit-resource", "search"),
        ]);
        let q = parse_quota(&h).unwrap();
        assert_eq!(q.remaining, 4987);
        assert_eq!(q.reset_at.timestamp(), 1_700_000_000);
        assert_eq!(q.resource.as_str(), "search");
    }

    #[test]
    fn missing_resource_defaults_to_core() {
        let h = map(&[("x-ratelimit-remaining", "1"), ("x-ratelimit-reset", "10")]);
        assert_eq!(parse_quota(&h).unwrap().resource, Resource::core());
    }

    #[test]
    fn malformed_values_are_not_observations() {
        for (remaining, reset) in [("-1", "10"), ("abc", "10"), ("5", "-3"), ("5", "")] {
            let h = map(&[("x-ratelimit-remaining", remaining), ("x-ratelimit-reset", reset)]);
            assert!(parse_quota(&h).is_none(), "{remaining}/{reset}");
        }
        assert!(parse_quota(&map(&[("x-ratelimit-remaining", "5")])).is_none());
        assert!(parse_quota(&HeaderMap::new()).is_none());
    }

    #[test]
    fn strips_connection_listed_and_fixed_hop_headers() {
        let mut h = map(&[
            ("connection", "keep-alive, x-secret"),
            ("keep-alive", "timeout=5"),
            ("x-secret", "1"),
            ("transfer-encoding", "chunked"),
            ("accept", "application/json"),
        ]);
        strip_hop_by_hop(&mut h);
        assert_eq!(h.len(), 1);
        assert!(h.contains_key("accept"));
    }

    #[test]
    fn content_length_survives_only_for_bodiless_responses() {
        let mut h = map(&[("content-length", "1234"), ("connection", "close")]);
        sanitize_response(&mut h, true);
        assert_eq!(h["content-length"], "1234");
        assert!(h.get("connection").is_none());

        let mut h = map(&[("content-length", "1234")]);
        sanitize_response(&mut h, false);
        assert!(h.get("content-length").is_none());
    }
}
