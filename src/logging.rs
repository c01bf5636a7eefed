use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::time::Duration;

/// 详细日志等级（`DEBUG` / `--debug`）：
/// - off：只输出每个上游请求的一行摘要
/// - low：额外输出客户端请求/响应（请求头脱敏）
/// - medium：额外输出后端请求/响应头（脱敏）
/// - high：额外输出请求体与响应体（截断）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn body_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(level: LogLevel, method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        body_if(level, body),
    );
}

pub fn client_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body_if(level, body),
    );
}

pub fn backend_request(level: LogLevel, method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        body_if(level, body),
    );
}

pub fn backend_response(
    level: LogLevel,
    status: u16,
    duration: Duration,
    headers: &HeaderMap,
    body: &[u8],
) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n[后端响应头]\n{}\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_headers(headers),
        body_if(level, body),
    );
}

fn body_if(level: LogLevel, body: &[u8]) -> String {
    if level.body_enabled() {
        format_body_bytes(body)
    } else {
        String::new()
    }
}

fn is_redacted(name: &str) -> bool {
    matches!(
        name,
        "authorization" | "proxy-authorization" | "cookie" | "set-cookie"
    )
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();

        let v = if is_redacted(key) {
            sonic_rs::Value::from("***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // 同名多值统一用数组输出。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    match sonic_rs::to_string_pretty(v) {
        Ok(s) => s,
        Err(_) => v.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 大包不做 JSON 解析，只输出头尾。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    const HEAD_TAIL: usize = 16 * 1024;

    if bytes.len() > MAX_PARSE_BYTES {
        let head_len = bytes.len().min(HEAD_TAIL);
        let tail_len = bytes.len().saturating_sub(head_len).min(HEAD_TAIL);
        let head = String::from_utf8_lossy(&bytes[..head_len]);
        let tail = String::from_utf8_lossy(&bytes[bytes.len() - tail_len..]);
        return format!(
            "(body too large: {} bytes, showing head/tail)\n--- head ---\n{}\n--- tail ---\n{}",
            bytes.len(),
            truncate_text_for_log(&head),
            truncate_text_for_log(&tail)
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => truncate_text_for_log(&format_body_value(&v)),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}
