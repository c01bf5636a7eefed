use chrono::{DateTime, Utc};
use reqwest::Method;
use std::fmt;

/// 上游的配额分区（GitHub 称为 resource），例如 core / search / graphql。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource(String);

impl Resource {
    pub const CORE: &'static str = "core";
    pub const SEARCH: &'static str = "search";
    pub const CODE_SEARCH: &'static str = "code_search";
    pub const GRAPHQL: &'static str = "graphql";
    pub const INTEGRATION_MANIFEST: &'static str = "integration_manifest";
    pub const CODE_SCANNING_UPLOAD: &'static str = "code_scanning_upload";
    pub const DEPENDENCY_SNAPSHOTS: &'static str = "dependency_snapshots";
    pub const ACTIONS_RUNNER_REGISTRATION: &'static str = "actions_runner_registration";
    pub const AUDIT_LOG: &'static str = "audit_log";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn core() -> Self {
        Self::new(Self::CORE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 按请求方法与 API 路径（相对上游 base，已去掉兼容前缀）推断该请求消耗哪个配额分区。
    pub fn classify(method: &Method, path: &str) -> Self {
        let path = path.trim_end_matches('/');
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let name = match segments.as_slice() {
            ["graphql", ..] => Self::GRAPHQL,
            ["search", "code", ..] => Self::CODE_SEARCH,
            ["search", ..] => Self::SEARCH,
            ["app-manifests", _, "conversions"] if *method == Method::POST => {
                Self::INTEGRATION_MANIFEST
            }
            ["repos", _, _, "code-scanning", "sarifs"] if *method == Method::POST => {
                Self::CODE_SCANNING_UPLOAD
            }
            ["repos", _, _, "dependency-graph", "snapshots"] if *method == Method::POST => {
                Self::DEPENDENCY_SNAPSHOTS
            }
            [.., "actions", "runners", "registration-token"] => Self::ACTIONS_RUNNER_REGISTRATION,
            [.., "audit-log"] => Self::AUDIT_LOG,
            _ => Self::CORE,
        };
        Self::new(name)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 单个（凭证，分区）的最新配额视图。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// 是否观测到过该分区；为 false 时其余字段无意义。
    pub known: bool,
}

impl QuotaSnapshot {
    pub fn unknown() -> Self {
        Self {
            remaining: 0,
            reset_at: DateTime::<Utc>::UNIX_EPOCH,
            known: false,
        }
    }

    /// 已知耗尽：remaining=0 且重置时间仍在未来。
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.known && self.remaining == 0 && self.reset_at > now
    }

    /// 已知且仍有余量。
    pub fn has_headroom(&self) -> bool {
        self.known && self.remaining > 0
    }
}
