use crate::quota_pool::types::{QuotaSnapshot, Resource};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QuotaKey {
    credential: String,
    resource: Resource,
}

#[derive(Debug, Clone, Copy)]
struct QuotaEntry {
    remaining: u64,
    reset_at: DateTime<Utc>,
    /// 观测完成时领取的序号；只允许更大的序号覆盖。
    stamp: u64,
}

/// 配额跟踪器：按（凭证，分区）维护最近一次观测到的 remaining/reset。
///
/// 写入方有两个（请求响应头、后台轮询），互不协调；统一以"完成时刻"领取的单调序号
/// 决定先后，晚完成的观测胜出，慢请求带回的旧数据不会覆盖新数据。
#[derive(Debug, Default)]
pub struct QuotaTracker {
    entries: DashMap<QuotaKey, QuotaEntry>,
    sequence: AtomicU64,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 领取一个观测序号，应在响应到达（观测完成）时调用。
    pub fn stamp(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 以当前时刻为完成时刻写入观测。
    pub fn observe(
        &self,
        credential: &str,
        resource: &Resource,
        remaining: u64,
        reset_at: DateTime<Utc>,
    ) -> bool {
        let stamp = self.stamp();
        self.observe_stamped(credential, resource, remaining, reset_at, stamp)
    }

    /// 写入一次带序号的观测；返回是否真正生效（序号过旧则丢弃）。
    pub fn observe_stamped(
        &self,
        credential: &str,
        resource: &Resource,
        remaining: u64,
        reset_at: DateTime<Utc>,
        stamp: u64,
    ) -> bool {
        let key = QuotaKey {
            credential: credential.to_string(),
            resource: resource.clone(),
        };
        let next = QuotaEntry {
            remaining,
            reset_at,
            stamp,
        };

        match self.entries.entry(key) {
            Entry::Occupied(mut e) => {
                if e.get().stamp >= stamp {
                    return false;
                }
                e.insert(next);
                true
            }
            Entry::Vacant(v) => {
                v.insert(next);
                true
            }
        }
    }

    pub fn snapshot(&self, credential: &str, resource: &Resource) -> QuotaSnapshot {
        let key = QuotaKey {
            credential: credential.to_string(),
            resource: resource.clone(),
        };
        match self.entries.get(&key) {
            Some(e) => QuotaSnapshot {
                remaining: e.remaining,
                reset_at: e.reset_at,
                known: true,
            },
            None => QuotaSnapshot::unknown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn unknown_until_first_observation() {
        let tracker = QuotaTracker::new();
        let core = Resource::core();
        assert!(!tracker.snapshot("a", &core).known);

        assert!(tracker.observe("a", &core, 42, at(100)));
        let snap = tracker.snapshot("a", &core);
        assert_eq!((snap.remaining, snap.reset_at, snap.known), (42, at(100), true));

        // 不同凭证、不同分区互不影响。
        assert!(!tracker.snapshot("b", &core).known);
        assert!(!tracker.snapshot("a", &Resource::new("search")).known);
    }

    #[test]
    fn older_stamp_never_overwrites_newer_one() {
        let tracker = QuotaTracker::new();
        let core = Resource::core();
        let early = tracker.stamp();
        let late = tracker.stamp();

        // 晚完成的观测先写入，早完成的慢请求后写入。
        assert!(tracker.observe_stamped("a", &core, 10, at(200), late));
        assert!(!tracker.observe_stamped("a", &core, 99, at(100), early));

        let snap = tracker.snapshot("a", &core);
        assert_eq!((snap.remaining, snap.reset_at), (10, at(200)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_converge_to_latest_completion() {
        let tracker = Arc::new(QuotaTracker::new());
        let core = Resource::core();
        let base = Utc::now();

        let mut stamps: Vec<u64> = (0..64).map(|_| tracker.stamp()).collect();
        let latest = *stamps.last().unwrap();
        // 打乱写入顺序：写入顺序与完成顺序无关。
        stamps.reverse();
        stamps.rotate_left(17);

        let mut handles = Vec::new();
        for stamp in stamps {
            let tracker = tracker.clone();
            let core = core.clone();
            handles.push(tokio::spawn(async move {
                tracker.observe_stamped(
                    "a",
                    &core,
                    stamp,
                    base + Duration::seconds(stamp as i64),
                    stamp,
                );
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snap = tracker.snapshot("a", &core);
        // remaining 与 reset_at 必须来自同一次观测，不能交错。
        assert_eq!(snap.remaining, latest);
        assert_eq!(snap.reset_at, base + Duration::seconds(latest as i64));
    }
}
