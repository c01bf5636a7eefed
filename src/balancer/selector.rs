use crate::quota_pool::QuotaSnapshot;
use chrono::{DateTime, Utc};

/// 选择时每个成员的输入：该分区的配额视图与最近一次被选中的序号。
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub snapshot: QuotaSnapshot,
    pub last_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// 已知且有余量
    Available = 0,
    /// 未观测过，或余量为 0 但已过重置时间
    Unknown = 1,
    /// 余量为 0 且尚未重置
    Exhausted = 2,
}

pub fn tier(snapshot: &QuotaSnapshot, now: DateTime<Utc>) -> Tier {
    if snapshot.is_exhausted(now) {
        Tier::Exhausted
    } else if snapshot.has_headroom() {
        Tier::Available
    } else {
        Tier::Unknown
    }
}

/// 选出本次使用的成员下标。
///
/// 先按 Tier 排序；Available 内余量多者优先，Exhausted 内最久未用者优先；
/// 其余平局按从 `start` 开始的轮转顺序决定。
pub fn select(candidates: &[Candidate], start: usize, now: DateTime<Utc>) -> Option<usize> {
    let n = candidates.len();
    (0..n)
        .map(|k| (start.wrapping_add(k) % n, k))
        .min_by_key(|&(idx, k)| {
            let c = &candidates[idx];
            let t = tier(&c.snapshot, now);
            let secondary = match t {
                Tier::Available => u64::MAX - c.snapshot.remaining,
                Tier::Unknown => 0,
                Tier::Exhausted => c.last_used,
            };
            (t, secondary, k)
        })
        .map(|(idx, _)| idx)
}
