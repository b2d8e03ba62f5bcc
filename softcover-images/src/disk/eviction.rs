use std::{
    path::PathBuf,
    time::{Duration, SystemTime},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    TtlExpired,
    OverSizeCap,
}

#[derive(Debug, Clone)]
pub struct CacheEntryInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct PlannedEviction {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

#[derive(Debug, Default)]
pub struct EvictionPlan {
    pub planned: Vec<PlannedEviction>,
    pub total_bytes_before: u64,
    pub total_bytes_after: u64,
    pub removed_ttl: usize,
    pub removed_size: usize,
}

pub fn is_expired(
    now: SystemTime,
    last_modified: SystemTime,
    ttl: Duration,
) -> bool {
    // A stamp from the future is never expired.
    now.duration_since(last_modified)
        .map(|age| age > ttl)
        .unwrap_or(false)
}

/// Decide which entries to delete.
///
/// With `ttl` set, expired entries go first (startup sweep). Then, if the
/// remainder is over `max_bytes`, the oldest `last_modified` entries go until
/// it fits. A `max_bytes` of zero disables the size cap.
pub fn plan_evictions(
    mut entries: Vec<CacheEntryInfo>,
    now: SystemTime,
    ttl: Option<Duration>,
    max_bytes: u64,
) -> EvictionPlan {
    let mut plan = EvictionPlan::default();

    let mut total_bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
    plan.total_bytes_before = total_bytes;

    let mut kept: Vec<CacheEntryInfo> = Vec::with_capacity(entries.len());
    for e in entries.drain(..) {
        if let Some(ttl) = ttl
            && is_expired(now, e.last_modified, ttl)
        {
            total_bytes = total_bytes.saturating_sub(e.size_bytes);
            plan.planned.push(PlannedEviction {
                path: e.path,
                size_bytes: e.size_bytes,
                reason: EvictionReason::TtlExpired,
            });
            plan.removed_ttl += 1;
        } else {
            kept.push(e);
        }
    }

    if max_bytes > 0 && total_bytes > max_bytes {
        kept.sort_by_key(|e| e.last_modified);
        for e in kept {
            if total_bytes <= max_bytes {
                break;
            }
            total_bytes = total_bytes.saturating_sub(e.size_bytes);
            plan.planned.push(PlannedEviction {
                path: e.path,
                size_bytes: e.size_bytes,
                reason: EvictionReason::OverSizeCap,
            });
            plan.removed_size += 1;
        }
    }

    plan.total_bytes_after = total_bytes;
    plan
}
