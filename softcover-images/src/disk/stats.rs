use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub trim_runs: u64,
    pub trim_removed: u64,
    pub last_trim_duration_ms: u64,
}

#[derive(Debug, Default)]
pub struct DiskCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    writes: AtomicU64,
    write_errors: AtomicU64,
    trim_runs: AtomicU64,
    trim_removed: AtomicU64,
    last_trim_duration_ms: AtomicU64,
}

impl DiskCacheStats {
    pub fn on_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// An expired entry counts as a miss too.
    pub fn on_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_trim_finished(&self, removed: u64, duration_ms: u64) {
        self.trim_runs.fetch_add(1, Ordering::Relaxed);
        self.trim_removed.fetch_add(removed, Ordering::Relaxed);
        self.last_trim_duration_ms
            .store(duration_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiskCacheStatsSnapshot {
        DiskCacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            trim_runs: self.trim_runs.load(Ordering::Relaxed),
            trim_removed: self.trim_removed.load(Ordering::Relaxed),
            last_trim_duration_ms: self
                .last_trim_duration_ms
                .load(Ordering::Relaxed),
        }
    }
}
