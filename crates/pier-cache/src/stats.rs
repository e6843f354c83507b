use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Whether a drive's usage is below or above the GC trigger watermark.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageState {
    Low,
    High,
}

/// Point-in-time usage of one cache drive.
#[derive(Clone, Debug)]
pub struct DriveUsage {
    pub dir: PathBuf,
    pub usage_bytes: u64,
    pub total_bytes: u64,
    pub usage_pct: u8,
    pub state: UsageState,
}

/// Monotonic hit/miss counters for one cache instance.
///
/// Counters are updated inline on request paths, so everything here is a
/// relaxed atomic; consistency across fields in a snapshot is best-effort.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_served: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bytes_served: u64,
}

impl CacheStats {
    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = CacheStats::default();
        stats.record_hit(100);
        stats.record_hit(50);
        stats.record_miss();

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.bytes_served, 150);
    }
}
