use crate::error::{CacheError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// How PUTs interact with the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitMode {
    /// PUTs go straight to the backend; the cache fills on later reads.
    #[default]
    None,
    /// PUT is acked after the backend write; the cache fills concurrently.
    WriteThrough,
    /// PUT is acked after the cache write; the backend upload is async.
    WriteBack,
}

/// Cache layer configuration.
///
/// This is a plain data struct; loading it (CLI, env, config file) is the
/// embedding service's problem. `validate` must pass before the struct is
/// handed to [`crate::CacheLayer::new`].
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Ordered cache drive roots. Order is part of the placement function and
    /// must be stable across restarts.
    pub drives: Vec<PathBuf>,
    /// Glob patterns for `bucket/object` paths that bypass the cache.
    pub exclude: Vec<String>,
    /// Number of observed references before an uncached object becomes
    /// eligible for a cache slot.
    pub after: u32,
    /// Fraction of each drive usable by the cache, percent in `[1, 100]`.
    pub quota_pct: u8,
    /// Usage (as a fraction of quota) that triggers GC.
    pub high_watermark_pct: u8,
    /// Usage (as a fraction of quota) GC drives down to.
    pub low_watermark_pct: u8,
    /// Cache ranged GETs as discrete range blobs instead of backfilling the
    /// whole object in the background.
    pub range_enabled: bool,
    pub commit_mode: CommitMode,
    /// Bound on the write-back retry queue; sends beyond it are dropped.
    pub writeback_retry_capacity: usize,
    /// Period of the per-drive GC tick.
    pub gc_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            drives: Vec::new(),
            exclude: Vec::new(),
            after: 0,
            quota_pct: 80,
            high_watermark_pct: 80,
            low_watermark_pct: 60,
            range_enabled: false,
            commit_mode: CommitMode::None,
            writeback_retry_capacity: 10_000,
            gc_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.drives.is_empty() {
            return Err(CacheError::config("at least one cache drive is required"));
        }
        if !(1..=100).contains(&self.quota_pct) {
            return Err(CacheError::config(format!(
                "quota_pct must be in [1, 100], got {}",
                self.quota_pct
            )));
        }
        if self.high_watermark_pct == 0 || self.high_watermark_pct > 100 {
            return Err(CacheError::config(format!(
                "high_watermark_pct must be in [1, 100], got {}",
                self.high_watermark_pct
            )));
        }
        if self.low_watermark_pct >= self.high_watermark_pct {
            return Err(CacheError::config(format!(
                "low_watermark_pct ({}) must be below high_watermark_pct ({})",
                self.low_watermark_pct, self.high_watermark_pct
            )));
        }
        if self.writeback_retry_capacity == 0 {
            return Err(CacheError::config(
                "writeback_retry_capacity must be non-zero",
            ));
        }
        for pattern in &self.exclude {
            if let Err(err) = glob::Pattern::new(pattern) {
                return Err(CacheError::config(format!(
                    "invalid exclude pattern {pattern:?}: {err}"
                )));
            }
        }
        Ok(())
    }

    /// Compiled exclude patterns; call after `validate`.
    pub(crate) fn compiled_excludes(&self) -> Vec<glob::Pattern> {
        self.exclude
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect()
    }
}
