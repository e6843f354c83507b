use std::path::Path;

/// Cache lifecycle events of interest to metrics / audit sinks.
#[derive(Clone, Copy, Debug)]
pub enum CacheEvent<'a> {
    Hit {
        bucket: &'a str,
        object: &'a str,
        bytes: u64,
    },
    Miss {
        bucket: &'a str,
        object: &'a str,
    },
    /// The request skipped the cache entirely (excluded, encrypted, locked,
    /// migrating, or no drive available).
    Bypass {
        bucket: &'a str,
        object: &'a str,
        reason: &'static str,
    },
    /// A cache fill completed and the entry is now served locally.
    Filled {
        bucket: &'a str,
        object: &'a str,
        bytes: u64,
    },
    Evicted {
        drive: &'a Path,
        bytes: u64,
    },
    WritebackComplete {
        bucket: &'a str,
        object: &'a str,
    },
    WritebackFailed {
        bucket: &'a str,
        object: &'a str,
        retries: u32,
    },
}

/// Injected sink for cache events. Implementations must be cheap and
/// non-blocking; they run inline on request paths.
pub trait Observer: Send + Sync {
    fn record(&self, event: CacheEvent<'_>);
}

/// Observer that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn record(&self, _event: CacheEvent<'_>) {}
}
