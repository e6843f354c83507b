use std::time::{SystemTime, UNIX_EPOCH};

/// Injected time source.
///
/// The cache makes freshness and eviction decisions from wall-clock time;
/// routing those reads through a trait keeps the decisions deterministic in
/// tests.
pub trait Clock: Send + Sync {
    /// Milliseconds since the unix epoch.
    fn now_millis(&self) -> u64;
}

/// The real system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as u64,
            // A clock set before 1970 degrades every entry to "infinitely
            // old" rather than panicking in a hot path.
            Err(_) => 0,
        }
    }
}
