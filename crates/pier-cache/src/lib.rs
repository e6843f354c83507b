//! Disk cache layer for a remote object store.
//!
//! Pier keeps frequently-referenced objects on local fast drives and serves
//! reads from there when HTTP cache-control semantics allow it, streaming
//! misses from the backend to the client and the cache at the same time.
//! PUTs can be cached write-through (backend ack gates the response) or
//! write-back (cache ack gates the response, the upload is asynchronous and
//! retried). Disk usage is bounded by a quota with high/low watermarks and a
//! scored eviction pass.

mod cache_control;
mod config;
mod drive;
mod error;
mod gc;
mod layer;
mod layout;
mod lock;
mod meta;
mod migrate;
mod placement;
mod scorer;
mod stats;
mod stream;
mod util;
mod writeback;

pub use cache_control::{writeback_in_progress, CacheControl};
pub use config::{CacheConfig, CommitMode};
pub use drive::{CacheReader, DiskUsage, DriveCache, DriveOptions, PutOptions};
pub use error::{CacheError, Result};
pub use gc::{run_gc_with_target, run_watermark_gc, GcError, GcReport};
pub use layer::{CacheLayer, CacheStatus, GetOptions, GetResult};
pub use layout::{DriveLayout, KeyHash};
pub use meta::{
    DriveFormat, ObjectMeta, PartsIndex, WritebackStatus, FORMAT_SCHEMA_VERSION,
    META_SCHEMA_VERSION,
};
pub use placement::Placement;
pub use scorer::Scorer;
pub use stats::{CacheStats, DriveUsage, StatsSnapshot, UsageState};
