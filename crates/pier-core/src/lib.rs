//! Core shared types for Pier.
//!
//! This crate is intentionally small: it holds the vocabulary the cache layer
//! and its collaborators (backend object layer, metrics, tests) agree on,
//! without pulling in any of the cache implementation.

mod backend;
mod clock;
mod object;
mod observer;
mod range;

pub use backend::{
    Backend, BackendError, CompletedPart, ObjectBody, ObjectReader, PartInfo, PutObjectOptions,
};
pub use clock::{Clock, SystemClock};
pub use object::{
    metadata_value, ObjectInfo, AMZ_OBJECT_LOCK_LEGAL_HOLD, AMZ_OBJECT_LOCK_MODE,
    AMZ_SSE_C_ALGORITHM, AMZ_SSE_C_KEY, HDR_CACHE_CONTROL, HDR_EXPIRES,
};
pub use observer::{CacheEvent, NoopObserver, Observer};
pub use range::ByteRange;
