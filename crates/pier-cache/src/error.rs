use pier_core::BackendError;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the cache layer.
///
/// Per the propagation policy, most of these never reach a caller: cache-path
/// failures degrade to backend reads (or to uncached writes) and are logged.
/// They surface only when the cache is the sole source of truth.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("object {bucket}/{object} not found")]
    NotFound { bucket: String, object: String },

    #[error("backend unreachable: {message}")]
    BackendDown { message: String },

    #[error("no cache drive available")]
    DriveOffline,

    #[error("insufficient space on cache drive {drive}")]
    DiskFull { drive: PathBuf },

    #[error("cached etag {cached} diverged from backend etag {backend}")]
    IntegrityMismatch { cached: String, backend: String },

    #[error("cache entry corrupt: {reason}")]
    Corrupt { reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("object is encrypted with a client-supplied key")]
    Encrypted,

    #[error("object is under retention or legal hold")]
    Locked,

    #[error("invalid cache configuration: {reason}")]
    Config { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(BackendError),
}

impl CacheError {
    pub fn not_found(bucket: &str, object: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            object: object.to_string(),
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<BackendError> for CacheError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound { bucket, object } => Self::NotFound { bucket, object },
            BackendError::Unreachable { message } => Self::BackendDown { message },
            other => Self::Backend(other),
        }
    }
}
