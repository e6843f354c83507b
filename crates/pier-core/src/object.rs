use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// SSE-C request header: client-supplied encryption algorithm.
pub const AMZ_SSE_C_ALGORITHM: &str = "x-amz-server-side-encryption-customer-algorithm";
/// SSE-C request header: client-supplied encryption key.
pub const AMZ_SSE_C_KEY: &str = "x-amz-server-side-encryption-customer-key";
/// Object-lock retention mode metadata key.
pub const AMZ_OBJECT_LOCK_MODE: &str = "x-amz-object-lock-mode";
/// Object-lock legal hold metadata key.
pub const AMZ_OBJECT_LOCK_LEGAL_HOLD: &str = "x-amz-object-lock-legal-hold";

pub const HDR_CACHE_CONTROL: &str = "cache-control";
pub const HDR_EXPIRES: &str = "expires";

/// Case-insensitive lookup into a user-defined metadata map.
///
/// Object-store metadata keys are case-insensitive on the wire but are stored
/// however the client sent them; lookups must not depend on casing.
pub fn metadata_value<'a>(user_defined: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    user_defined
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Descriptor for one object version as reported by the backend (or recorded
/// in cache metadata).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub object: String,
    /// Backend entity tag. Absent for objects the backend has never acked.
    pub etag: Option<String>,
    /// Stored size in bytes (post content-encoding).
    pub size: u64,
    /// Size before any content-encoding was applied.
    pub actual_size: u64,
    /// Last-modified time, milliseconds since the unix epoch.
    pub mod_time_millis: u64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Absolute expiry from the `Expires` header, if the object carries one.
    pub expires_millis: Option<u64>,
    /// Arbitrary user-defined metadata (`x-amz-meta-*` and friends).
    pub user_defined: BTreeMap<String, String>,
    /// Version id this info was produced from, when the backend is versioned.
    pub version_id: Option<String>,
}

impl ObjectInfo {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        metadata_value(&self.user_defined, key)
    }

    /// Whether this object may legally be held in a cache.
    ///
    /// Objects encrypted with a client-supplied key cannot be served without
    /// the key, and objects under retention or legal hold must always be
    /// revalidated against the backend; neither is cache-eligible.
    pub fn is_cacheable(&self) -> bool {
        !self.is_client_encrypted() && !self.is_locked()
    }

    pub fn is_client_encrypted(&self) -> bool {
        self.metadata(AMZ_SSE_C_ALGORITHM).is_some() || self.metadata(AMZ_SSE_C_KEY).is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.metadata(AMZ_OBJECT_LOCK_MODE).is_some()
            || self
                .metadata(AMZ_OBJECT_LOCK_LEGAL_HOLD)
                .is_some_and(|v| v.eq_ignore_ascii_case("on"))
    }
}
