use crate::error::{CacheError, Result};
use crate::util::{atomic_write, read_meta_file};
use pier_core::{ObjectInfo, PartInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Schema version for entry metadata and the drive format marker.
///
/// Version 1 used a flat entry layout without the hex-prefix fanout; drives
/// carrying it are migrated in place at startup.
pub const META_SCHEMA_VERSION: u32 = 2;
pub const FORMAT_SCHEMA_VERSION: u32 = 2;
pub const LEGACY_FORMAT_SCHEMA_VERSION: u32 = 1;

pub const FORMAT_FILENAME: &str = "format.json";
pub const META_FILENAME: &str = "meta.json";
pub const BLOB_FILENAME: &str = "blob";
pub const PARTS_INDEX_FILENAME: &str = "parts.json";

/// Progress of the asynchronous backend upload for a write-back entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritebackStatus {
    /// Entry was not created by a write-back PUT.
    #[default]
    None,
    /// Cache holds the object; the backend upload has not succeeded yet.
    Pending,
    /// Backend acked the upload.
    Complete,
    /// The last upload attempt failed; a retry will flip this back to
    /// pending.
    Failed,
}

impl WritebackStatus {
    /// Entries whose upload has not completed are served without
    /// revalidation: the backend may not have the object at all.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    /// Whether `next` is a legal transition from `self`.
    ///
    /// Within one upload attempt the status moves `pending → complete` or
    /// `pending → failed` exactly once; a retry opens a new attempt via
    /// `failed → pending`.
    pub fn can_transition_to(&self, next: WritebackStatus) -> bool {
        match (self, next) {
            (a, b) if *a == b => true,
            (Self::None, Self::Pending) => true,
            (Self::Pending, Self::Complete) => true,
            (Self::Pending, Self::Failed) => true,
            (Self::Failed, Self::Pending) => true,
            (Self::Failed, Self::Complete) => true,
            _ => false,
        }
    }
}

/// Versioned per-entry metadata, stored as JSON next to the blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub schema_version: u32,
    pub info: ObjectInfo,
    /// Lookup hits recorded for this key (also counted while the object is
    /// not yet cached, to drive the access threshold).
    pub hits: u32,
    /// Shadow access time; drives are commonly mounted noatime, so the cache
    /// keeps its own.
    pub accessed_at_millis: u64,
    pub writeback: WritebackStatus,
    pub writeback_retries: u32,
    /// Cached discrete ranges: range key (`offset-last`) → sibling file name.
    /// Empty when the full object blob is cached (or only meta exists).
    #[serde(default)]
    pub ranges: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(info: ObjectInfo, now_millis: u64) -> Self {
        Self {
            schema_version: META_SCHEMA_VERSION,
            info,
            hits: 0,
            accessed_at_millis: now_millis,
            writeback: WritebackStatus::None,
            writeback_retries: 0,
            ranges: BTreeMap::new(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.schema_version == META_SCHEMA_VERSION
    }

    pub fn record_hit(&mut self) {
        self.hits = self.hits.saturating_add(1);
    }

    pub fn touch(&mut self, now_millis: u64) {
        self.accessed_at_millis = self.accessed_at_millis.max(now_millis);
    }

    /// Apply a write-back transition, enforcing monotonicity.
    pub fn set_writeback(&mut self, next: WritebackStatus) -> Result<()> {
        if !self.writeback.can_transition_to(next) {
            return Err(CacheError::corrupt(format!(
                "illegal writeback transition {:?} -> {:?} for {}/{}",
                self.writeback, next, self.info.bucket, self.info.object
            )));
        }
        match next {
            WritebackStatus::Complete => {
                self.writeback = next;
                self.writeback_retries = 0;
            }
            WritebackStatus::Failed => {
                self.writeback = next;
                self.writeback_retries = self.writeback_retries.saturating_add(1);
            }
            _ => self.writeback = next,
        }
        Ok(())
    }

    pub async fn load(path: &Path) -> Option<Self> {
        let bytes = read_meta_file(path).await?;
        match serde_json::from_slice::<Self>(&bytes) {
            Ok(meta) => Some(meta),
            Err(err) => {
                tracing::debug!(
                    target = "pier.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to decode entry metadata"
                );
                None
            }
        }
    }

    pub async fn save(&self, path: &Path, tmp_dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(path, tmp_dir, &json).await
    }
}

/// Drive-root format marker. A drive without a readable marker is treated as
/// absent; a drive with a legacy version is migrated before use.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveFormat {
    pub schema_version: u32,
    pub created_at_millis: u64,
}

impl DriveFormat {
    pub fn new(now_millis: u64) -> Self {
        Self {
            schema_version: FORMAT_SCHEMA_VERSION,
            created_at_millis: now_millis,
        }
    }

    pub fn needs_migration(&self) -> bool {
        self.schema_version == LEGACY_FORMAT_SCHEMA_VERSION
    }

    pub fn is_current(&self) -> bool {
        self.schema_version == FORMAT_SCHEMA_VERSION
    }
}

/// Index of staged parts for one in-flight multipart upload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartsIndex {
    pub upload_id: String,
    pub created_at_millis: u64,
    /// Kept sorted by part number; re-uploading a part number replaces it.
    pub parts: Vec<PartInfo>,
}

impl PartsIndex {
    pub fn new(upload_id: &str, now_millis: u64) -> Self {
        Self {
            upload_id: upload_id.to_string(),
            created_at_millis: now_millis,
            parts: Vec::new(),
        }
    }

    pub fn upsert_part(&mut self, part: PartInfo) {
        match self
            .parts
            .binary_search_by_key(&part.part_number, |p| p.part_number)
        {
            Ok(i) => self.parts[i] = part,
            Err(i) => self.parts.insert(i, part),
        }
    }

    pub fn find_part(&self, part_number: u16) -> Option<&PartInfo> {
        self.parts
            .binary_search_by_key(&part_number, |p| p.part_number)
            .ok()
            .map(|i| &self.parts[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ObjectMeta {
        let info = ObjectInfo {
            bucket: "b".to_string(),
            object: "o".to_string(),
            etag: Some("abc".to_string()),
            size: 4,
            actual_size: 4,
            ..ObjectInfo::default()
        };
        ObjectMeta::new(info, 1_000)
    }

    #[test]
    fn writeback_transitions_are_monotonic_within_attempt() {
        let mut m = meta();
        m.set_writeback(WritebackStatus::Pending).unwrap();
        m.set_writeback(WritebackStatus::Failed).unwrap();
        assert_eq!(m.writeback_retries, 1);

        // New attempt.
        m.set_writeback(WritebackStatus::Pending).unwrap();
        m.set_writeback(WritebackStatus::Complete).unwrap();
        assert_eq!(m.writeback_retries, 0);

        // Completed entries never go back to pending.
        assert!(m.set_writeback(WritebackStatus::Pending).is_err());
    }

    #[test]
    fn none_cannot_complete_directly() {
        let mut m = meta();
        assert!(m.set_writeback(WritebackStatus::Complete).is_err());
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut m = meta();
        m.touch(5_000);
        m.touch(2_000);
        assert_eq!(m.accessed_at_millis, 5_000);
    }

    #[test]
    fn parts_index_upsert_replaces_by_number() {
        let mut index = PartsIndex::new("u1", 0);
        index.upsert_part(PartInfo {
            part_number: 2,
            etag: "a".to_string(),
            size: 1,
            mod_time_millis: 0,
        });
        index.upsert_part(PartInfo {
            part_number: 1,
            etag: "b".to_string(),
            size: 1,
            mod_time_millis: 0,
        });
        index.upsert_part(PartInfo {
            part_number: 2,
            etag: "c".to_string(),
            size: 2,
            mod_time_millis: 0,
        });

        let numbers: Vec<u16> = index.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(index.find_part(2).unwrap().etag, "c");
    }

    #[tokio::test]
    async fn meta_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let tmp = dir.path().join("tmp");

        let mut m = meta();
        m.record_hit();
        m.save(&path, &tmp).await.unwrap();

        let loaded = ObjectMeta::load(&path).await.unwrap();
        assert_eq!(loaded, m);
        assert!(loaded.is_compatible());
    }
}
