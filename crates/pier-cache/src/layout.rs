use crate::meta::{BLOB_FILENAME, FORMAT_FILENAME, META_FILENAME, PARTS_INDEX_FILENAME};
use pier_core::ByteRange;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Stable fingerprint of a `(bucket, object)` key.
///
/// One hash serves both concerns that need determinism across runs: the
/// on-disk entry path and the placement slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyHash {
    hex: String,
    prefix: u64,
}

impl KeyHash {
    pub fn of(bucket: &str, object: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bucket.as_bytes());
        hasher.update(b"/");
        hasher.update(object.as_bytes());
        let digest = hasher.finalize();

        let mut prefix_bytes = [0u8; 8];
        prefix_bytes.copy_from_slice(&digest[..8]);

        Self {
            hex: hex::encode(digest),
            prefix: u64::from_be_bytes(prefix_bytes),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// Primary placement slot for a set of `drive_count` drives.
    pub fn placement_slot(&self, drive_count: usize) -> usize {
        debug_assert!(drive_count > 0);
        (self.prefix % drive_count as u64) as usize
    }
}

/// Deterministic path scheme beneath one drive root.
///
/// ```text
/// <root>/format.json
/// <root>/tmp/...                      in-flight writes
/// <root>/<hex[0..2]>/<hex>/blob       full-object blob
/// <root>/<hex[0..2]>/<hex>/blob.A-B   discrete range blob
/// <root>/<hex[0..2]>/<hex>/meta.json
/// <root>/<hex[0..2]>/<hex>/parts/<upload-id>/part.<n>
/// <root>/<hex[0..2]>/<hex>/parts/<upload-id>/parts.json
/// ```
#[derive(Clone, Debug)]
pub struct DriveLayout {
    root: PathBuf,
}

impl DriveLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format_path(&self) -> PathBuf {
        self.root.join(FORMAT_FILENAME)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn entry_dir(&self, hash: &KeyHash) -> PathBuf {
        self.root.join(&hash.as_str()[..2]).join(hash.as_str())
    }

    pub fn meta_path(&self, hash: &KeyHash) -> PathBuf {
        self.entry_dir(hash).join(META_FILENAME)
    }

    pub fn blob_path(&self, hash: &KeyHash) -> PathBuf {
        self.entry_dir(hash).join(BLOB_FILENAME)
    }

    pub fn range_blob_name(range: ByteRange) -> String {
        format!("{BLOB_FILENAME}.{range}")
    }

    pub fn range_blob_path(&self, hash: &KeyHash, range: ByteRange) -> PathBuf {
        self.entry_dir(hash).join(Self::range_blob_name(range))
    }

    pub fn parts_dir(&self, hash: &KeyHash, upload_id: &str) -> PathBuf {
        self.entry_dir(hash).join("parts").join(upload_id)
    }

    pub fn part_path(&self, hash: &KeyHash, upload_id: &str, part_number: u16) -> PathBuf {
        self.parts_dir(hash, upload_id)
            .join(format!("part.{part_number}"))
    }

    pub fn parts_index_path(&self, hash: &KeyHash, upload_id: &str) -> PathBuf {
        self.parts_dir(hash, upload_id).join(PARTS_INDEX_FILENAME)
    }
}
