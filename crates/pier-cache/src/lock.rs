use crate::error::{CacheError, Result};
use fs2::FileExt as _;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard for the per-key write lock; released on drop, on every exit path.
pub type KeyLockGuard = OwnedMutexGuard<()>;

const LOCK_SHARDS: usize = 64;

/// Sharded table of per-key async locks.
///
/// Writers take the key's lock for the duration of a duplex-streamed write or
/// a metadata patch; readers never do. The table is lazily populated and
/// opportunistically pruned: a key's slot is dropped once nobody outside the
/// table holds it.
#[derive(Debug)]
pub struct KeyLockTable {
    shards: Vec<parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Default for KeyLockTable {
    fn default() -> Self {
        Self {
            shards: (0..LOCK_SHARDS)
                .map(|_| parking_lot::Mutex::new(HashMap::new()))
                .collect(),
        }
    }
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for `(bucket, object)`.
    ///
    /// The returned guard owns the underlying mutex and may be held across
    /// await points.
    pub async fn lock_exclusive(&self, bucket: &str, object: &str) -> KeyLockGuard {
        let key = format!("{bucket}/{object}");
        let slot = {
            let mut shard = self.shards[self.shard_index(&key)].lock();
            // Drop slots nobody is waiting on; without this the table grows
            // with every key ever written.
            shard.retain(|_, arc| Arc::strong_count(arc) > 1);
            Arc::clone(shard.entry(key).or_default())
        };
        slot.lock_owned().await
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % LOCK_SHARDS as u64) as usize
    }
}

/// Cross-process ownership lock for one drive root.
///
/// `fs2` file locks are advisory and process-scoped; holding this for the
/// lifetime of a `DriveCache` prevents two pier processes from garbage
/// collecting the same directory out from under each other. In-process
/// exclusion is the `KeyLockTable`'s job.
#[derive(Debug)]
pub struct DriveOwnerLock {
    file: File,
    path: PathBuf,
}

impl DriveOwnerLock {
    pub const FILENAME: &'static str = ".pier.lock";

    /// Try to take ownership of `root`. Fails fast (without blocking) when
    /// another process already owns it.
    pub fn acquire(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(Self::FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        if let Err(err) = file.try_lock_exclusive() {
            return Err(CacheError::config(format!(
                "cache drive {} is owned by another process: {err}",
                root.display()
            )));
        }

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DriveOwnerLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
