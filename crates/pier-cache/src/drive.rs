use crate::error::{CacheError, Result};
use crate::layout::{DriveLayout, KeyHash};
use crate::lock::{DriveOwnerLock, KeyLockGuard, KeyLockTable};
use crate::meta::{DriveFormat, ObjectMeta, PartsIndex, WritebackStatus, BLOB_FILENAME};
use crate::util::{
    atomic_write, open_unique_tmp_file, read_meta_file, remove_dir_best_effort,
    remove_file_best_effort, sync_dir_best_effort,
};
use pier_core::{ByteRange, Clock, CompletedPart, ObjectInfo, PartInfo};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;

/// Per-drive tuning, carved out of the top-level cache config.
#[derive(Clone, Copy, Debug)]
pub struct DriveOptions {
    pub quota_pct: u8,
    pub high_watermark_pct: u8,
    pub low_watermark_pct: u8,
}

/// Disk usage of the filesystem backing one drive, with the derived quota
/// and watermark byte thresholds.
#[derive(Clone, Copy, Debug)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub quota: u64,
    pub high_watermark: u64,
    pub low_watermark: u64,
}

/// An open cache read: the byte stream plus the entry metadata backing it.
pub struct CacheReader {
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
    pub meta: ObjectMeta,
    /// Bytes this reader will yield (range length for ranged reads).
    pub bytes: u64,
}

/// Options for storing an object (or a discrete range of one) on a drive.
#[derive(Clone, Debug)]
pub struct PutOptions {
    pub info: ObjectInfo,
    pub range: Option<ByteRange>,
    pub pending_writeback: bool,
}

/// A single cache drive: one directory root on one disk.
///
/// The drive exclusively owns every file beneath its root. All mutation goes
/// through temp-file + rename publishes, so concurrent readers never observe
/// partially written blobs or metadata.
pub struct DriveCache {
    layout: DriveLayout,
    opts: DriveOptions,
    clock: Arc<dyn Clock>,
    locks: KeyLockTable,
    online: AtomicBool,
    migrating: AtomicBool,
    gc_trigger: Notify,
    _owner: DriveOwnerLock,
}

impl std::fmt::Debug for DriveCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveCache")
            .field("root", &self.layout.root())
            .field("online", &self.is_online())
            .field("migrating", &self.is_migrating())
            .finish()
    }
}

impl DriveCache {
    /// Open (or initialize) a cache drive at `root`.
    ///
    /// A fresh directory gets a current format marker. A directory with a
    /// legacy marker comes up in the `migrating` state and must be migrated
    /// before it serves cache traffic. An unreadable marker is an error; the
    /// caller treats the slot as absent.
    pub async fn new(
        root: &Path,
        opts: DriveOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(root).await?;
        let owner = DriveOwnerLock::acquire(root)?;
        let layout = DriveLayout::new(root);
        tokio::fs::create_dir_all(layout.tmp_dir()).await?;

        let format_path = layout.format_path();
        let format = match read_meta_file(&format_path).await {
            Some(bytes) => serde_json::from_slice::<DriveFormat>(&bytes).map_err(|err| {
                CacheError::corrupt(format!(
                    "unreadable format marker at {}: {err}",
                    format_path.display()
                ))
            })?,
            None => {
                let format = DriveFormat::new(clock.now_millis());
                let json = serde_json::to_vec_pretty(&format)?;
                atomic_write(&format_path, &layout.tmp_dir(), &json).await?;
                format
            }
        };

        if !format.is_current() && !format.needs_migration() {
            return Err(CacheError::corrupt(format!(
                "unsupported cache format version {} at {}",
                format.schema_version,
                root.display()
            )));
        }

        let migrating = format.needs_migration();
        if migrating {
            tracing::info!(
                target = "pier.cache",
                drive = %root.display(),
                from_version = format.schema_version,
                "cache drive uses a legacy format; migration required"
            );
        }

        Ok(Arc::new(Self {
            layout,
            opts,
            clock,
            locks: KeyLockTable::new(),
            online: AtomicBool::new(true),
            migrating: AtomicBool::new(migrating),
            gc_trigger: Notify::new(),
            _owner: owner,
        }))
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub(crate) fn layout(&self) -> &DriveLayout {
        &self.layout
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::Acquire)
    }

    /// Mark migration finished and stamp the current format version.
    pub(crate) async fn finish_migration(&self) -> Result<()> {
        let format = DriveFormat::new(self.clock.now_millis());
        let json = serde_json::to_vec_pretty(&format)?;
        atomic_write(&self.layout.format_path(), &self.layout.tmp_dir(), &json).await?;
        self.migrating.store(false, Ordering::Release);
        Ok(())
    }

    /// A future that resolves when a watermark crossing queues a GC scan.
    pub(crate) async fn gc_triggered(&self) {
        self.gc_trigger.notified().await;
    }

    pub(crate) fn queue_gc(&self) {
        self.gc_trigger.notify_one();
    }

    /// Exclusive per-key writer lock; readers never take this.
    pub async fn lock_for_write(&self, bucket: &str, object: &str) -> KeyLockGuard {
        self.locks.lock_exclusive(bucket, object).await
    }

    /// Entry metadata without opening the blob.
    ///
    /// Corrupt entries (incompatible schema, blob/meta size mismatch) are
    /// deleted and reported as not found: corruption degrades to a miss.
    pub async fn stat(&self, bucket: &str, object: &str) -> Result<ObjectMeta> {
        let hash = KeyHash::of(bucket, object);
        self.load_valid_meta(bucket, object, &hash).await
    }

    pub async fn exists(&self, bucket: &str, object: &str) -> bool {
        self.stat(bucket, object).await.is_ok()
    }

    /// Open a reader over the cached content, refreshing the shadow access
    /// time as part of the handoff.
    pub async fn get(
        &self,
        bucket: &str,
        object: &str,
        range: Option<ByteRange>,
    ) -> Result<CacheReader> {
        let hash = KeyHash::of(bucket, object);
        let mut meta = self.load_valid_meta(bucket, object, &hash).await?;

        let blob_path = self.layout.blob_path(&hash);
        let have_blob = tokio::fs::try_exists(&blob_path).await.unwrap_or(false);

        let (stream, bytes): (Box<dyn AsyncRead + Send + Unpin>, u64) = match range {
            None => {
                if !have_blob {
                    return Err(CacheError::not_found(bucket, object));
                }
                let file = tokio::fs::File::open(&blob_path).await?;
                (Box::new(file), meta.info.size)
            }
            Some(range) => {
                if !range.fits_within(meta.info.size) {
                    return Err(CacheError::not_found(bucket, object));
                }
                if have_blob {
                    // Serve the sub-range out of the full blob.
                    let mut file = tokio::fs::File::open(&blob_path).await?;
                    file.seek(SeekFrom::Start(range.offset)).await?;
                    (Box::new(file.take(range.length)), range.length)
                } else if let Some(file_name) = meta.ranges.get(&range.to_string()) {
                    let path = self.layout.entry_dir(&hash).join(file_name);
                    let file = tokio::fs::File::open(&path).await?;
                    (Box::new(file.take(range.length)), range.length)
                } else {
                    return Err(CacheError::not_found(bucket, object));
                }
            }
        };

        // Shadow atime: refreshed on every read served from cache. The write
        // is best-effort; losing it must not fail the read.
        meta.touch(self.clock.now_millis());
        if let Err(err) = meta
            .save(&self.layout.meta_path(&hash), &self.layout.tmp_dir())
            .await
        {
            tracing::debug!(
                target = "pier.cache",
                bucket,
                object,
                error = %err,
                "failed to refresh access time on cache read"
            );
        }

        Ok(CacheReader {
            stream,
            meta,
            bytes,
        })
    }

    /// Store a blob (full object or discrete range) plus its metadata.
    ///
    /// The blob lands in the tmp tree first and is renamed into place, so a
    /// crash mid-write leaves only collectable garbage.
    pub async fn put(
        &self,
        bucket: &str,
        object: &str,
        reader: impl AsyncRead + Unpin,
        size: u64,
        opts: PutOptions,
    ) -> Result<ObjectMeta> {
        if !self.disk_space_available(size) {
            return Err(CacheError::DiskFull {
                drive: self.layout.root().to_path_buf(),
            });
        }

        let hash = KeyHash::of(bucket, object);
        let entry_dir = self.layout.entry_dir(&hash);
        tokio::fs::create_dir_all(&entry_dir).await?;

        let (tmp_path, mut file) =
            open_unique_tmp_file(&self.layout.tmp_dir(), BLOB_FILENAME).await?;
        let copied = {
            let mut limited = reader.take(size);
            match tokio::io::copy(&mut limited, &mut file).await {
                Ok(copied) => copied,
                Err(err) => {
                    drop(file);
                    remove_file_best_effort(&tmp_path, "put.copy_failed").await;
                    return Err(err.into());
                }
            }
        };
        if copied != size {
            drop(file);
            remove_file_best_effort(&tmp_path, "put.short_input").await;
            return Err(CacheError::corrupt(format!(
                "short cache write for {bucket}/{object}: got {copied} of {size} bytes"
            )));
        }
        if let Err(err) = file.sync_all().await {
            drop(file);
            remove_file_best_effort(&tmp_path, "put.sync_failed").await;
            return Err(err.into());
        }
        drop(file);

        let dest = match opts.range {
            None => self.layout.blob_path(&hash),
            Some(range) => self.layout.range_blob_path(&hash, range),
        };
        if let Err(err) = tokio::fs::rename(&tmp_path, &dest).await {
            remove_file_best_effort(&tmp_path, "put.rename_failed").await;
            return Err(err.into());
        }
        sync_dir_best_effort(&entry_dir).await;

        // Preserve the hit counter across refills of the same key.
        let now = self.clock.now_millis();
        let meta_path = self.layout.meta_path(&hash);
        let mut meta = match ObjectMeta::load(&meta_path).await {
            Some(existing) if existing.is_compatible() => {
                let mut meta = existing;
                meta.info = opts.info.clone();
                meta
            }
            _ => ObjectMeta::new(opts.info.clone(), now),
        };
        meta.touch(now);

        match opts.range {
            None => {
                // The full blob supersedes any discrete range files.
                for file_name in std::mem::take(&mut meta.ranges).into_values() {
                    remove_file_best_effort(&entry_dir.join(file_name), "put.stale_range").await;
                }
            }
            Some(range) => {
                meta.ranges
                    .insert(range.to_string(), DriveLayout::range_blob_name(range));
            }
        }

        if opts.pending_writeback {
            meta.set_writeback(WritebackStatus::Pending)?;
        }

        meta.save(&meta_path, &self.layout.tmp_dir()).await?;
        Ok(meta)
    }

    /// Metadata-only update: bump the hit counter, replace the recorded
    /// object info after a server-side change, and/or record a write-back
    /// transition.
    ///
    /// With `incremental_hit` and no existing entry, a meta-only counter
    /// entry is created so the access threshold survives across requests.
    pub async fn save_meta(
        &self,
        bucket: &str,
        object: &str,
        info: Option<&ObjectInfo>,
        incremental_hit: bool,
        writeback: Option<WritebackStatus>,
    ) -> Result<ObjectMeta> {
        let hash = KeyHash::of(bucket, object);
        let meta_path = self.layout.meta_path(&hash);
        let now = self.clock.now_millis();

        let mut meta = match ObjectMeta::load(&meta_path).await {
            Some(existing) if existing.is_compatible() => existing,
            Some(_) => {
                self.delete_entry(&hash).await;
                return Err(CacheError::not_found(bucket, object));
            }
            None => {
                if !incremental_hit {
                    return Err(CacheError::not_found(bucket, object));
                }
                let info = match info {
                    Some(info) => info.clone(),
                    None => ObjectInfo {
                        bucket: bucket.to_string(),
                        object: object.to_string(),
                        ..ObjectInfo::default()
                    },
                };
                ObjectMeta::new(info, now)
            }
        };

        if let Some(info) = info {
            meta.info = info.clone();
        }
        if incremental_hit {
            meta.record_hit();
        }
        if let Some(status) = writeback {
            meta.set_writeback(status)?;
        }
        meta.touch(now);

        meta.save(&meta_path, &self.layout.tmp_dir()).await?;
        Ok(meta)
    }

    /// Synchronous delete of blob + metadata. Idempotent.
    pub async fn delete(&self, bucket: &str, object: &str) -> Result<()> {
        let hash = KeyHash::of(bucket, object);
        self.delete_entry(&hash).await;
        Ok(())
    }

    async fn delete_entry(&self, hash: &KeyHash) {
        let dir = self.layout.entry_dir(hash);
        remove_dir_best_effort(&dir, "delete_entry").await;
    }

    // ---- multipart staging ----

    pub async fn new_multipart(&self, bucket: &str, object: &str, upload_id: &str) -> Result<()> {
        let hash = KeyHash::of(bucket, object);
        let dir = self.layout.parts_dir(&hash, upload_id);
        tokio::fs::create_dir_all(&dir).await?;

        let index = PartsIndex::new(upload_id, self.clock.now_millis());
        let json = serde_json::to_vec_pretty(&index)?;
        atomic_write(
            &self.layout.parts_index_path(&hash, upload_id),
            &self.layout.tmp_dir(),
            &json,
        )
        .await
    }

    /// Stage one part's bytes. The part's backend identity is recorded
    /// separately via `save_part_meta` once the backend acks it.
    pub async fn put_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: u16,
        reader: impl AsyncRead + Unpin,
        size: u64,
    ) -> Result<()> {
        if !self.disk_space_available(size) {
            return Err(CacheError::DiskFull {
                drive: self.layout.root().to_path_buf(),
            });
        }

        let hash = KeyHash::of(bucket, object);
        if self.load_parts_index(&hash, upload_id).await.is_none() {
            return Err(CacheError::not_found(bucket, object));
        }

        let label = format!("part.{part_number}");
        let (tmp_path, mut file) = open_unique_tmp_file(&self.layout.tmp_dir(), &label).await?;
        let mut limited = reader.take(size);
        let copied = match tokio::io::copy(&mut limited, &mut file).await {
            Ok(copied) => copied,
            Err(err) => {
                drop(file);
                remove_file_best_effort(&tmp_path, "put_part.copy_failed").await;
                return Err(err.into());
            }
        };
        if copied != size {
            drop(file);
            remove_file_best_effort(&tmp_path, "put_part.short_input").await;
            return Err(CacheError::corrupt(format!(
                "short part write for {bucket}/{object} part {part_number}"
            )));
        }
        file.sync_all().await?;
        drop(file);

        let dest = self.layout.part_path(&hash, upload_id, part_number);
        if let Err(err) = tokio::fs::rename(&tmp_path, &dest).await {
            remove_file_best_effort(&tmp_path, "put_part.rename_failed").await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Record the backend's identity for a staged part.
    pub async fn save_part_meta(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part: PartInfo,
    ) -> Result<()> {
        let hash = KeyHash::of(bucket, object);
        let mut index = self
            .load_parts_index(&hash, upload_id)
            .await
            .ok_or_else(|| CacheError::not_found(bucket, object))?;
        index.upsert_part(part);

        let json = serde_json::to_vec_pretty(&index)?;
        atomic_write(
            &self.layout.parts_index_path(&hash, upload_id),
            &self.layout.tmp_dir(),
            &json,
        )
        .await
    }

    /// Assemble staged parts into the entry blob and drop the staging tree.
    ///
    /// Every referenced part must be staged with a matching etag; any
    /// mismatch aborts the assembly (the backend's completed object is still
    /// authoritative, the cache just misses).
    pub async fn complete_multipart(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        info: &ObjectInfo,
    ) -> Result<ObjectMeta> {
        let hash = KeyHash::of(bucket, object);
        let index = self
            .load_parts_index(&hash, upload_id)
            .await
            .ok_or_else(|| CacheError::not_found(bucket, object))?;

        let (tmp_path, mut file) =
            open_unique_tmp_file(&self.layout.tmp_dir(), BLOB_FILENAME).await?;
        let mut assembled = 0u64;

        let assemble = async {
            for part in parts {
                let staged = index.find_part(part.part_number).ok_or_else(|| {
                    CacheError::corrupt(format!(
                        "part {} missing from staging for {bucket}/{object}",
                        part.part_number
                    ))
                })?;
                if staged.etag != part.etag {
                    return Err(CacheError::corrupt(format!(
                        "part {} etag mismatch for {bucket}/{object}",
                        part.part_number
                    )));
                }

                let path = self.layout.part_path(&hash, upload_id, part.part_number);
                let mut part_file = tokio::fs::File::open(&path).await?;
                assembled += tokio::io::copy(&mut part_file, &mut file).await?;
            }
            file.sync_all().await?;
            Ok::<(), CacheError>(())
        }
        .await;
        drop(file);

        let staging_dir = self.layout.parts_dir(&hash, upload_id);
        if let Err(err) = assemble {
            remove_file_best_effort(&tmp_path, "complete_multipart.failed").await;
            remove_dir_best_effort(&staging_dir, "complete_multipart.failed").await;
            return Err(err);
        }

        if assembled != info.size {
            remove_file_best_effort(&tmp_path, "complete_multipart.size_mismatch").await;
            remove_dir_best_effort(&staging_dir, "complete_multipart.size_mismatch").await;
            return Err(CacheError::corrupt(format!(
                "assembled {assembled} bytes for {bucket}/{object}, backend reports {}",
                info.size
            )));
        }

        let blob_path = self.layout.blob_path(&hash);
        if let Err(err) = tokio::fs::rename(&tmp_path, &blob_path).await {
            remove_file_best_effort(&tmp_path, "complete_multipart.rename_failed").await;
            remove_dir_best_effort(&staging_dir, "complete_multipart.rename_failed").await;
            return Err(err.into());
        }
        sync_dir_best_effort(&self.layout.entry_dir(&hash)).await;
        remove_dir_best_effort(&staging_dir, "complete_multipart.cleanup").await;

        let now = self.clock.now_millis();
        let meta_path = self.layout.meta_path(&hash);
        let mut meta = match ObjectMeta::load(&meta_path).await {
            Some(existing) if existing.is_compatible() => {
                let mut meta = existing;
                meta.info = info.clone();
                meta.ranges.clear();
                meta
            }
            _ => ObjectMeta::new(info.clone(), now),
        };
        meta.touch(now);
        meta.save(&meta_path, &self.layout.tmp_dir()).await?;
        Ok(meta)
    }

    /// Drop the staging tree for an aborted upload. The entry itself (if any
    /// committed content exists) is untouched.
    pub async fn abort_upload(&self, bucket: &str, object: &str, upload_id: &str) -> Result<()> {
        let hash = KeyHash::of(bucket, object);
        remove_dir_best_effort(&self.layout.parts_dir(&hash, upload_id), "abort_upload").await;

        // If the abort leaves a bare entry directory behind, collect it.
        let entry_dir = self.layout.entry_dir(&hash);
        let meta_exists = tokio::fs::try_exists(self.layout.meta_path(&hash))
            .await
            .unwrap_or(false);
        if !meta_exists {
            remove_dir_best_effort(&entry_dir, "abort_upload.bare_entry").await;
        }
        Ok(())
    }

    // ---- disk usage / watermarks ----

    pub fn disk_usage(&self) -> Result<DiskUsage> {
        let root = self.layout.root();
        let total = fs2::total_space(root)?;
        let free = fs2::available_space(root)?;
        let used = total.saturating_sub(free);
        let quota = total / 100 * self.opts.quota_pct as u64;
        Ok(DiskUsage {
            total,
            free,
            used,
            quota,
            high_watermark: quota / 100 * self.opts.high_watermark_pct as u64,
            low_watermark: quota / 100 * self.opts.low_watermark_pct as u64,
        })
    }

    /// Whether `want` more bytes fit under the high watermark.
    ///
    /// Crossing the watermark queues a GC scan as a side effect; the caller
    /// skips caching but the request itself proceeds against the backend.
    pub fn disk_space_available(&self, want: u64) -> bool {
        match self.disk_usage() {
            Ok(usage) => {
                let projected = usage.used.saturating_add(want);
                if projected > usage.high_watermark {
                    self.queue_gc();
                    false
                } else {
                    true
                }
            }
            Err(err) => {
                tracing::debug!(
                    target = "pier.cache",
                    drive = %self.layout.root().display(),
                    error = %err,
                    "failed to stat drive usage"
                );
                false
            }
        }
    }

    pub fn storage_info(&self) -> Result<(u64, u64, u64)> {
        let usage = self.disk_usage()?;
        Ok((usage.total, usage.free, usage.used))
    }

    // ---- helpers ----

    async fn load_valid_meta(
        &self,
        bucket: &str,
        object: &str,
        hash: &KeyHash,
    ) -> Result<ObjectMeta> {
        let meta_path = self.layout.meta_path(hash);
        let Some(meta) = ObjectMeta::load(&meta_path).await else {
            return Err(CacheError::not_found(bucket, object));
        };
        if !meta.is_compatible() {
            tracing::debug!(
                target = "pier.cache",
                bucket,
                object,
                schema_version = meta.schema_version,
                "dropping cache entry with incompatible schema"
            );
            self.delete_entry(hash).await;
            return Err(CacheError::not_found(bucket, object));
        }

        // A blob whose length disagrees with its metadata is corrupt; drop
        // the entry rather than serve truncated bytes.
        let blob_path = self.layout.blob_path(hash);
        match tokio::fs::metadata(&blob_path).await {
            Ok(blob) => {
                if blob.len() != meta.info.size {
                    tracing::warn!(
                        target = "pier.cache",
                        bucket,
                        object,
                        blob_len = blob.len(),
                        meta_size = meta.info.size,
                        "cache blob size mismatch; deleting entry"
                    );
                    self.delete_entry(hash).await;
                    return Err(CacheError::not_found(bucket, object));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(meta)
    }

    pub(crate) async fn load_parts_index(
        &self,
        hash: &KeyHash,
        upload_id: &str,
    ) -> Option<PartsIndex> {
        let path = self.layout.parts_index_path(hash, upload_id);
        let bytes = read_meta_file(&path).await?;
        match serde_json::from_slice::<PartsIndex>(&bytes) {
            Ok(index) => Some(index),
            Err(err) => {
                tracing::debug!(
                    target = "pier.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to decode parts index"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pier_core::SystemClock;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    fn opts() -> DriveOptions {
        DriveOptions {
            quota_pct: 100,
            high_watermark_pct: 99,
            low_watermark_pct: 60,
        }
    }

    fn info(bucket: &str, object: &str, bytes: &[u8]) -> ObjectInfo {
        ObjectInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            etag: Some(format!("etag-{}", bytes.len())),
            size: bytes.len() as u64,
            actual_size: bytes.len() as u64,
            mod_time_millis: 1_000,
            ..ObjectInfo::default()
        }
    }

    async fn put_full(drive: &DriveCache, bucket: &str, object: &str, bytes: &[u8]) -> ObjectMeta {
        drive
            .put(
                bucket,
                object,
                std::io::Cursor::new(bytes.to_vec()),
                bytes.len() as u64,
                PutOptions {
                    info: info(bucket, object, bytes),
                    range: None,
                    pending_writeback: false,
                },
            )
            .await
            .unwrap()
    }

    async fn read_all(reader: CacheReader) -> Vec<u8> {
        let mut stream = reader.stream;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        put_full(&drive, "b", "k", b"payload").await;
        let reader = drive.get("b", "k", None).await.unwrap();
        assert_eq!(reader.bytes, 7);
        assert_eq!(read_all(reader).await, b"payload");
        assert!(drive.exists("b", "k").await);
    }

    #[tokio::test]
    async fn ranged_get_from_full_blob() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        put_full(&drive, "b", "k", b"0123456789").await;
        let reader = drive
            .get("b", "k", Some(ByteRange::new(2, 4)))
            .await
            .unwrap();
        assert_eq!(read_all(reader).await, b"2345");

        // Out-of-bounds range is a miss, not a short read.
        assert!(drive.get("b", "k", Some(ByteRange::new(8, 5))).await.is_err());
    }

    #[tokio::test]
    async fn discrete_range_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        let full = info("b", "k", &[0u8; 100]);
        let range = ByteRange::new(10, 5);
        drive
            .put(
                "b",
                "k",
                std::io::Cursor::new(b"abcde".to_vec()),
                5,
                PutOptions {
                    info: full,
                    range: Some(range),
                    pending_writeback: false,
                },
            )
            .await
            .unwrap();

        let reader = drive.get("b", "k", Some(range)).await.unwrap();
        assert_eq!(read_all(reader).await, b"abcde");

        // A different range is not cached, and neither is the full object.
        assert!(drive.get("b", "k", Some(ByteRange::new(0, 5))).await.is_err());
        assert!(drive.get("b", "k", None).await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        put_full(&drive, "b", "k", b"x").await;
        drive.delete("b", "k").await.unwrap();
        assert!(!drive.exists("b", "k").await);
        drive.delete("b", "k").await.unwrap();
    }

    #[tokio::test]
    async fn incremental_hit_creates_counter_entry() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        let meta = drive.save_meta("b", "k", None, true, None).await.unwrap();
        assert_eq!(meta.hits, 1);
        let meta = drive.save_meta("b", "k", None, true, None).await.unwrap();
        assert_eq!(meta.hits, 2);

        // Counter entries have no content.
        assert!(drive.get("b", "k", None).await.is_err());
        assert!(drive.exists("b", "k").await);
    }

    #[tokio::test]
    async fn put_preserves_hit_counter() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        drive.save_meta("b", "k", None, true, None).await.unwrap();
        drive.save_meta("b", "k", None, true, None).await.unwrap();
        let meta = put_full(&drive, "b", "k", b"data").await;
        assert_eq!(meta.hits, 2);
    }

    #[tokio::test]
    async fn corrupt_blob_is_dropped_on_stat() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        put_full(&drive, "b", "k", b"payload").await;

        // Truncate the blob behind the drive's back.
        let hash = KeyHash::of("b", "k");
        let blob = drive.layout().blob_path(&hash);
        tokio::fs::write(&blob, b"pay").await.unwrap();

        assert!(drive.stat("b", "k").await.is_err());
        assert!(!drive.exists("b", "k").await);
    }

    #[tokio::test]
    async fn writeback_put_marks_pending() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        let meta = drive
            .put(
                "b",
                "k",
                std::io::Cursor::new(b"wb".to_vec()),
                2,
                PutOptions {
                    info: info("b", "k", b"wb"),
                    range: None,
                    pending_writeback: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(meta.writeback, WritebackStatus::Pending);

        let meta = drive
            .save_meta("b", "k", None, false, Some(WritebackStatus::Complete))
            .await
            .unwrap();
        assert_eq!(meta.writeback, WritebackStatus::Complete);
        assert_eq!(meta.writeback_retries, 0);
    }

    #[tokio::test]
    async fn multipart_assembles_in_part_order() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        drive.new_multipart("b", "k", "u1").await.unwrap();
        drive
            .put_part("b", "k", "u1", 2, std::io::Cursor::new(b"world".to_vec()), 5)
            .await
            .unwrap();
        drive
            .put_part("b", "k", "u1", 1, std::io::Cursor::new(b"hello ".to_vec()), 6)
            .await
            .unwrap();
        for (number, etag, size) in [(1u16, "e1", 6u64), (2, "e2", 5)] {
            drive
                .save_part_meta(
                    "b",
                    "k",
                    "u1",
                    PartInfo {
                        part_number: number,
                        etag: etag.to_string(),
                        size,
                        mod_time_millis: 0,
                    },
                )
                .await
                .unwrap();
        }

        let completed = vec![
            CompletedPart {
                part_number: 1,
                etag: "e1".to_string(),
            },
            CompletedPart {
                part_number: 2,
                etag: "e2".to_string(),
            },
        ];
        let final_info = info("b", "k", b"hello world");
        drive
            .complete_multipart("b", "k", "u1", &completed, &final_info)
            .await
            .unwrap();

        let reader = drive.get("b", "k", None).await.unwrap();
        assert_eq!(read_all(reader).await, b"hello world");

        // Staging tree is gone.
        let hash = KeyHash::of("b", "k");
        assert!(!drive.layout().parts_dir(&hash, "u1").exists());
    }

    #[tokio::test]
    async fn abort_upload_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        drive.new_multipart("b", "k", "u1").await.unwrap();
        drive
            .put_part("b", "k", "u1", 1, std::io::Cursor::new(b"x".to_vec()), 1)
            .await
            .unwrap();
        drive.abort_upload("b", "k", "u1").await.unwrap();

        let hash = KeyHash::of("b", "k");
        assert!(!drive.layout().parts_dir(&hash, "u1").exists());
        assert!(!drive.layout().entry_dir(&hash).exists());
    }

    #[tokio::test]
    async fn etag_mismatch_fails_multipart_complete() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(dir.path(), opts(), clock()).await.unwrap();

        drive.new_multipart("b", "k", "u1").await.unwrap();
        drive
            .put_part("b", "k", "u1", 1, std::io::Cursor::new(b"x".to_vec()), 1)
            .await
            .unwrap();
        drive
            .save_part_meta(
                "b",
                "k",
                "u1",
                PartInfo {
                    part_number: 1,
                    etag: "staged".to_string(),
                    size: 1,
                    mod_time_millis: 0,
                },
            )
            .await
            .unwrap();

        let completed = vec![CompletedPart {
            part_number: 1,
            etag: "different".to_string(),
        }];
        let err = drive
            .complete_multipart("b", "k", "u1", &completed, &info("b", "k", b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }
}
