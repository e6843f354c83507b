//! Shared test doubles: a scripted in-memory backend and a manual clock.
#![allow(dead_code)]

use async_trait::async_trait;
use pier_core::{
    Backend, BackendError, ByteRange, Clock, CompletedPart, ObjectBody, ObjectInfo, ObjectReader,
    PartInfo, PutObjectOptions,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Deterministic, manually advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn at(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
struct StoredObject {
    bytes: Vec<u8>,
    etag: String,
    mod_time_millis: u64,
    content_type: Option<String>,
    content_encoding: Option<String>,
    user_defined: BTreeMap<String, String>,
}

impl StoredObject {
    fn info(&self, bucket: &str, object: &str) -> ObjectInfo {
        ObjectInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            etag: Some(self.etag.clone()),
            size: self.bytes.len() as u64,
            actual_size: self.bytes.len() as u64,
            mod_time_millis: self.mod_time_millis,
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            expires_millis: None,
            user_defined: self.user_defined.clone(),
            version_id: None,
        }
    }
}

/// In-memory backend with failure injection.
#[derive(Debug, Default)]
pub struct MockBackend {
    objects: parking_lot::Mutex<HashMap<(String, String), StoredObject>>,
    uploads: parking_lot::Mutex<HashMap<String, Vec<(u16, Vec<u8>, String)>>>,
    down: AtomicBool,
    next_upload_id: AtomicU64,
    mod_time: AtomicU64,
    get_calls: AtomicU64,
    put_calls: AtomicU64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            mod_time: AtomicU64::new(1_000),
            ..Self::default()
        }
    }

    /// Take the backend offline; every call fails with `Unreachable`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Server-side write that bypasses the cache layer entirely.
    pub fn seed(&self, bucket: &str, object: &str, bytes: &[u8]) {
        self.seed_with_metadata(bucket, object, bytes, BTreeMap::new());
    }

    pub fn seed_with_metadata(
        &self,
        bucket: &str,
        object: &str,
        bytes: &[u8],
        user_defined: BTreeMap<String, String>,
    ) {
        let stored = StoredObject {
            bytes: bytes.to_vec(),
            etag: etag_of(bytes),
            mod_time_millis: self.mod_time.fetch_add(1, Ordering::SeqCst),
            content_type: None,
            content_encoding: None,
            user_defined,
        };
        self.objects
            .lock()
            .insert((bucket.to_string(), object.to_string()), stored);
    }

    /// Server-side delete that bypasses the cache layer entirely.
    pub fn remove(&self, bucket: &str, object: &str) {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), object.to_string()));
    }

    pub fn stored_bytes(&self, bucket: &str, object: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), object.to_string()))
            .map(|o| o.bytes.clone())
    }

    pub fn stored_etag(&self, bucket: &str, object: &str) -> Option<String> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), object.to_string()))
            .map(|o| o.etag.clone())
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> Result<(), BackendError> {
        if self.down.load(Ordering::SeqCst) {
            Err(BackendError::unreachable("backend is down"))
        } else {
            Ok(())
        }
    }

    async fn drain(body: ObjectBody) -> Result<Vec<u8>, BackendError> {
        let mut reader = body.reader;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .await
            .map_err(|err| BackendError::Other {
                message: format!("failed to read request body: {err}"),
            })?;
        if bytes.len() as u64 != body.size {
            return Err(BackendError::Other {
                message: format!("short body: got {} of {} bytes", bytes.len(), body.size),
            });
        }
        Ok(bytes)
    }
}

pub fn etag_of(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_object_info(
        &self,
        bucket: &str,
        object: &str,
    ) -> Result<ObjectInfo, BackendError> {
        self.check_up()?;
        let objects = self.objects.lock();
        objects
            .get(&(bucket.to_string(), object.to_string()))
            .map(|o| o.info(bucket, object))
            .ok_or_else(|| BackendError::not_found(bucket, object))
    }

    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectReader, BackendError> {
        self.check_up()?;
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        let (info, bytes) = {
            let objects = self.objects.lock();
            let stored = objects
                .get(&(bucket.to_string(), object.to_string()))
                .ok_or_else(|| BackendError::not_found(bucket, object))?;
            (stored.info(bucket, object), stored.bytes.clone())
        };

        let bytes = match range {
            None => bytes,
            Some(range) => {
                if !range.fits_within(bytes.len() as u64) {
                    return Err(BackendError::Other {
                        message: format!("range {range} out of bounds"),
                    });
                }
                bytes[range.offset as usize..=(range.last() as usize)].to_vec()
            }
        };

        Ok(ObjectReader {
            info,
            stream: Box::new(std::io::Cursor::new(bytes)),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        body: ObjectBody,
        opts: PutObjectOptions,
    ) -> Result<ObjectInfo, BackendError> {
        self.check_up()?;
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        let bytes = Self::drain(body).await?;
        let stored = StoredObject {
            etag: etag_of(&bytes),
            mod_time_millis: self.mod_time.fetch_add(1, Ordering::SeqCst),
            content_type: opts.content_type,
            content_encoding: opts.content_encoding,
            user_defined: opts.user_defined,
            bytes,
        };
        let info = stored.info(bucket, object);
        self.objects
            .lock()
            .insert((bucket.to_string(), object.to_string()), stored);
        Ok(info)
    }

    async fn delete_object(&self, bucket: &str, object: &str) -> Result<(), BackendError> {
        self.check_up()?;
        self.objects
            .lock()
            .remove(&(bucket.to_string(), object.to_string()))
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found(bucket, object))
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        _opts: PutObjectOptions,
    ) -> Result<ObjectInfo, BackendError> {
        self.check_up()?;
        let mut objects = self.objects.lock();
        let source = objects
            .get(&(src_bucket.to_string(), src_object.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::not_found(src_bucket, src_object))?;
        let info = source.info(dst_bucket, dst_object);
        objects.insert((dst_bucket.to_string(), dst_object.to_string()), source);
        Ok(info)
    }

    async fn new_multipart_upload(
        &self,
        _bucket: &str,
        _object: &str,
        _opts: PutObjectOptions,
    ) -> Result<String, BackendError> {
        self.check_up()?;
        let id = self.next_upload_id.fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("upload-{id}");
        self.uploads.lock().insert(upload_id.clone(), Vec::new());
        Ok(upload_id)
    }

    async fn put_object_part(
        &self,
        _bucket: &str,
        _object: &str,
        upload_id: &str,
        part_number: u16,
        body: ObjectBody,
    ) -> Result<PartInfo, BackendError> {
        self.check_up()?;
        let bytes = Self::drain(body).await?;
        let etag = etag_of(&bytes);
        let size = bytes.len() as u64;

        let mut uploads = self.uploads.lock();
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::UploadNotFound {
                upload_id: upload_id.to_string(),
            })?;
        parts.retain(|(number, _, _)| *number != part_number);
        parts.push((part_number, bytes, etag.clone()));

        Ok(PartInfo {
            part_number,
            etag,
            size,
            mod_time_millis: self.mod_time.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo, BackendError> {
        self.check_up()?;
        let staged = self
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or_else(|| BackendError::UploadNotFound {
                upload_id: upload_id.to_string(),
            })?;

        let mut bytes = Vec::new();
        for wanted in &parts {
            let part = staged
                .iter()
                .find(|(number, _, etag)| *number == wanted.part_number && *etag == wanted.etag)
                .ok_or_else(|| BackendError::Other {
                    message: format!("part {} not uploaded", wanted.part_number),
                })?;
            bytes.extend_from_slice(&part.1);
        }

        let stored = StoredObject {
            etag: etag_of(&bytes),
            mod_time_millis: self.mod_time.fetch_add(1, Ordering::SeqCst),
            content_type: None,
            content_encoding: None,
            user_defined: BTreeMap::new(),
            bytes,
        };
        let info = stored.info(bucket, object);
        self.objects
            .lock()
            .insert((bucket.to_string(), object.to_string()), stored);
        Ok(info)
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _object: &str,
        upload_id: &str,
    ) -> Result<(), BackendError> {
        self.check_up()?;
        self.uploads.lock().remove(upload_id);
        Ok(())
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read an entry's metadata straight off a drive root, outside the cache's
/// own APIs.
pub fn meta_on_disk(
    root: &std::path::Path,
    bucket: &str,
    object: &str,
) -> Option<pier_cache::ObjectMeta> {
    let layout = pier_cache::DriveLayout::new(root);
    let hash = pier_cache::KeyHash::of(bucket, object);
    let bytes = std::fs::read(layout.meta_path(&hash)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Whether any of `roots` holds a cache entry (content or counter) for the
/// key.
pub fn entry_on_any_drive(roots: &[std::path::PathBuf], bucket: &str, object: &str) -> bool {
    roots
        .iter()
        .any(|root| meta_on_disk(root, bucket, object).is_some())
}
