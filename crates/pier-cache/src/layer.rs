use crate::cache_control::{writeback_in_progress, CacheControl};
use crate::config::{CacheConfig, CommitMode};
use crate::drive::{CacheReader, DriveCache, DriveOptions, PutOptions};
use crate::error::{CacheError, Result};
use crate::gc::drive_gc_worker;
use crate::migrate::migrate_drive;
use crate::placement::Placement;
use crate::stats::{CacheStats, DriveUsage, StatsSnapshot, UsageState};
use crate::stream::{byte_pipe, tee, HashingReader, DEFAULT_PIPE_CAPACITY};
use crate::writeback::{enqueue, resume_pending, writeback_worker, WritebackJob};
use pier_core::{
    metadata_value, Backend, ByteRange, CacheEvent, Clock, CompletedPart, NoopObserver,
    ObjectBody, ObjectInfo, Observer, PartInfo, PutObjectOptions, SystemClock,
    AMZ_OBJECT_LOCK_LEGAL_HOLD, AMZ_OBJECT_LOCK_MODE, AMZ_SSE_C_ALGORITHM, AMZ_SSE_C_KEY,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Where a GET's bytes came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache.
    Hit,
    /// Served from the backend (and possibly filled into the cache).
    Miss,
    /// The request was not cache-eligible.
    Bypass,
    /// Served stale from cache because the backend was unreachable.
    StaleHit,
}

/// Result of a cached GET.
pub struct GetResult {
    pub info: ObjectInfo,
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
    pub cache_status: CacheStatus,
}

impl std::fmt::Debug for GetResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetResult")
            .field("info", &self.info)
            .field("cache_status", &self.cache_status)
            .finish_non_exhaustive()
    }
}

/// Request-scoped options for a cached GET.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// Request headers relevant to cache eligibility (SSE-C keys and
    /// friends). Freshness decisions come from the *cached* entry's own
    /// cache-control, not from here.
    pub headers: BTreeMap<String, String>,
}

/// The cache orchestrator: read-through, write-through and write-back flows
/// over a set of local drives, in front of an injected [`Backend`].
///
/// All collaborators (backend, clock, observer) are constructor-injected;
/// the layer owns its drives and every background worker it spawns.
pub struct CacheLayer {
    backend: Arc<dyn Backend>,
    placement: Arc<Placement>,
    config: CacheConfig,
    excludes: Vec<glob::Pattern>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
    stats: Arc<CacheStats>,
    writeback_tx: mpsc::Sender<WritebackJob>,
    /// Global skip-cache flag: set while any drive is migrating.
    migrating: Arc<AtomicBool>,
    /// Process-wide token background work rebinds to, so fills survive the
    /// request that started them but stop at shutdown.
    shutdown: CancellationToken,
}

impl CacheLayer {
    pub async fn new(backend: Arc<dyn Backend>, config: CacheConfig) -> Result<Arc<Self>> {
        Self::with_collaborators(backend, config, Arc::new(SystemClock), Arc::new(NoopObserver))
            .await
    }

    pub async fn with_collaborators(
        backend: Arc<dyn Backend>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn Observer>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let drive_opts = DriveOptions {
            quota_pct: config.quota_pct,
            high_watermark_pct: config.high_watermark_pct,
            low_watermark_pct: config.low_watermark_pct,
        };

        let mut slots = Vec::with_capacity(config.drives.len());
        for path in &config.drives {
            match DriveCache::new(path, drive_opts, clock.clone()).await {
                Ok(drive) => slots.push(Some(drive)),
                Err(err) => {
                    tracing::warn!(
                        target = "pier.cache",
                        drive = %path.display(),
                        error = %err,
                        "cache drive failed to initialize; leaving slot absent"
                    );
                    slots.push(None);
                }
            }
        }
        if slots.iter().all(Option::is_none) {
            return Err(CacheError::config("no cache drive could be initialized"));
        }

        let placement = Arc::new(Placement::new(slots));
        let shutdown = CancellationToken::new();
        let (writeback_tx, writeback_rx) = mpsc::channel(config.writeback_retry_capacity);

        let layer = Arc::new(Self {
            backend: backend.clone(),
            placement: placement.clone(),
            excludes: config.compiled_excludes(),
            clock,
            observer: observer.clone(),
            stats: Arc::new(CacheStats::default()),
            writeback_tx: writeback_tx.clone(),
            migrating: Arc::new(AtomicBool::new(placement.any_migrating())),
            shutdown: shutdown.clone(),
            config,
        });

        tokio::spawn(writeback_worker(
            backend,
            placement.clone(),
            observer,
            writeback_rx,
            writeback_tx.clone(),
            shutdown.clone(),
        ));

        for drive in placement.all_drives() {
            tokio::spawn(drive_gc_worker(
                drive,
                layer.config.gc_interval,
                layer.observer.clone(),
                shutdown.clone(),
            ));
        }

        layer.spawn_migrations();

        // Requeue uploads interrupted by the last shutdown.
        {
            let placement = placement.clone();
            let tx = writeback_tx;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = resume_pending(&placement, &tx) => {}
                }
            });
        }

        Ok(layer)
    }

    /// Stop every background worker. In-flight requests finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Every initialized drive, in slot order.
    pub fn drives(&self) -> Vec<Arc<DriveCache>> {
        self.placement.all_drives()
    }

    /// Per-drive usage snapshot for admin surfaces.
    pub fn drive_usage(&self) -> Vec<DriveUsage> {
        self.placement
            .all_drives()
            .iter()
            .filter_map(|drive| {
                let usage = drive.disk_usage().ok()?;
                let pct = if usage.total == 0 {
                    0
                } else {
                    (usage.used.saturating_mul(100) / usage.total) as u8
                };
                Some(DriveUsage {
                    dir: drive.root().to_path_buf(),
                    usage_bytes: usage.used,
                    total_bytes: usage.total,
                    usage_pct: pct,
                    state: if usage.used > usage.high_watermark {
                        UsageState::High
                    } else {
                        UsageState::Low
                    },
                })
            })
            .collect()
    }

    // ---- GET ----

    pub async fn get_object(
        self: &Arc<Self>,
        bucket: &str,
        object: &str,
        range: Option<ByteRange>,
        opts: GetOptions,
        cancel: &CancellationToken,
    ) -> Result<GetResult> {
        if self.bypasses_cache(bucket, object) {
            self.observer.record(CacheEvent::Bypass {
                bucket,
                object,
                reason: "not-eligible",
            });
            return self.backend_get(bucket, object, range, CacheStatus::Bypass).await;
        }
        if has_ssec_headers(&opts.headers) {
            self.delete_cached_entry(bucket, object).await;
            self.observer.record(CacheEvent::Bypass {
                bucket,
                object,
                reason: "sse-c",
            });
            return self.backend_get(bucket, object, range, CacheStatus::Bypass).await;
        }

        let drive = match self.placement.locate_for_read(bucket, object).await {
            Ok(drive) => drive,
            Err(_) => {
                self.observer.record(CacheEvent::Bypass {
                    bucket,
                    object,
                    reason: "no-drive",
                });
                return self.backend_get(bucket, object, range, CacheStatus::Bypass).await;
            }
        };

        let mut stale: Option<CacheReader> = None;
        if let Ok(reader) = drive.get(bucket, object, range).await {
            let cc = CacheControl::from_metadata(&reader.meta.info.user_defined);
            let now = self.clock.now_millis();

            if writeback_in_progress(&reader.meta) {
                // The backend may not have the object yet; the cache is the
                // source of truth until the upload completes.
                return Ok(self.serve_from_cache(&drive, reader, CacheStatus::Hit).await);
            }
            if cc.no_store {
                self.stats.record_miss();
                self.observer.record(CacheEvent::Miss { bucket, object });
                return self.backend_get(bucket, object, range, CacheStatus::Miss).await;
            }
            if !cc.is_stale(reader.meta.info.mod_time_millis, now) {
                return Ok(self.serve_from_cache(&drive, reader, CacheStatus::Hit).await);
            }
            stale = Some(reader);
        }

        // Cache is absent or stale: consult the backend.
        let backend_info = match self.backend.get_object_info(bucket, object).await {
            Ok(info) => info,
            Err(err) if err.is_unreachable() => {
                // Stale-on-error: a stale cache beats no response at all.
                if let Some(reader) = stale {
                    return Ok(self
                        .serve_from_cache(&drive, reader, CacheStatus::StaleHit)
                        .await);
                }
                return Err(err.into());
            }
            Err(err) if err.is_not_found() => {
                drop(stale);
                self.delete_cached_entry(bucket, object).await;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        if !backend_info.is_cacheable() {
            drop(stale);
            self.delete_cached_entry(bucket, object).await;
            self.observer.record(CacheEvent::Bypass {
                bucket,
                object,
                reason: "not-cacheable",
            });
            return self.backend_get(bucket, object, range, CacheStatus::Bypass).await;
        }

        if let Some(reader) = stale {
            if etags_match(&reader.meta.info.etag, &backend_info.etag) {
                // Same content; refresh whatever user-facing headers changed
                // server-side and serve from cache.
                let refreshed = reader.meta.info != backend_info;
                let result = drive
                    .save_meta(
                        bucket,
                        object,
                        refreshed.then_some(&backend_info),
                        true,
                        None,
                    )
                    .await;
                if let Err(err) = result {
                    tracing::debug!(
                        target = "pier.cache",
                        bucket,
                        object,
                        error = %err,
                        "failed to refresh cache metadata after revalidation"
                    );
                }
                let bytes = reader.bytes;
                self.stats.record_hit(bytes);
                self.observer.record(CacheEvent::Hit {
                    bucket,
                    object,
                    bytes,
                });
                return Ok(GetResult {
                    info: reader.meta.info.clone(),
                    stream: reader.stream,
                    cache_status: CacheStatus::Hit,
                });
            }

            // The backend object changed under us; the cached copy is dead.
            drop(reader);
            self.delete_cached_entry(bucket, object).await;
        }

        self.miss_path(drive, bucket, object, range, backend_info, cancel)
            .await
    }

    /// The cache-miss tail of a GET: threshold gating, disk-space gating,
    /// then either a tee fill, a background whole-object fill, or a plain
    /// backend read.
    async fn miss_path(
        self: &Arc<Self>,
        drive: Arc<DriveCache>,
        bucket: &str,
        object: &str,
        range: Option<ByteRange>,
        backend_info: ObjectInfo,
        cancel: &CancellationToken,
    ) -> Result<GetResult> {
        self.stats.record_miss();
        self.observer.record(CacheEvent::Miss { bucket, object });

        let hits = match drive.stat(bucket, object).await {
            Ok(meta) => meta.hits,
            Err(_) => 0,
        };
        if hits < self.config.after {
            // Not hot enough to occupy a slot; record the reference so the
            // counter survives this request.
            if let Err(err) = drive
                .save_meta(bucket, object, Some(&backend_info), true, None)
                .await
            {
                tracing::debug!(
                    target = "pier.cache",
                    bucket,
                    object,
                    error = %err,
                    "failed to bump access-threshold counter"
                );
            }
            return self.backend_get(bucket, object, range, CacheStatus::Miss).await;
        }

        if !drive.disk_space_available(backend_info.size) {
            return self.backend_get(bucket, object, range, CacheStatus::Miss).await;
        }

        if range.is_some() && !self.config.range_enabled {
            // Serve the requested range from the backend and backfill the
            // whole object out-of-band.
            self.spawn_background_fill(drive, bucket, object);
            return self.backend_get(bucket, object, range, CacheStatus::Miss).await;
        }

        // Tee: one backend read feeds the client and the cache fill.
        let backend_reader = self.backend.get_object(bucket, object, range).await?;
        let fill_info = backend_reader.info.clone();
        let fill_bytes = match range {
            Some(range) => range.length,
            None => fill_info.size,
        };

        let (client_w, client_r) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        let (cache_w, cache_r) = byte_pipe(DEFAULT_PIPE_CAPACITY);

        let fill_drive = drive.clone();
        let fill_bucket = bucket.to_string();
        let fill_object = object.to_string();
        let observer = self.observer.clone();
        let put_task = tokio::spawn(async move {
            let result = fill_drive
                .put(
                    &fill_bucket,
                    &fill_object,
                    cache_r,
                    fill_bytes,
                    PutOptions {
                        info: fill_info,
                        range,
                        pending_writeback: false,
                    },
                )
                .await;
            match result {
                Ok(_) => observer.record(CacheEvent::Filled {
                    bucket: &fill_bucket,
                    object: &fill_object,
                    bytes: fill_bytes,
                }),
                Err(err) => {
                    tracing::debug!(
                        target = "pier.cache",
                        bucket = %fill_bucket,
                        object = %fill_object,
                        error = %err,
                        "cache fill abandoned"
                    );
                }
            }
        });

        let cancel = cancel.clone();
        let tee_bucket = bucket.to_string();
        let tee_object = object.to_string();
        tokio::spawn(async move {
            let copy = tee(backend_reader.stream, client_w, Some(cache_w), &cancel).await;
            if let Err(err) = copy {
                tracing::debug!(
                    target = "pier.cache",
                    bucket = %tee_bucket,
                    object = %tee_object,
                    error = %err,
                    "backend stream ended early during cache fill"
                );
            }
            // The fill joins before the operation is accounted finished.
            let _ = put_task.await;
        });

        Ok(GetResult {
            info: backend_info,
            stream: Box::new(client_r),
            cache_status: CacheStatus::Miss,
        })
    }

    async fn serve_from_cache(
        &self,
        drive: &Arc<DriveCache>,
        reader: CacheReader,
        status: CacheStatus,
    ) -> GetResult {
        let bucket = reader.meta.info.bucket.clone();
        let object = reader.meta.info.object.clone();
        let bytes = reader.bytes;

        self.stats.record_hit(bytes);
        self.observer.record(CacheEvent::Hit {
            bucket: &bucket,
            object: &object,
            bytes,
        });

        if let Err(err) = drive.save_meta(&bucket, &object, None, true, None).await {
            tracing::debug!(
                target = "pier.cache",
                bucket = %bucket,
                object = %object,
                error = %err,
                "failed to bump hit counter on cache hit"
            );
        }

        GetResult {
            info: reader.meta.info.clone(),
            stream: reader.stream,
            cache_status: status,
        }
    }

    async fn backend_get(
        &self,
        bucket: &str,
        object: &str,
        range: Option<ByteRange>,
        status: CacheStatus,
    ) -> Result<GetResult> {
        let reader = self.backend.get_object(bucket, object, range).await?;
        Ok(GetResult {
            info: reader.info,
            stream: reader.stream,
            cache_status: status,
        })
    }

    // ---- PUT ----

    pub async fn put_object(
        self: &Arc<Self>,
        bucket: &str,
        object: &str,
        body: ObjectBody,
        opts: PutObjectOptions,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo> {
        let Some(drive) = self.put_target(bucket, object, &opts.user_defined).await else {
            return Ok(self.backend.put_object(bucket, object, body, opts).await?);
        };

        match self.config.commit_mode {
            CommitMode::WriteBack => self.put_writeback(drive, bucket, object, body, opts).await,
            CommitMode::WriteThrough => {
                self.put_writethrough(drive, bucket, object, body, opts, cancel)
                    .await
            }
            CommitMode::None => {
                let info = self.backend.put_object(bucket, object, body, opts).await?;
                self.spawn_background_fill(drive, bucket, object);
                Ok(info)
            }
        }
    }

    /// Write-back: ack after the cache write; the backend upload is queued.
    async fn put_writeback(
        &self,
        drive: Arc<DriveCache>,
        bucket: &str,
        object: &str,
        body: ObjectBody,
        opts: PutObjectOptions,
    ) -> Result<ObjectInfo> {
        if !drive.disk_space_available(body.size) {
            // Without cache space, write-back degrades to a direct PUT.
            return Ok(self.backend.put_object(bucket, object, body, opts).await?);
        }

        let _guard = drive.lock_for_write(bucket, object).await;

        let (hashing, digest) = HashingReader::new(body.reader);
        let info = ObjectInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            etag: None,
            size: body.size,
            actual_size: body.size,
            mod_time_millis: self.clock.now_millis(),
            content_type: opts.content_type.clone(),
            content_encoding: opts.content_encoding.clone(),
            expires_millis: None,
            user_defined: opts.user_defined.clone(),
            version_id: None,
        };

        drive
            .put(
                bucket,
                object,
                hashing,
                body.size,
                PutOptions {
                    info: info.clone(),
                    range: None,
                    pending_writeback: true,
                },
            )
            .await?;

        // The content fingerprint becomes the provisional etag; the queued
        // upload revalidates against it before talking to the backend.
        let etag = digest.hex();
        let info = ObjectInfo {
            etag: Some(etag.clone()),
            ..info
        };
        drive
            .save_meta(bucket, object, Some(&info), false, None)
            .await?;

        enqueue(
            &self.writeback_tx,
            WritebackJob {
                bucket: bucket.to_string(),
                object: object.to_string(),
                etag: Some(etag),
            },
        );

        Ok(info)
    }

    /// Write-through: one client stream feeds the backend and the cache
    /// concurrently; the backend's ack gates the response.
    async fn put_writethrough(
        &self,
        drive: Arc<DriveCache>,
        bucket: &str,
        object: &str,
        body: ObjectBody,
        opts: PutObjectOptions,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo> {
        let _guard = drive.lock_for_write(bucket, object).await;
        let size = body.size;

        let (backend_w, backend_r) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        let (cache_w, cache_r) = byte_pipe(DEFAULT_PIPE_CAPACITY);

        let backend = self.backend.clone();
        let backend_bucket = bucket.to_string();
        let backend_object = object.to_string();
        let backend_opts = opts.clone();
        let backend_task = tokio::spawn(async move {
            backend
                .put_object(
                    &backend_bucket,
                    &backend_object,
                    ObjectBody {
                        reader: Box::new(backend_r),
                        size,
                    },
                    backend_opts,
                )
                .await
        });

        let cache_drive = drive.clone();
        let cache_bucket = bucket.to_string();
        let cache_object = object.to_string();
        let provisional = ObjectInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            etag: None,
            size,
            actual_size: size,
            mod_time_millis: self.clock.now_millis(),
            content_type: opts.content_type.clone(),
            content_encoding: opts.content_encoding.clone(),
            expires_millis: None,
            user_defined: opts.user_defined.clone(),
            version_id: None,
        };
        let cache_task = tokio::spawn(async move {
            cache_drive
                .put(
                    &cache_bucket,
                    &cache_object,
                    cache_r,
                    size,
                    PutOptions {
                        info: provisional,
                        range: None,
                        pending_writeback: false,
                    },
                )
                .await
        });

        let copy = tee(body.reader, backend_w, Some(cache_w), cancel).await;

        let backend_result = backend_task
            .await
            .map_err(|err| CacheError::Io(std::io::Error::other(err)))?;
        let cache_result = cache_task
            .await
            .map_err(|err| CacheError::Io(std::io::Error::other(err)))?;

        let info = match backend_result {
            Ok(info) => info,
            Err(err) => {
                // The backend never acked; whatever the cache wrote must not
                // be served.
                self.delete_cached_entry(bucket, object).await;
                if copy.is_err() && cancel.is_cancelled() {
                    return Err(CacheError::Cancelled);
                }
                return Err(err.into());
            }
        };

        match cache_result {
            Ok(_) => {
                // Patch the provisional meta with the backend's identity. If
                // the patch fails the entry would serve a wrong etag, so it
                // is deleted instead.
                if let Err(err) = drive.save_meta(bucket, object, Some(&info), false, None).await
                {
                    tracing::warn!(
                        target = "pier.cache",
                        bucket,
                        object,
                        error = %err,
                        "failed to patch cache metadata after write-through; dropping entry"
                    );
                    self.delete_cached_entry(bucket, object).await;
                }
            }
            Err(err) => {
                tracing::debug!(
                    target = "pier.cache",
                    bucket,
                    object,
                    error = %err,
                    "write-through cache write abandoned"
                );
            }
        }

        Ok(info)
    }

    // ---- DELETE / COPY ----

    pub async fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        match self.backend.delete_object(bucket, object).await {
            Ok(()) => {}
            // Idempotent: deleting an absent object is not an error.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        self.delete_cached_entry(bucket, object).await;
        Ok(())
    }

    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        opts: PutObjectOptions,
    ) -> Result<ObjectInfo> {
        if src_bucket == dst_bucket && src_object == dst_object {
            // Metadata-only rewrite of the same key: the cached entry's
            // headers are stale the moment the backend applies it.
            self.delete_cached_entry(src_bucket, src_object).await;
        }
        Ok(self
            .backend
            .copy_object(src_bucket, src_object, dst_bucket, dst_object, opts)
            .await?)
    }

    // ---- multipart ----

    pub async fn new_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        opts: PutObjectOptions,
    ) -> Result<String> {
        let upload_id = self
            .backend
            .new_multipart_upload(bucket, object, opts.clone())
            .await?;

        if self.config.commit_mode == CommitMode::WriteThrough {
            if let Some(drive) = self.put_target(bucket, object, &opts.user_defined).await {
                if let Err(err) = drive.new_multipart(bucket, object, &upload_id).await {
                    tracing::debug!(
                        target = "pier.cache",
                        bucket,
                        object,
                        upload_id = %upload_id,
                        error = %err,
                        "failed to stage multipart upload in cache"
                    );
                }
            }
        }
        Ok(upload_id)
    }

    pub async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: u16,
        body: ObjectBody,
        cancel: &CancellationToken,
    ) -> Result<PartInfo> {
        let no_metadata = BTreeMap::new();
        let staging_drive = match self.put_target(bucket, object, &no_metadata).await {
            Some(drive)
                if self.config.commit_mode == CommitMode::WriteThrough
                    && drive.disk_space_available(body.size) =>
            {
                Some(drive)
            }
            _ => None,
        };

        let Some(drive) = staging_drive else {
            return Ok(self
                .backend
                .put_object_part(bucket, object, upload_id, part_number, body)
                .await?);
        };

        let size = body.size;
        let (backend_w, backend_r) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        let (cache_w, cache_r) = byte_pipe(DEFAULT_PIPE_CAPACITY);

        let backend = self.backend.clone();
        let b_bucket = bucket.to_string();
        let b_object = object.to_string();
        let b_upload = upload_id.to_string();
        let backend_task = tokio::spawn(async move {
            backend
                .put_object_part(
                    &b_bucket,
                    &b_object,
                    &b_upload,
                    part_number,
                    ObjectBody {
                        reader: Box::new(backend_r),
                        size,
                    },
                )
                .await
        });

        let cache_drive = drive.clone();
        let c_bucket = bucket.to_string();
        let c_object = object.to_string();
        let c_upload = upload_id.to_string();
        let cache_task = tokio::spawn(async move {
            cache_drive
                .put_part(&c_bucket, &c_object, &c_upload, part_number, cache_r, size)
                .await
        });

        let _ = tee(body.reader, backend_w, Some(cache_w), cancel).await;

        let part = backend_task
            .await
            .map_err(|err| CacheError::Io(std::io::Error::other(err)))??;
        let cache_result = cache_task
            .await
            .map_err(|err| CacheError::Io(std::io::Error::other(err)))?;

        match cache_result {
            Ok(()) => {
                if let Err(err) = drive
                    .save_part_meta(bucket, object, upload_id, part.clone())
                    .await
                {
                    tracing::debug!(
                        target = "pier.cache",
                        bucket,
                        object,
                        part_number,
                        error = %err,
                        "failed to record staged part"
                    );
                }
            }
            Err(err) => {
                tracing::debug!(
                    target = "pier.cache",
                    bucket,
                    object,
                    part_number,
                    error = %err,
                    "part staging abandoned"
                );
            }
        }

        Ok(part)
    }

    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        let info = self
            .backend
            .complete_multipart_upload(bucket, object, upload_id, parts.clone())
            .await?;

        if self.config.commit_mode == CommitMode::WriteThrough {
            if let Some(drive) = self.put_target(bucket, object, &info.user_defined).await {
                if let Err(err) = drive
                    .complete_multipart(bucket, object, upload_id, &parts, &info)
                    .await
                {
                    tracing::debug!(
                        target = "pier.cache",
                        bucket,
                        object,
                        upload_id = %upload_id,
                        error = %err,
                        "failed to assemble multipart entry in cache"
                    );
                }
            }
        }
        Ok(info)
    }

    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.backend
            .abort_multipart_upload(bucket, object, upload_id)
            .await?;
        if let Ok(drive) = self.placement.locate_for_read(bucket, object).await {
            let _ = drive.abort_upload(bucket, object, upload_id).await;
        }
        Ok(())
    }

    // ---- gates & helpers ----

    /// Static eligibility gates that apply to every operation.
    fn bypasses_cache(&self, bucket: &str, object: &str) -> bool {
        if object.ends_with('/') {
            return true;
        }
        if self.migrating.load(Ordering::Acquire) {
            return true;
        }
        let path = format!("{bucket}/{object}");
        self.excludes.iter().any(|pattern| pattern.matches(&path))
    }

    /// Resolve the drive a cache-eligible PUT would land on; `None` means
    /// the write bypasses the cache (and any stale entry is dropped when the
    /// object itself is not cache-eligible).
    async fn put_target(
        &self,
        bucket: &str,
        object: &str,
        user_defined: &BTreeMap<String, String>,
    ) -> Option<Arc<DriveCache>> {
        if self.bypasses_cache(bucket, object) {
            self.observer.record(CacheEvent::Bypass {
                bucket,
                object,
                reason: "not-eligible",
            });
            return None;
        }
        if has_ssec_headers(user_defined) || has_lock_metadata(user_defined) {
            self.delete_cached_entry(bucket, object).await;
            self.observer.record(CacheEvent::Bypass {
                bucket,
                object,
                reason: "not-cacheable",
            });
            return None;
        }
        match self.placement.locate_for_write(bucket, object) {
            Ok(drive) => Some(drive),
            Err(_) => {
                self.observer.record(CacheEvent::Bypass {
                    bucket,
                    object,
                    reason: "no-drive",
                });
                None
            }
        }
    }

    async fn delete_cached_entry(&self, bucket: &str, object: &str) {
        if let Ok(drive) = self.placement.locate_for_read(bucket, object).await {
            if let Err(err) = drive.delete(bucket, object).await {
                tracing::debug!(
                    target = "pier.cache",
                    bucket,
                    object,
                    error = %err,
                    "failed to drop cache entry"
                );
            }
        }
    }

    /// Backfill the whole object into the cache, detached from the request.
    fn spawn_background_fill(self: &Arc<Self>, drive: Arc<DriveCache>, bucket: &str, object: &str) {
        let layer = self.clone();
        let bucket = bucket.to_string();
        let object = object.to_string();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = layer.background_fill(drive, &bucket, &object) => {}
            }
        });
    }

    async fn background_fill(&self, drive: Arc<DriveCache>, bucket: &str, object: &str) {
        let reader = match self.backend.get_object(bucket, object, None).await {
            Ok(reader) => reader,
            Err(err) => {
                tracing::debug!(
                    target = "pier.cache",
                    bucket,
                    object,
                    error = %err,
                    "background fill skipped; backend read failed"
                );
                return;
            }
        };

        // Don't overwrite an entry that already holds this exact content.
        if let Ok(meta) = drive.stat(bucket, object).await {
            if etags_match(&meta.info.etag, &reader.info.etag) && meta.ranges.is_empty() {
                return;
            }
        }
        if !drive.disk_space_available(reader.info.size) {
            return;
        }

        let size = reader.info.size;
        let info = reader.info;
        match drive
            .put(
                bucket,
                object,
                reader.stream,
                size,
                PutOptions {
                    info,
                    range: None,
                    pending_writeback: false,
                },
            )
            .await
        {
            Ok(_) => {
                self.observer.record(CacheEvent::Filled {
                    bucket,
                    object,
                    bytes: size,
                });
            }
            Err(err) => {
                tracing::debug!(
                    target = "pier.cache",
                    bucket,
                    object,
                    error = %err,
                    "background fill abandoned"
                );
            }
        }
    }

    fn spawn_migrations(self: &Arc<Self>) {
        let migrating_drives: Vec<_> = self
            .placement
            .all_drives()
            .into_iter()
            .filter(|drive| drive.is_migrating())
            .collect();
        if migrating_drives.is_empty() {
            return;
        }

        let placement = self.placement.clone();
        let flag = self.migrating.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            // One worker per drive, in parallel.
            let mut handles = Vec::new();
            for drive in migrating_drives {
                handles.push(tokio::spawn(async move {
                    if let Err(err) = migrate_drive(&drive).await {
                        tracing::warn!(
                            target = "pier.cache",
                            drive = %drive.root().display(),
                            error = %err,
                            "cache drive migration failed"
                        );
                    }
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
            if !shutdown.is_cancelled() {
                flag.store(placement.any_migrating(), Ordering::Release);
            }
        });
    }
}

fn has_ssec_headers(headers: &BTreeMap<String, String>) -> bool {
    metadata_value(headers, AMZ_SSE_C_ALGORITHM).is_some()
        || metadata_value(headers, AMZ_SSE_C_KEY).is_some()
}

fn has_lock_metadata(headers: &BTreeMap<String, String>) -> bool {
    metadata_value(headers, AMZ_OBJECT_LOCK_MODE).is_some()
        || metadata_value(headers, AMZ_OBJECT_LOCK_LEGAL_HOLD)
            .is_some_and(|v| v.eq_ignore_ascii_case("on"))
}

fn etags_match(cached: &Option<String>, backend: &Option<String>) -> bool {
    match (cached, backend) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
