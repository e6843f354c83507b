use crate::gc::scan_drive;
use crate::meta::WritebackStatus;
use crate::placement::Placement;
use pier_core::{Backend, CacheEvent, ObjectBody, Observer, PutObjectOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One queued backend upload for a write-back entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct WritebackJob {
    pub bucket: String,
    pub object: String,
    /// Etag of the cache content this job was enqueued for. If the entry has
    /// been overwritten since, this job is obsolete and is dropped (the
    /// overwrite enqueued its own job).
    pub etag: Option<String>,
}

/// Enqueue without blocking; the queue is bounded and drop-on-full, because
/// a full queue means a startup scan or a later watermark pass will find the
/// entry again anyway.
pub(crate) fn enqueue(tx: &mpsc::Sender<WritebackJob>, job: WritebackJob) {
    if let Err(err) = tx.try_send(job) {
        let job = match &err {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        };
        tracing::debug!(
            target = "pier.cache",
            bucket = %job.bucket,
            object = %job.object,
            "writeback queue full; dropping job"
        );
    }
}

/// Scan every usable drive for entries whose upload never completed and
/// requeue them. Runs once at startup.
pub(crate) async fn resume_pending(
    placement: &Placement,
    tx: &mpsc::Sender<WritebackJob>,
) -> usize {
    let mut resumed = 0;
    for drive in placement.online_drives() {
        if drive.is_migrating() {
            continue;
        }
        let entries = match scan_drive(&drive).await {
            Ok((entries, _)) => entries,
            Err(err) => {
                tracing::warn!(
                    target = "pier.cache",
                    drive = %drive.root().display(),
                    error = %err,
                    "failed to scan drive for pending writebacks"
                );
                continue;
            }
        };

        for entry in entries {
            let Some(meta) = entry.meta else { continue };
            if !meta.writeback.is_in_progress() {
                continue;
            }
            resumed += 1;
            enqueue(
                tx,
                WritebackJob {
                    bucket: meta.info.bucket.clone(),
                    object: meta.info.object.clone(),
                    etag: meta.info.etag.clone(),
                },
            );
        }
    }

    if resumed > 0 {
        tracing::info!(
            target = "pier.cache",
            resumed,
            "requeued interrupted writeback uploads"
        );
    }
    resumed
}

/// The write-back uploader loop.
///
/// Holds no reference back to the cache layer; everything it needs is
/// injected, and retries flow through the same bounded queue the layer
/// enqueues into.
pub(crate) async fn writeback_worker(
    backend: Arc<dyn Backend>,
    placement: Arc<Placement>,
    observer: Arc<dyn Observer>,
    mut rx: mpsc::Receiver<WritebackJob>,
    tx: mpsc::Sender<WritebackJob>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => return,
            job = rx.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        upload_object(&backend, &placement, observer.as_ref(), &tx, &shutdown, job).await;
    }
}

/// Attempt one backend upload for a pending entry.
pub(crate) async fn upload_object(
    backend: &Arc<dyn Backend>,
    placement: &Placement,
    observer: &dyn Observer,
    tx: &mpsc::Sender<WritebackJob>,
    shutdown: &CancellationToken,
    job: WritebackJob,
) {
    let Ok(drive) = placement.locate_for_read(&job.bucket, &job.object).await else {
        // No drive to read from; the startup scan will find the entry when
        // the drive returns.
        return;
    };

    let meta = match drive.stat(&job.bucket, &job.object).await {
        Ok(meta) => meta,
        // Deleted or evicted since enqueue; nothing to upload.
        Err(_) => return,
    };
    if !meta.writeback.is_in_progress() {
        return;
    }
    if meta.info.etag != job.etag {
        // The entry was overwritten; the overwrite queued its own job.
        return;
    }

    // A retry opens a new attempt.
    if meta.writeback == WritebackStatus::Failed {
        if drive
            .save_meta(
                &job.bucket,
                &job.object,
                None,
                false,
                Some(WritebackStatus::Pending),
            )
            .await
            .is_err()
        {
            return;
        }
    }

    let reader = match drive.get(&job.bucket, &job.object, None).await {
        Ok(reader) => reader,
        Err(err) => {
            tracing::debug!(
                target = "pier.cache",
                bucket = %job.bucket,
                object = %job.object,
                error = %err,
                "writeback entry unreadable; dropping upload"
            );
            return;
        }
    };

    let opts = PutObjectOptions {
        content_type: reader.meta.info.content_type.clone(),
        content_encoding: reader.meta.info.content_encoding.clone(),
        user_defined: reader.meta.info.user_defined.clone(),
    };
    let size = reader.meta.info.size;

    match backend
        .put_object(
            &job.bucket,
            &job.object,
            ObjectBody {
                reader: reader.stream,
                size,
            },
            opts,
        )
        .await
    {
        Ok(backend_info) => {
            // The backend's identity is authoritative from here on; later
            // GETs compare cached etag against backend etag.
            match drive
                .save_meta(
                    &job.bucket,
                    &job.object,
                    Some(&backend_info),
                    false,
                    Some(WritebackStatus::Complete),
                )
                .await
            {
                Ok(_) => {
                    observer.record(CacheEvent::WritebackComplete {
                        bucket: &job.bucket,
                        object: &job.object,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        target = "pier.cache",
                        bucket = %job.bucket,
                        object = %job.object,
                        error = %err,
                        "uploaded writeback entry but failed to mark it complete"
                    );
                }
            }
        }
        Err(err) => {
            let retries = match drive
                .save_meta(
                    &job.bucket,
                    &job.object,
                    None,
                    false,
                    Some(WritebackStatus::Failed),
                )
                .await
            {
                Ok(meta) => meta.writeback_retries,
                Err(_) => return,
            };

            tracing::warn!(
                target = "pier.cache",
                bucket = %job.bucket,
                object = %job.object,
                retries,
                error = %err,
                "writeback upload failed; will retry"
            );
            observer.record(CacheEvent::WritebackFailed {
                bucket: &job.bucket,
                object: &job.object,
                retries,
            });

            // Capped backoff, then requeue. The sleep runs detached so one
            // failing object does not stall the whole queue.
            let delay = Duration::from_secs(u64::from(retries % 10 + 1).min(11));
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => enqueue(&tx, job),
                }
            });
        }
    }
}
