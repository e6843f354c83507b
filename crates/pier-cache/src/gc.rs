use crate::drive::DriveCache;
use crate::error::Result;
use crate::meta::{ObjectMeta, META_FILENAME};
use crate::scorer::Scorer;
use crate::util::META_PAYLOAD_LIMIT_BYTES;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Hit-count saturation for eviction scoring: entries at or above this many
/// hits get no extra protection from further hits.
const GC_MAX_HITS: u32 = 100;

/// Crashed in-flight writes older than this are collected on every pass.
const TMP_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Multipart staging without entry metadata is only garbage once the upload
/// has clearly been abandoned.
const STAGING_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Summary of one GC pass over a drive.
#[derive(Clone, Debug, Default)]
pub struct GcReport {
    pub scanned_entries: usize,
    pub deleted_entries: usize,
    pub deleted_bytes: u64,
    pub errors: Vec<GcError>,
}

#[derive(Clone, Debug)]
pub struct GcError {
    pub path: PathBuf,
    pub action: &'static str,
    pub error: String,
}

impl GcReport {
    fn push_error(&mut self, path: impl Into<PathBuf>, action: &'static str, err: impl ToString) {
        self.errors.push(GcError {
            path: path.into(),
            action,
            error: err.to_string(),
        });
    }
}

/// One cache entry found by a drive scan.
#[derive(Clone, Debug)]
pub(crate) struct ScannedEntry {
    pub dir: PathBuf,
    pub meta: Option<ObjectMeta>,
    /// Total bytes of everything under the entry directory.
    pub bytes: u64,
}

/// Walk a drive's entry tree.
///
/// The walk is a blocking filesystem traversal, so it runs on the blocking
/// pool; IO failures are collected rather than aborting the scan. Crashed
/// temp files older than [`TMP_MAX_AGE`] are deleted as a side effect.
pub(crate) async fn scan_drive(drive: &Arc<DriveCache>) -> Result<(Vec<ScannedEntry>, GcReport)> {
    let root = drive.root().to_path_buf();
    let tmp_dir = drive.layout().tmp_dir();

    tokio::task::spawn_blocking(move || scan_drive_blocking(&root, &tmp_dir))
        .await
        .map_err(|err| std::io::Error::other(err).into())
}

fn scan_drive_blocking(root: &Path, tmp_dir: &Path) -> (Vec<ScannedEntry>, GcReport) {
    let mut report = GcReport::default();
    let mut entries = Vec::new();

    collect_crashed_tmp_files(tmp_dir, &mut report);

    let prefix_dirs = match std::fs::read_dir(root) {
        Ok(iter) => iter,
        Err(err) => {
            report.push_error(root, "read_dir", err);
            return (entries, report);
        }
    };

    for prefix in prefix_dirs {
        let prefix = match prefix {
            Ok(entry) => entry,
            Err(err) => {
                report.push_error(root, "read_dir_entry", err);
                continue;
            }
        };
        // Entry fanout directories are exactly two hex characters; everything
        // else at the root (format marker, tmp, lockfile) is not an entry.
        let name = prefix.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.len() != 2 || !name.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        if !prefix.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        for walked in walkdir::WalkDir::new(prefix.path())
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
        {
            let walked = match walked {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(PathBuf::from)
                        .unwrap_or_else(|| prefix.path());
                    report.push_error(path, "walkdir", err);
                    continue;
                }
            };
            if !walked.file_type().is_dir() {
                continue;
            }

            let dir = walked.into_path();
            let meta = load_meta_blocking(&dir.join(META_FILENAME), &mut report);
            if meta.is_none() && has_recent_staging(&dir) {
                // An in-flight multipart upload has no entry metadata yet;
                // it is not garbage.
                continue;
            }
            let bytes = dir_size_bytes(&dir, &mut report);
            entries.push(ScannedEntry { dir, meta, bytes });
        }
    }

    report.scanned_entries = entries.len();
    (entries, report)
}

fn load_meta_blocking(path: &Path, report: &mut GcReport) -> Option<ObjectMeta> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            report.push_error(path, "stat_meta", err);
            return None;
        }
    };
    if !meta.is_file() || meta.len() > META_PAYLOAD_LIMIT_BYTES {
        return None;
    }

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            report.push_error(path, "read_meta", err);
            return None;
        }
    };
    match serde_json::from_slice::<ObjectMeta>(&bytes) {
        Ok(parsed) if parsed.is_compatible() => Some(parsed),
        Ok(_) => None,
        Err(err) => {
            report.push_error(path, "decode_meta", err);
            None
        }
    }
}

fn dir_size_bytes(dir: &Path, report: &mut GcReport) -> u64 {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map(PathBuf::from).unwrap_or_else(|| dir.into());
                report.push_error(path, "walkdir", err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => total = total.saturating_add(meta.len()),
            Err(err) => report.push_error(entry.path(), "stat_file", err),
        }
    }
    total
}

fn has_recent_staging(entry_dir: &Path) -> bool {
    let parts = entry_dir.join("parts");
    match std::fs::metadata(&parts) {
        Ok(meta) if meta.is_dir() => meta
            .modified()
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age < STAGING_MAX_AGE)
            .unwrap_or(true),
        _ => false,
    }
}

fn collect_crashed_tmp_files(tmp_dir: &Path, report: &mut GcReport) {
    let entries = match std::fs::read_dir(tmp_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            report.push_error(tmp_dir, "read_dir", err);
            return;
        }
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|t| t.elapsed().ok())
            .unwrap_or_default();
        if age < TMP_MAX_AGE {
            continue;
        }
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                report.push_error(path, "remove_tmp", err);
            }
        }
    }
}

/// Run GC if the drive's usage is above its high watermark; frees down to
/// the low watermark. Returns `None` when no GC was needed.
pub async fn run_watermark_gc(drive: &Arc<DriveCache>) -> Result<Option<GcReport>> {
    let usage = drive.disk_usage()?;
    if usage.used <= usage.high_watermark {
        return Ok(None);
    }
    let target = usage.used.saturating_sub(usage.low_watermark);
    run_gc_with_target(drive, target).await.map(Some)
}

/// Run one GC pass that tries to free `save_bytes` bytes.
///
/// Entries with an in-progress write-back are never evicted: the cache is
/// the only copy of those bytes. Entries without readable metadata are
/// garbage and are always collected, independent of the byte target.
pub async fn run_gc_with_target(drive: &Arc<DriveCache>, save_bytes: u64) -> Result<GcReport> {
    let (entries, mut report) = scan_drive(drive).await?;

    let mut scorer = Scorer::new(save_bytes, drive.now_millis() as i64, GC_MAX_HITS)?;
    let mut by_name: HashMap<String, (PathBuf, u64)> = HashMap::new();

    for entry in entries {
        match &entry.meta {
            None => {
                // Orphan blob (or half-written entry): garbage.
                let removed = crate::util::remove_dir_best_effort(&entry.dir, "gc.orphan").await;
                if removed {
                    report.deleted_entries += 1;
                    report.deleted_bytes = report.deleted_bytes.saturating_add(entry.bytes);
                }
                continue;
            }
            Some(meta) => {
                if meta.writeback.is_in_progress() {
                    continue;
                }
                let name = entry.dir.to_string_lossy().into_owned();
                // Score by the shadow access time: cache entries track their
                // own atime because the backing filesystem's mtime reflects
                // the fill, not the last use.
                let time = if meta.accessed_at_millis > 0 {
                    meta.accessed_at_millis
                } else {
                    meta.info.mod_time_millis
                };
                scorer.add(name.clone(), time, entry.bytes, meta.hits);
                by_name.insert(name, (entry.dir.clone(), entry.bytes));
            }
        }
    }

    for name in scorer.file_names() {
        let Some((dir, bytes)) = by_name.get(&name) else {
            continue;
        };

        // Re-check under current metadata: a write-back may have started
        // since the scan.
        if let Some(meta) = ObjectMeta::load(&dir.join(META_FILENAME)).await {
            if meta.writeback.is_in_progress() {
                continue;
            }
        }

        if crate::util::remove_dir_best_effort(dir, "gc.evict").await {
            report.deleted_entries += 1;
            report.deleted_bytes = report.deleted_bytes.saturating_add(*bytes);
            if !scorer.adjust_save_bytes(-(*bytes as i64)) {
                break;
            }
        } else {
            report.push_error(dir.clone(), "remove_entry", "failed to remove entry dir");
        }
    }

    if report.deleted_entries > 0 {
        tracing::info!(
            target = "pier.cache",
            drive = %drive.root().display(),
            deleted_entries = report.deleted_entries,
            deleted_bytes = report.deleted_bytes,
            errors = report.errors.len(),
            "cache eviction pass finished"
        );
    }

    Ok(report)
}

/// Background GC worker for one drive: a fixed tick plus the debounced
/// watermark trigger from `disk_space_available`.
pub(crate) async fn drive_gc_worker(
    drive: Arc<DriveCache>,
    interval: Duration,
    observer: Arc<dyn pier_core::Observer>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; consume it so a
    // fresh drive is not scanned at startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
            _ = drive.gc_triggered() => {}
        }

        if drive.is_migrating() || !drive.is_online() {
            continue;
        }

        match run_watermark_gc(&drive).await {
            Ok(Some(report)) if report.deleted_bytes > 0 => {
                observer.record(pier_core::CacheEvent::Evicted {
                    drive: drive.root(),
                    bytes: report.deleted_bytes,
                });
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    target = "pier.cache",
                    drive = %drive.root().display(),
                    error = %err,
                    "cache GC pass failed"
                );
            }
        }
    }
}
