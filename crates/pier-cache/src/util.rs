use crate::error::{CacheError, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Hard upper bound for any JSON metadata payload we will read from disk.
///
/// Cache corruption should degrade to a cache miss, not an out-of-memory
/// crash: a corrupted or hostile meta file must not be able to request an
/// enormous allocation.
pub const META_PAYLOAD_LIMIT_BYTES: u64 = 4 * 1024 * 1024;

/// Read a metadata file, refusing symlinks and oversized payloads.
///
/// Returns `None` for anything that should be treated as a cache miss
/// (missing, oversized, wrong file type); IO errors other than not-found are
/// logged at debug because deletion races are routine here.
pub async fn read_meta_file(path: &Path) -> Option<Vec<u8>> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "pier.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat cache metadata file"
                );
            }
            return None;
        }
    };
    if meta.file_type().is_symlink() || !meta.is_file() {
        remove_file_best_effort(path, "read_meta_file.invalid_type").await;
        return None;
    }
    if meta.len() > META_PAYLOAD_LIMIT_BYTES {
        remove_file_best_effort(path, "read_meta_file.oversize").await;
        return None;
    }

    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "pier.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to read cache metadata file"
                );
            }
            None
        }
    }
}

pub async fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "pier.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

pub async fn remove_dir_best_effort(path: &Path, reason: &'static str) -> bool {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "pier.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache directory"
            );
            false
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a uniquely named file under `tmp_dir` for an in-flight write.
///
/// Names embed the pid so crashed leftovers are recognizable (and collectable
/// by GC) across process restarts.
pub async fn open_unique_tmp_file(
    tmp_dir: &Path,
    label: &str,
) -> io::Result<(PathBuf, tokio::fs::File)> {
    tokio::fs::create_dir_all(tmp_dir).await?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = tmp_dir.join(format!("{label}.tmp.{pid}.{counter}"));

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Atomically publish `bytes` at `path` via a unique temp file + rename.
pub async fn atomic_write(path: &Path, tmp_dir: &Path, bytes: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let Some(parent) = path.parent() else {
        return Err(CacheError::Io(io::Error::other("path has no parent")));
    };
    tokio::fs::create_dir_all(parent).await?;

    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "meta".to_string());
    let (tmp_path, mut file) = open_unique_tmp_file(tmp_dir, &label).await?;

    let write_result = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<(), io::Error>(())
    }
    .await;
    drop(file);

    if let Err(err) = write_result {
        remove_file_best_effort(&tmp_path, "atomic_write.write_failed").await;
        return Err(err.into());
    }

    match tokio::fs::rename(&tmp_path, path).await {
        Ok(()) => {
            sync_dir_best_effort(parent).await;
            Ok(())
        }
        Err(err) => {
            remove_file_best_effort(&tmp_path, "atomic_write.rename_failed").await;
            Err(err.into())
        }
    }
}

/// Best-effort durability: fsync the directory entry after a rename so the
/// publish survives a crash or power loss.
pub async fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        static SYNC_DIR_ERROR_LOGGED: OnceLock<()> = OnceLock::new();
        let result = tokio::fs::File::open(dir).await;
        let result = match result {
            Ok(file) => file.sync_all().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if SYNC_DIR_ERROR_LOGGED.set(()).is_ok() {
                    tracing::debug!(
                        target = "pier.cache",
                        dir = %dir.display(),
                        error = %err,
                        "failed to sync cache directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_publishes_and_cleans_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        let dest = dir.path().join("aa").join("meta.json");

        atomic_write(&dest, &tmp, b"{\"v\":1}").await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"{\"v\":1}");

        let mut leftovers = std::fs::read_dir(&tmp).unwrap();
        assert!(leftovers.next().is_none(), "temp file left behind");
    }

    #[tokio::test]
    async fn atomic_write_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        let dest = dir.path().join("meta.json");

        atomic_write(&dest, &tmp, b"old").await.unwrap();
        atomic_write(&dest, &tmp, b"new").await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn read_meta_file_rejects_oversize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let big = vec![b'x'; (META_PAYLOAD_LIMIT_BYTES + 1) as usize];
        tokio::fs::write(&path, &big).await.unwrap();

        assert!(read_meta_file(&path).await.is_none());
        assert!(!path.exists(), "oversized meta should be deleted");
    }
}
