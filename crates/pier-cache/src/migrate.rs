use crate::drive::DriveCache;
use crate::error::Result;
use crate::gc::GcError;
use std::path::PathBuf;
use std::sync::Arc;

/// Summary of one drive's format migration.
#[derive(Clone, Debug, Default)]
pub struct MigrateReport {
    pub moved_entries: usize,
    pub errors: Vec<GcError>,
}

/// Migrate a drive from the legacy flat layout (v1: entries directly under
/// the root) to the current two-level prefix layout, then stamp the current
/// format version.
///
/// Migration is move-only: entry contents are renamed, never copied, so an
/// interrupted run leaves every entry in exactly one of the two layouts and
/// the next startup resumes where it stopped.
pub(crate) async fn migrate_drive(drive: &Arc<DriveCache>) -> Result<MigrateReport> {
    let mut report = MigrateReport::default();
    let root = drive.root().to_path_buf();

    let legacy_dirs = {
        let root = root.clone();
        tokio::task::spawn_blocking(move || find_legacy_entry_dirs(&root))
            .await
            .map_err(std::io::Error::other)?
    };

    for legacy in legacy_dirs {
        let Some(name) = legacy.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };

        let prefix_dir = root.join(&name[..2]);
        if let Err(err) = tokio::fs::create_dir_all(&prefix_dir).await {
            report.errors.push(GcError {
                path: prefix_dir,
                action: "create_prefix_dir",
                error: err.to_string(),
            });
            continue;
        }

        let dest = prefix_dir.join(&name);
        match tokio::fs::rename(&legacy, &dest).await {
            Ok(()) => report.moved_entries += 1,
            Err(err) if dest.exists() => {
                // A newer entry already lives at the destination; the legacy
                // copy is a stale duplicate.
                tracing::debug!(
                    target = "pier.cache",
                    legacy = %legacy.display(),
                    error = %err,
                    "dropping stale legacy cache entry"
                );
                crate::util::remove_dir_best_effort(&legacy, "migrate.stale_duplicate").await;
            }
            Err(err) => {
                report.errors.push(GcError {
                    path: legacy,
                    action: "rename_entry",
                    error: err.to_string(),
                });
            }
        }
    }

    if report.errors.is_empty() {
        drive.finish_migration().await?;
        tracing::info!(
            target = "pier.cache",
            drive = %root.display(),
            moved_entries = report.moved_entries,
            "cache drive migration finished"
        );
    } else {
        tracing::warn!(
            target = "pier.cache",
            drive = %root.display(),
            moved_entries = report.moved_entries,
            errors = report.errors.len(),
            "cache drive migration incomplete; drive stays in migrating state"
        );
    }

    Ok(report)
}

fn find_legacy_entry_dirs(root: &std::path::Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return dirs;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        // Legacy entries are full 64-char hex directory names at the root.
        if name.len() != 64 || !name.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::DriveOptions;
    use crate::layout::KeyHash;
    use crate::meta::{DriveFormat, LEGACY_FORMAT_SCHEMA_VERSION, META_FILENAME};
    use pier_core::SystemClock;

    async fn legacy_drive_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let format = DriveFormat {
            schema_version: LEGACY_FORMAT_SCHEMA_VERSION,
            created_at_millis: 0,
        };
        tokio::fs::write(
            dir.path().join("format.json"),
            serde_json::to_vec_pretty(&format).unwrap(),
        )
        .await
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn migrates_legacy_entries_into_prefix_layout() {
        let root = legacy_drive_root().await;

        // A legacy entry at the root.
        let hash = KeyHash::of("b", "k");
        let legacy_dir = root.path().join(hash.as_str());
        tokio::fs::create_dir_all(&legacy_dir).await.unwrap();
        tokio::fs::write(legacy_dir.join(META_FILENAME), b"{}")
            .await
            .unwrap();

        let drive = DriveCache::new(
            root.path(),
            DriveOptions {
                quota_pct: 100,
                high_watermark_pct: 99,
                low_watermark_pct: 60,
            },
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        assert!(drive.is_migrating());

        let report = migrate_drive(&drive).await.unwrap();
        assert_eq!(report.moved_entries, 1);
        assert!(report.errors.is_empty());
        assert!(!drive.is_migrating());

        assert!(!legacy_dir.exists());
        assert!(drive.layout().entry_dir(&hash).join(META_FILENAME).exists());
    }

    #[tokio::test]
    async fn migration_is_a_noop_on_current_drives() {
        let dir = tempfile::tempdir().unwrap();
        let drive = DriveCache::new(
            dir.path(),
            DriveOptions {
                quota_pct: 100,
                high_watermark_pct: 99,
                low_watermark_pct: 60,
            },
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        assert!(!drive.is_migrating());

        let report = migrate_drive(&drive).await.unwrap();
        assert_eq!(report.moved_entries, 0);
    }
}
