mod support;

use pier_cache::{run_gc_with_target, DriveCache, DriveOptions, PutOptions};
use pier_core::ObjectInfo;
use std::sync::Arc;
use support::ManualClock;

const MB: u64 = 1024 * 1024;

fn opts() -> DriveOptions {
    DriveOptions {
        quota_pct: 100,
        high_watermark_pct: 80,
        low_watermark_pct: 60,
    }
}

async fn put_object(drive: &Arc<DriveCache>, object: &str, len: u64, hits: u32) {
    let info = ObjectInfo {
        bucket: "b".to_string(),
        object: object.to_string(),
        etag: Some(object.to_string()),
        size: len,
        actual_size: len,
        mod_time_millis: 1,
        ..ObjectInfo::default()
    };
    drive
        .put(
            "b",
            object,
            std::io::Cursor::new(vec![0u8; len as usize]),
            len,
            PutOptions {
                info,
                range: None,
                pending_writeback: false,
            },
        )
        .await
        .unwrap();

    for _ in 0..hits {
        drive.save_meta("b", object, None, true, None).await.unwrap();
    }
}

/// Watermark-style eviction over a synthetic 100 MiB working set: inserting
/// forty 2.5 MiB objects and then freeing 40 MiB (the high-to-low watermark
/// gap for an 80/60 split) must retain the newer, hotter tail of the set.
#[tokio::test]
async fn watermark_eviction_prefers_newer_hotter_entries() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at(1_000_000));
    let drive = DriveCache::new(dir.path(), opts(), clock.clone())
        .await
        .unwrap();

    let object_len = 5 * MB / 2;
    for i in 0..40 {
        // Strictly increasing insertion times; the newest quarter is also
        // the hottest.
        clock.advance(60_000);
        let hits = if i >= 30 { 10 } else { 0 };
        put_object(&drive, &format!("k{i:02}"), object_len, hits).await;
    }
    clock.advance(60_000);

    let target = 40 * MB;
    let report = run_gc_with_target(&drive, target).await.unwrap();

    assert!(report.deleted_bytes >= target);
    // The scorer's queue covers the target plus at most one file.
    assert!(report.deleted_bytes < target + 2 * object_len);

    // The oldest, coldest entries die first; the newest survive.
    for i in 0..14 {
        assert!(
            !drive.exists("b", &format!("k{i:02}")).await,
            "expected k{i:02} to be evicted"
        );
    }
    for i in 20..40 {
        assert!(
            drive.exists("b", &format!("k{i:02}")).await,
            "expected k{i:02} to be retained"
        );
    }
}

/// A second pass with nothing over target deletes nothing further.
#[tokio::test]
async fn gc_is_stable_once_under_target() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at(1_000_000));
    let drive = DriveCache::new(dir.path(), opts(), clock.clone())
        .await
        .unwrap();

    for i in 0..4 {
        clock.advance(1_000);
        put_object(&drive, &format!("k{i}"), MB, 0).await;
    }

    let first = run_gc_with_target(&drive, 2 * MB).await.unwrap();
    assert!(first.deleted_bytes >= 2 * MB);

    let second = run_gc_with_target(&drive, 0).await.unwrap();
    assert_eq!(second.deleted_entries, 0);
}
