use crate::drive::DriveCache;
use crate::error::{CacheError, Result};
use crate::layout::KeyHash;
use std::sync::Arc;

/// Maps `(bucket, object)` keys onto cache drives.
///
/// Consistent hash with circular fallback: the key's hash picks a primary
/// slot, and offline (or absent) slots are skipped by probing the following
/// slots in order. The primary hash is only a hint; a drive dropping out and
/// rejoining does not reshuffle the rest of the key space.
#[derive(Debug)]
pub struct Placement {
    /// Slot positions are fixed at startup; a slot is `None` when its drive
    /// failed to initialize (missing format marker, unreachable path).
    slots: Vec<Option<Arc<DriveCache>>>,
}

impl Placement {
    pub fn new(slots: Vec<Option<Arc<DriveCache>>>) -> Self {
        Self { slots }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// All drives currently able to serve cache traffic.
    pub fn online_drives(&self) -> Vec<Arc<DriveCache>> {
        self.slots
            .iter()
            .flatten()
            .filter(|drive| drive.is_online())
            .cloned()
            .collect()
    }

    /// Every initialized drive, online or not.
    pub fn all_drives(&self) -> Vec<Arc<DriveCache>> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub fn any_migrating(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|drive| drive.is_migrating())
    }

    /// Drive to read `(bucket, object)` from: the first online drive that
    /// holds the entry, else the first online drive probed (so a re-cache
    /// lands on a deterministic home).
    pub async fn locate_for_read(&self, bucket: &str, object: &str) -> Result<Arc<DriveCache>> {
        let mut first_online = None;

        for drive in self.probe_order(bucket, object) {
            if drive.exists(bucket, object).await {
                return Ok(drive);
            }
            if first_online.is_none() {
                first_online = Some(drive);
            }
        }

        first_online.ok_or(CacheError::DriveOffline)
    }

    /// Drive to write `(bucket, object)` to: the first online drive probed,
    /// regardless of existing content.
    pub fn locate_for_write(&self, bucket: &str, object: &str) -> Result<Arc<DriveCache>> {
        self.probe_order(bucket, object)
            .next()
            .ok_or(CacheError::DriveOffline)
    }

    fn probe_order<'a>(
        &'a self,
        bucket: &str,
        object: &str,
    ) -> impl Iterator<Item = Arc<DriveCache>> + 'a {
        let count = self.slots.len();
        let start = if count == 0 {
            0
        } else {
            KeyHash::of(bucket, object).placement_slot(count)
        };

        (0..count).filter_map(move |k| {
            let slot = &self.slots[(start + k) % count];
            slot.as_ref()
                .filter(|drive| drive.is_online())
                .map(Arc::clone)
        })
    }
}
