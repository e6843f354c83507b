use crate::error::{CacheError, Result};
use std::fmt::Write as _;

/// One eviction candidate held in the queue.
#[derive(Clone, Debug)]
struct QueuedFile {
    name: String,
    score: f64,
    size: u64,
}

/// Selects an efficient set of files to delete to free `save_bytes`,
/// preferring old, large, low-hit-count files.
///
/// The queue is kept sorted by descending score and trimmed from the back so
/// that it never covers much more than the requested byte target: dropping
/// the current worst candidate would leave less than `save_bytes` queued.
#[derive(Debug)]
pub struct Scorer {
    save_bytes: u64,
    now_millis: u64,
    max_hits: u32,
    queue: Vec<QueuedFile>,
    queued_bytes: u64,
}

impl Scorer {
    pub fn new(save_bytes: u64, now_millis: i64, max_hits: u32) -> Result<Self> {
        if now_millis < 0 {
            return Err(CacheError::config(
                "eviction scorer requires a non-negative clock",
            ));
        }
        Ok(Self {
            save_bytes,
            now_millis: now_millis as u64,
            max_hits,
            queue: Vec::new(),
            queued_bytes: 0,
        })
    }

    /// Score `name` and insert it into the queue if it is worth deleting.
    ///
    /// `time_millis` is the entry's modification time, or its access time
    /// when no modification time is available.
    pub fn add(&mut self, name: impl Into<String>, time_millis: u64, size: u64, hits: u32) {
        if self.save_bytes == 0 {
            return;
        }

        let score = self.score(time_millis, size, hits);

        // Once the queue covers the target, a candidate scoring strictly
        // below the current worst cannot improve the selection.
        if self.queued_bytes >= self.save_bytes {
            if let Some(back) = self.queue.last() {
                if score < back.score {
                    return;
                }
            }
        }

        // Insert after equal scores (stable), except that a score equal to
        // the back's goes in front of the back so trimming still removes the
        // older candidate first.
        let mut idx = self.queue.partition_point(|f| f.score >= score);
        if idx == self.queue.len() && idx > 0 && self.queue[idx - 1].score == score {
            idx -= 1;
        }
        self.queue.insert(
            idx,
            QueuedFile {
                name: name.into(),
                score,
                size,
            },
        );
        self.queued_bytes = self.queued_bytes.saturating_add(size);

        self.trim();
    }

    /// Adjust the byte target after `delta` bytes were freed (negative) or
    /// the target grew (positive). Returns whether deletions are still
    /// needed.
    pub fn adjust_save_bytes(&mut self, delta: i64) -> bool {
        let target = self.save_bytes as i64 + delta;
        self.save_bytes = target.max(0) as u64;

        if self.save_bytes == 0 {
            self.queue.clear();
            self.queued_bytes = 0;
            return false;
        }

        self.trim();
        true
    }

    /// Queued candidates, best-to-delete first.
    pub fn file_names(&self) -> Vec<String> {
        self.queue.iter().map(|f| f.name.clone()).collect()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes
    }

    pub fn save_bytes(&self) -> u64 {
        self.save_bytes
    }

    pub fn queue_debug(&self) -> String {
        let mut out = format!(
            "save_bytes={} queued_bytes={} entries={}",
            self.save_bytes,
            self.queued_bytes,
            self.queue.len()
        );
        for file in &self.queue {
            let _ = write!(
                out,
                "\n  {} score={:.3} size={}",
                file.name, file.score, file.size
            );
        }
        out
    }

    fn score(&self, time_millis: u64, size: u64, hits: u32) -> f64 {
        let age_sec = self.now_millis.saturating_sub(time_millis) as f64 / 1000.0;
        let size_w = (size as f64 / self.save_bytes as f64).clamp(0.0, 1.0);
        let hits_w = if self.max_hits == 0 {
            0.0
        } else {
            1.0 - (hits as f64 / self.max_hits as f64).clamp(0.0, 1.0)
        };
        age_sec * (1.0 + 0.25 * size_w + 0.25 * hits_w)
    }

    fn trim(&mut self) {
        while let Some(back) = self.queue.last() {
            if self.queued_bytes.saturating_sub(back.size) < self.save_bytes {
                break;
            }
            self.queued_bytes = self.queued_bytes.saturating_sub(back.size);
            self.queue.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn rejects_negative_clock() {
        assert!(Scorer::new(MB, -1, 10).is_err());
    }

    #[test]
    fn zero_target_queues_nothing() {
        let mut scorer = Scorer::new(0, 1_000, 10).unwrap();
        scorer.add("a", 0, MB, 0);
        assert!(scorer.file_names().is_empty());
        assert!(!scorer.adjust_save_bytes(0));
    }

    #[test]
    fn old_large_cold_files_score_first() {
        let now = 1_000_000_i64;
        let mut scorer = Scorer::new(100 * MB, now, 10).unwrap();
        scorer.add("new-hot", 990_000, MB, 10);
        scorer.add("old-cold", 10_000, 10 * MB, 0);
        scorer.add("old-hot", 10_000, 10 * MB, 10);

        let names = scorer.file_names();
        assert_eq!(names[0], "old-cold");
        assert_eq!(names[1], "old-hot");
        assert_eq!(names[2], "new-hot");
    }

    #[test]
    fn queue_stays_near_target() {
        // Property: after processing files totalling well over the target,
        // queued bytes land in [save_bytes, save_bytes + max_file_size).
        let save = 10 * MB;
        let mut scorer = Scorer::new(save, 1_000_000, 10).unwrap();
        let file_size = 3 * MB;
        for i in 0..40u64 {
            scorer.add(format!("f{i}"), i * 1_000, file_size, 0);
        }
        assert!(scorer.queued_bytes() >= save);
        assert!(scorer.queued_bytes() < save + file_size);
    }

    #[test]
    fn low_scores_are_skipped_once_covered() {
        let save = 2 * MB;
        let mut scorer = Scorer::new(save, 1_000_000, 10).unwrap();
        scorer.add("old-a", 0, MB, 0);
        scorer.add("old-b", 0, MB, 0);
        assert!(scorer.queued_bytes() >= save);

        let before = scorer.file_names();
        // Far newer, so strictly lower score than anything queued.
        scorer.add("fresh", 999_000, MB, 0);
        assert_eq!(scorer.file_names(), before);
    }

    #[test]
    fn equal_scores_keep_insertion_order() {
        let mut scorer = Scorer::new(100 * MB, 1_000_000, 10).unwrap();
        scorer.add("first", 500_000, MB, 5);
        scorer.add("second", 500_000, MB, 5);
        assert_eq!(scorer.file_names(), vec!["first", "second"]);
    }

    #[test]
    fn adjust_save_bytes_reports_remaining_need() {
        let mut scorer = Scorer::new(4 * MB, 1_000_000, 10).unwrap();
        scorer.add("a", 0, 2 * MB, 0);
        scorer.add("b", 1_000, 2 * MB, 0);

        assert!(scorer.adjust_save_bytes(-(2 * MB as i64)));
        assert!(!scorer.adjust_save_bytes(-(2 * MB as i64)));
        assert!(scorer.file_names().is_empty());
    }

    #[test]
    fn queue_debug_lists_entries() {
        let mut scorer = Scorer::new(MB, 1_000, 10).unwrap();
        scorer.add("entry", 0, 10, 0);
        let debug = scorer.queue_debug();
        assert!(debug.contains("entry"));
        assert!(debug.contains("entries=1"));
    }
}
