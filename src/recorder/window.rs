//! Sliding window of buffered segments
//!
//! Keeps the most recent segments covering the configured pre-buffer
//! duration. Evicted segments have their backing files deleted.

use super::segment::SharedSegment;
use std::collections::VecDeque;
use std::time::Duration;

/// FIFO of the most recently completed segments
#[derive(Debug)]
pub struct SegmentWindow {
    segments: VecDeque<SharedSegment>,
    capacity: usize,
}

impl SegmentWindow {
    /// Create a window retaining `target` worth of `segment_duration` segments
    pub fn new(target: Duration, segment_duration: Duration) -> Self {
        let capacity = Self::capacity_for(target, segment_duration);
        Self {
            segments: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// `ceil(target / segment_duration)`, never less than one
    pub fn capacity_for(target: Duration, segment_duration: Duration) -> usize {
        let segment = segment_duration.as_nanos().max(1);
        let count = target.as_nanos().div_ceil(segment);
        usize::try_from(count).unwrap_or(usize::MAX).max(1)
    }

    /// Append a segment, evicting (and deleting) the oldest ones over capacity
    ///
    /// Returns the sequence numbers of evicted segments.
    pub fn push(&mut self, segment: SharedSegment) -> Vec<u64> {
        tracing::debug!(
            "Window push: segment {} ({} held, capacity {})",
            segment.sequence,
            self.segments.len(),
            self.capacity
        );
        self.segments.push_back(segment);
        self.evict_overflow()
    }

    fn evict_overflow(&mut self) -> Vec<u64> {
        let mut evicted = Vec::new();
        while self.segments.len() > self.capacity {
            if let Some(oldest) = self.segments.pop_front() {
                oldest.discard();
                evicted.push(oldest.sequence);
            }
        }
        evicted
    }

    /// Ordered copy of the current contents; the window is left untouched
    pub fn snapshot(&self) -> Vec<SharedSegment> {
        self.segments.iter().cloned().collect()
    }

    /// Forget every segment without deleting its file
    ///
    /// Used once a capture session has taken over the segments.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Forget every segment and delete its file
    pub fn drain_and_discard(&mut self) -> usize {
        let count = self.segments.len();
        for segment in self.segments.drain(..) {
            segment.discard();
        }
        count
    }

    /// Apply new durations; shrinking evicts the oldest segments immediately
    pub fn resize(&mut self, target: Duration, segment_duration: Duration) -> Vec<u64> {
        self.capacity = Self::capacity_for(target, segment_duration);
        self.evict_overflow()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of nominal durations currently held
    pub fn retained_duration(&self) -> Duration {
        self.segments.iter().map(|s| s.nominal_duration).sum()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.sequence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::segment::Segment;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn segment(dir: &Path, sequence: u64) -> SharedSegment {
        let path = dir.join(format!("segment-{:06}.sgmt", sequence));
        std::fs::write(&path, b"segment").unwrap();
        Arc::new(Segment::new(sequence, path, Duration::from_secs(3)))
    }

    #[test]
    fn test_capacity_rounds_up() {
        let three = Duration::from_secs(3);
        assert_eq!(SegmentWindow::capacity_for(Duration::from_secs(9), three), 3);
        assert_eq!(SegmentWindow::capacity_for(Duration::from_secs(10), three), 4);
        assert_eq!(SegmentWindow::capacity_for(Duration::from_millis(500), three), 1);
    }

    #[test]
    fn test_window_keeps_latest_segments() {
        let dir = tempdir().unwrap();
        let mut window = SegmentWindow::new(Duration::from_secs(9), Duration::from_secs(3));

        for seq in 1..=3 {
            assert!(window.push(segment(dir.path(), seq)).is_empty());
        }
        assert_eq!(window.sequences(), vec![1, 2, 3]);

        let first_path = window.snapshot()[0].path.clone();
        assert_eq!(window.push(segment(dir.path(), 4)), vec![1]);
        assert_eq!(window.sequences(), vec![2, 3, 4]);
        assert!(!first_path.exists());
    }

    #[test]
    fn test_window_holds_last_min_n_cap() {
        let dir = tempdir().unwrap();
        for n in 0..8u64 {
            let mut window = SegmentWindow::new(Duration::from_secs(9), Duration::from_secs(3));
            for seq in 1..=n {
                window.push(segment(dir.path(), seq));
            }
            let expected: Vec<u64> = (n.saturating_sub(3) + 1..=n).collect();
            assert_eq!(window.sequences(), expected);
            window.drain_and_discard();
        }
    }

    #[test]
    fn test_snapshot_is_independent_of_window() {
        let dir = tempdir().unwrap();
        let mut window = SegmentWindow::new(Duration::from_secs(6), Duration::from_secs(3));
        window.push(segment(dir.path(), 1));
        window.push(segment(dir.path(), 2));

        let snapshot = window.snapshot();
        window.clear();

        assert!(window.is_empty());
        assert_eq!(snapshot.len(), 2);
        // clear leaves file deletion to whoever owns the snapshot
        assert!(snapshot.iter().all(|s| s.path.exists()));
    }

    #[test]
    fn test_failed_eviction_does_not_block_pushes() {
        let dir = tempdir().unwrap();
        let mut window = SegmentWindow::new(Duration::from_secs(3), Duration::from_secs(3));

        let stubborn = dir.path().join("stubborn");
        std::fs::create_dir(&stubborn).unwrap();
        window.push(Arc::new(Segment::new(1, stubborn, Duration::from_secs(3))));

        assert_eq!(window.push(segment(dir.path(), 2)), vec![1]);
        assert_eq!(window.push(segment(dir.path(), 3)), vec![2]);
        assert_eq!(window.sequences(), vec![3]);
    }

    #[test]
    fn test_resize_evicts_oldest() {
        let dir = tempdir().unwrap();
        let mut window = SegmentWindow::new(Duration::from_secs(9), Duration::from_secs(3));
        for seq in 1..=3 {
            window.push(segment(dir.path(), seq));
        }
        assert_eq!(window.retained_duration(), Duration::from_secs(9));

        assert_eq!(window.resize(Duration::from_secs(3), Duration::from_secs(3)), vec![1, 2]);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.sequences(), vec![3]);
    }
}
