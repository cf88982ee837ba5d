//! Progress aggregation: byte totals, windowed speed, and ETA.
//!
//! Workers emit a [`ProgressSample`] per received chunk. The
//! [`ProgressAggregator`] folds those into per-job totals and computes
//! speed over a short sliding window, which smooths the bursty chunk
//! arrival pattern of parallel segments. Snapshots are published to
//! subscribers at a bounded rate ([`PROGRESS_PUBLISH_INTERVAL`]), not per
//! sample, so a fast transfer cannot overwhelm a UI consumer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::planner::Segment;
use crate::job::JobId;

/// Minimum interval between published snapshots per job.
pub const PROGRESS_PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Sliding window over which transfer speed is measured.
pub const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// One progress measurement from a segment worker.
///
/// `bytes_transferred` is cumulative for the segment, not a chunk delta,
/// so a lost or reordered sample can never corrupt the totals.
#[derive(Debug, Clone)]
pub struct ProgressSample {
    /// The job this sample belongs to.
    pub job_id: JobId,
    /// Which segment produced it.
    pub segment_index: usize,
    /// Cumulative bytes the segment has written so far.
    pub bytes_transferred: u64,
    /// When the chunk was received.
    pub at: Instant,
}

/// Sliding window of `(instant, cumulative job bytes)` observations.
#[derive(Debug)]
struct SpeedWindow {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    fn record(&mut self, at: Instant, total_bytes: u64) {
        self.samples.push_back((at, total_bytes));
        // Drop observations older than the window, but keep at least two
        // so sparse updates still yield a speed.
        while self.samples.len() > 2 {
            let Some(&(oldest, _)) = self.samples.front() else {
                break;
            };
            if at.duration_since(oldest) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn speed_bps(&self) -> f64 {
        let (Some(&(oldest_at, oldest_bytes)), Some(&(newest_at, newest_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };

        let elapsed = newest_at.duration_since(oldest_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (newest_bytes.saturating_sub(oldest_bytes)) as f64 / elapsed
    }
}

/// Per-job fold over worker progress samples.
///
/// Purely computational: the coordinator feeds it samples and reads
/// totals, speed, and ETA off it when building a published snapshot.
#[derive(Debug)]
pub struct ProgressAggregator {
    total_size: Option<u64>,
    segment_bytes: Vec<u64>,
    window: SpeedWindow,
    last_publish: Option<Instant>,
}

impl ProgressAggregator {
    /// Creates an aggregator seeded from the planned segments, so a
    /// resumed job starts reporting from its checkpointed byte counts
    /// instead of zero.
    #[must_use]
    pub fn new(total_size: Option<u64>, segments: &[Segment]) -> Self {
        Self {
            total_size,
            segment_bytes: segments.iter().map(|s| s.bytes_transferred).collect(),
            window: SpeedWindow::new(SPEED_WINDOW),
            last_publish: None,
        }
    }

    /// Folds one sample in.
    ///
    /// Per-segment counts only move forward; a stale sample arriving after
    /// a fresher one cannot make `bytes_completed` regress.
    pub fn record(&mut self, sample: &ProgressSample) {
        let Some(bytes) = self.segment_bytes.get_mut(sample.segment_index) else {
            return;
        };
        *bytes = (*bytes).max(sample.bytes_transferred);

        let total = self.bytes_completed();
        self.window.record(sample.at, total);
    }

    /// Total bytes transferred across every segment.
    #[must_use]
    pub fn bytes_completed(&self) -> u64 {
        self.segment_bytes.iter().sum()
    }

    /// Instantaneous speed in bytes per second over the sliding window.
    #[must_use]
    pub fn speed_bps(&self) -> f64 {
        self.window.speed_bps()
    }

    /// Estimated time to completion.
    ///
    /// `None` when the total size is unknown or the measured speed is
    /// (effectively) zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_size?;
        let speed = self.speed_bps();
        if speed <= f64::EPSILON {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes_completed());
        Duration::try_from_secs_f64(remaining as f64 / speed).ok()
    }

    /// Whether enough time has passed since the last published snapshot.
    #[must_use]
    pub fn should_publish(&self, at: Instant) -> bool {
        self.last_publish
            .is_none_or(|last| at.duration_since(last) >= PROGRESS_PUBLISH_INTERVAL)
    }

    /// Records that a snapshot was published at `at`.
    pub fn mark_published(&mut self, at: Instant) {
        self.last_publish = Some(at);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::plan_segments;

    fn sample(segment_index: usize, bytes: u64, at: Instant) -> ProgressSample {
        ProgressSample {
            job_id: JobId::from("testjob1"),
            segment_index,
            bytes_transferred: bytes,
            at,
        }
    }

    #[test]
    fn test_aggregator_seeds_from_segment_bytes() {
        let mut segments = plan_segments(Some(4000), true, 4, 1);
        segments[0].bytes_transferred = 500;
        segments[2].bytes_transferred = 250;

        let aggregator = ProgressAggregator::new(Some(4000), &segments);
        assert_eq!(aggregator.bytes_completed(), 750);
    }

    #[test]
    fn test_record_sums_across_segments() {
        let segments = plan_segments(Some(4000), true, 4, 1);
        let mut aggregator = ProgressAggregator::new(Some(4000), &segments);
        let t0 = Instant::now();

        aggregator.record(&sample(0, 100, t0));
        aggregator.record(&sample(1, 200, t0));
        aggregator.record(&sample(3, 50, t0));

        assert_eq!(aggregator.bytes_completed(), 350);
    }

    #[test]
    fn test_record_is_monotone_per_segment() {
        let segments = plan_segments(Some(4000), true, 4, 1);
        let mut aggregator = ProgressAggregator::new(Some(4000), &segments);
        let t0 = Instant::now();

        aggregator.record(&sample(0, 300, t0));
        // A stale sample with a lower count must not regress the total
        aggregator.record(&sample(0, 100, t0 + Duration::from_millis(10)));

        assert_eq!(aggregator.bytes_completed(), 300);
    }

    #[test]
    fn test_record_ignores_out_of_range_segment_index() {
        let segments = plan_segments(Some(4000), true, 2, 1);
        let mut aggregator = ProgressAggregator::new(Some(4000), &segments);

        aggregator.record(&sample(9, 100, Instant::now()));
        assert_eq!(aggregator.bytes_completed(), 0);
    }

    #[test]
    fn test_speed_from_two_samples() {
        let segments = plan_segments(Some(10_000_000), true, 1, 1);
        let mut aggregator = ProgressAggregator::new(Some(10_000_000), &segments);
        let t0 = Instant::now();

        aggregator.record(&sample(0, 0, t0));
        aggregator.record(&sample(0, 1_048_576, t0 + Duration::from_secs(1)));

        let speed = aggregator.speed_bps();
        assert!(
            (speed - 1_048_576.0).abs() < 1.0,
            "expected ~1 MiB/s, got {speed}"
        );
    }

    #[test]
    fn test_speed_zero_without_enough_samples() {
        let segments = plan_segments(Some(1000), true, 1, 1);
        let mut aggregator = ProgressAggregator::new(Some(1000), &segments);
        assert!(aggregator.speed_bps().abs() < f64::EPSILON);

        aggregator.record(&sample(0, 100, Instant::now()));
        assert!(aggregator.speed_bps().abs() < f64::EPSILON);
    }

    #[test]
    fn test_speed_window_drops_old_samples() {
        let segments = plan_segments(Some(100_000), true, 1, 1);
        let mut aggregator = ProgressAggregator::new(Some(100_000), &segments);
        let t0 = Instant::now();

        // A burst long ago, then a slow trickle: speed must reflect the
        // recent window, not the all-time average.
        aggregator.record(&sample(0, 0, t0));
        aggregator.record(&sample(0, 50_000, t0 + Duration::from_secs(1)));
        aggregator.record(&sample(0, 50_100, t0 + Duration::from_secs(10)));
        aggregator.record(&sample(0, 50_200, t0 + Duration::from_secs(11)));

        let speed = aggregator.speed_bps();
        assert!(
            speed < 1000.0,
            "old burst should have aged out of the window, got {speed}"
        );
    }

    #[test]
    fn test_speed_retains_two_samples_when_updates_are_sparse() {
        let segments = plan_segments(Some(100_000), true, 1, 1);
        let mut aggregator = ProgressAggregator::new(Some(100_000), &segments);
        let t0 = Instant::now();

        // Two samples further apart than the window must still produce a speed
        aggregator.record(&sample(0, 0, t0));
        aggregator.record(&sample(0, 20_000, t0 + Duration::from_secs(20)));

        let speed = aggregator.speed_bps();
        assert!((speed - 1000.0).abs() < 1.0, "expected ~1000 B/s, got {speed}");
    }

    #[test]
    fn test_eta_from_remaining_and_speed() {
        let total = 10 * 1_048_576;
        let segments = plan_segments(Some(total), true, 1, 1);
        let mut aggregator = ProgressAggregator::new(Some(total), &segments);
        let t0 = Instant::now();

        // 1 MiB/s measured, 5 MiB remaining after this sample
        aggregator.record(&sample(0, 4 * 1_048_576, t0));
        aggregator.record(&sample(0, 5 * 1_048_576, t0 + Duration::from_secs(1)));

        let eta = aggregator.eta().unwrap();
        assert!(
            (eta.as_secs_f64() - 5.0).abs() < 0.1,
            "expected ~5s, got {eta:?}"
        );
    }

    #[test]
    fn test_eta_indeterminate_without_total_size() {
        let segments = plan_segments(None, true, 4, 1);
        let mut aggregator = ProgressAggregator::new(None, &segments);
        let t0 = Instant::now();

        aggregator.record(&sample(0, 0, t0));
        aggregator.record(&sample(0, 1000, t0 + Duration::from_secs(1)));

        assert_eq!(aggregator.eta(), None);
    }

    #[test]
    fn test_eta_indeterminate_at_zero_speed() {
        let segments = plan_segments(Some(1000), true, 1, 1);
        let aggregator = ProgressAggregator::new(Some(1000), &segments);
        assert_eq!(aggregator.eta(), None);
    }

    #[test]
    fn test_publish_throttling() {
        let segments = plan_segments(Some(1000), true, 1, 1);
        let mut aggregator = ProgressAggregator::new(Some(1000), &segments);
        let t0 = Instant::now();

        // First publish always allowed
        assert!(aggregator.should_publish(t0));
        aggregator.mark_published(t0);

        assert!(!aggregator.should_publish(t0 + Duration::from_millis(50)));
        assert!(aggregator.should_publish(t0 + Duration::from_millis(100)));
    }
}
