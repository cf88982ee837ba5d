//! Segment planning for parallel transfers.
//!
//! [`plan_segments`] splits a file into near-equal byte ranges, one per
//! worker, based on what the probe learned about the source. The segment
//! count is `min(threads, ceil(total / min_segment_size))` so small files
//! do not get sliced into ranges not worth a connection. Sources without
//! range support, or with unknown size, always get a single segment.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lifecycle of a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Not yet picked up by a worker.
    Pending,
    /// A worker is currently transferring it.
    Active,
    /// All bytes received and written.
    Done,
    /// The worker gave up on it.
    Failed,
}

/// One contiguous byte range of a download, owned by one worker at a time.
///
/// `start..=end` is inclusive. `end` is `None` for open-ended segments:
/// unknown-size transfers and the zero-byte placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Position of this segment within the plan.
    pub index: usize,
    /// First byte offset of the range.
    pub start: u64,
    /// Last byte offset of the range, inclusive.
    pub end: Option<u64>,
    /// Bytes already received and written for this segment.
    pub bytes_transferred: u64,
    /// Current lifecycle state.
    pub state: SegmentState,
    /// Transfer attempts made so far.
    pub attempts: u32,
    /// Message from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl Segment {
    /// Creates a pending segment covering `start..=end`.
    #[must_use]
    pub fn new(index: usize, start: u64, end: Option<u64>) -> Self {
        Self {
            index,
            start,
            end,
            bytes_transferred: 0,
            state: SegmentState::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    /// Total bytes this segment covers, when the range is bounded.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    /// The absolute file offset the next transfer attempt starts from.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        self.start + self.bytes_transferred
    }

    /// Whether the segment has all its bytes.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == SegmentState::Done
    }
}

/// Plans the segments for a transfer.
///
/// - Known size with range support: up to `threads` near-equal ranges,
///   each at least `min_segment_size` bytes. Division remainders go to the
///   last segment.
/// - Known size without range support: one segment for the whole file.
/// - Unknown size: one open-ended segment.
/// - Zero bytes: one segment already marked [`SegmentState::Done`], so the
///   job can proceed straight to finalization.
#[must_use]
pub fn plan_segments(
    total_size: Option<u64>,
    supports_ranges: bool,
    threads: usize,
    min_segment_size: u64,
) -> Vec<Segment> {
    let threads = threads.max(1) as u64;
    let min_segment_size = min_segment_size.max(1);

    let segments = match total_size {
        Some(0) => {
            let mut segment = Segment::new(0, 0, None);
            segment.state = SegmentState::Done;
            vec![segment]
        }
        Some(total) if supports_ranges => {
            let count = threads.min(total.div_ceil(min_segment_size));
            let base = total / count;

            (0..count)
                .map(|i| {
                    let start = i * base;
                    let end = if i == count - 1 {
                        total - 1
                    } else {
                        start + base - 1
                    };
                    #[allow(clippy::cast_possible_truncation)]
                    Segment::new(i as usize, start, Some(end))
                })
                .collect()
        }
        Some(total) => vec![Segment::new(0, 0, Some(total - 1))],
        None => vec![Segment::new(0, 0, None)],
    };

    debug!(
        segments = segments.len(),
        total_size = ?total_size,
        supports_ranges,
        "planned transfer segments"
    );
    segments
}
