//! Segmented HTTP transfer engine.
//!
//! This module turns one resolved download target into a set of parallel
//! byte-range transfers against a single pre-allocated file.
//!
//! # Features
//!
//! - Range probing (size, range support, server-suggested filename)
//! - Segment planning with a minimum-size floor per range
//! - Per-segment workers with resume-from-offset retries
//! - Automatic fallback to a whole-file transfer when ranges break
//! - Windowed speed and ETA aggregation with bounded publish rate
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//!
//! use parget_core::config::Config;
//! use parget_core::download::{HttpClient, plan_segments};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let client = HttpClient::new(&config)?;
//! let probe = client
//!     .probe("https://example.com/file.zip", &HashMap::new())
//!     .await?;
//! let segments = plan_segments(
//!     probe.total_size,
//!     probe.supports_ranges,
//!     config.threads_per_download,
//!     config.chunk_size,
//! );
//! println!("planned {} segments", segments.len());
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod filename;
mod planner;
mod progress;
mod retry;
pub(crate) mod worker;

pub use client::{HttpClient, ProbeResult};
pub use error::TransferError;
pub use filename::{
    fallback_filename_from_url, filename_from_url_path, parse_content_disposition,
    resolve_unique_path, sanitize_filename,
};
pub use planner::{Segment, SegmentState, plan_segments};
pub use progress::{
    PROGRESS_PUBLISH_INTERVAL, ProgressAggregator, ProgressSample, SPEED_WINDOW,
};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after};
