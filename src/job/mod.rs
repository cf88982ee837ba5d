//! Job lifecycle management: identifiers, states, snapshots, and control errors.
//!
//! A job moves through a fixed state machine:
//!
//! ```text
//! Pending -> Resolving -> Planning -> Transferring -> Merging -> Completed
//!                                         |    ^
//!                                         v    |
//!                                        Paused
//! ```
//!
//! `Failed` and `Cancelled` are reachable from any non-terminal state. `Paused`
//! is reachable only from `Transferring`; resuming re-enters the pipeline at
//! `Pending` and skips the stages the checkpoint already covers.
//!
//! # Features
//!
//! - [`JobId`]: short random identifier, stable across restarts via checkpoints
//! - [`JobState`]: the state machine above, serialized in snake_case
//! - [`JobSnapshot`]: point-in-time progress view published to subscribers
//! - [`ControlError`]: errors from the job control surface (submit, pause, resume, cancel)
//! - [`DownloadManager`]: the control surface itself
//! - [`CheckpointStore`]: persisted resume data, one JSON file per job

use std::fmt;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

mod checkpoint;
mod coordinator;
mod manager;

pub use checkpoint::{
    CHECKPOINT_INTERVAL, CheckpointError, CheckpointStore, ResumeCheckpoint, TARGET_FRESHNESS,
};
pub use manager::{DownloadManager, ProgressSubscription, SubmitRequest};

/// Length of generated job identifiers.
const JOB_ID_LEN: usize = 8;

// ==================== JobId ====================

/// Unique identifier for a download job.
///
/// Generated identifiers are short lowercase alphanumeric strings, convenient
/// to type on a command line. Identifiers survive restarts because they are
/// embedded in the job's checkpoint file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(JOB_ID_LEN)
            .map(char::from)
            .collect();
        Self(id.to_lowercase())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ==================== JobState ====================

/// Lifecycle state of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, waiting for a concurrency slot.
    Pending,
    /// Running plugin extraction on the source URL.
    Resolving,
    /// Probing the server and computing the segment layout.
    Planning,
    /// Segment workers are moving bytes.
    Transferring,
    /// Stopped by user request; checkpoint persisted for resume.
    Paused,
    /// All segments done; verifying and renaming the partial file.
    Merging,
    /// File delivered to its final path.
    Completed,
    /// Unrecoverable error; checkpoint retained where possible.
    Failed,
    /// Abandoned by user request; partial data removed.
    Cancelled,
}

impl JobState {
    /// Returns the snake_case string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Planning => "planning",
            Self::Transferring => "transferring",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true once the job can no longer change state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolving" => Ok(Self::Resolving),
            "planning" => Ok(Self::Planning),
            "transferring" => Ok(Self::Transferring),
            "paused" => Ok(Self::Paused),
            "merging" => Ok(Self::Merging),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid job state: {s}")),
        }
    }
}

// ==================== JobSnapshot ====================

/// Point-in-time view of a job, published on every meaningful change.
///
/// Subscribers always see a complete picture: the snapshot carries state,
/// byte counts, speed, and ETA together so consumers never have to join
/// partial updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job identifier.
    pub id: JobId,
    /// Source URL as submitted.
    pub url: String,
    /// Final filename once known (after resolution and probing).
    pub filename: Option<String>,
    /// Current lifecycle state.
    pub state: JobState,
    /// Total size in bytes when the server declared one.
    pub total_size: Option<u64>,
    /// Bytes transferred across all segments. Monotone non-decreasing
    /// within a plan.
    pub bytes_completed: u64,
    /// Transfer speed over the recent window, in bytes per second.
    pub speed_bps: f64,
    /// Estimated time remaining, when total size and speed allow one.
    pub eta: Option<Duration>,
    /// Number of segments in the current plan.
    pub segments_total: usize,
    /// Number of segments fully transferred.
    pub segments_done: usize,
    /// Error message for `Failed` jobs.
    pub error: Option<String>,
}

impl JobSnapshot {
    /// Creates the initial snapshot for a freshly submitted job.
    #[must_use]
    pub fn new(id: JobId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            filename: None,
            state: JobState::Pending,
            total_size: None,
            bytes_completed: 0,
            speed_bps: 0.0,
            eta: None,
            segments_total: 0,
            segments_done: 0,
            error: None,
        }
    }

    /// Completion percentage, when the total size is known.
    ///
    /// Zero-byte files report 100 percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        match self.total_size {
            Some(0) => Some(100.0),
            Some(total) => Some((self.bytes_completed as f64 / total as f64) * 100.0),
            None => None,
        }
    }
}

// ==================== ControlError ====================

/// Errors from the job control surface.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The supplied configuration failed validation.
    #[error("invalid configuration: {source}")]
    Config {
        /// Underlying validation failure.
        #[source]
        source: ConfigError,
    },

    /// An HTTP client could not be constructed.
    #[error("failed to build HTTP client: {reason}")]
    Client {
        /// Builder error description.
        reason: String,
    },

    /// Checkpoint storage could not be read or written.
    #[error("checkpoint storage error: {reason}")]
    Storage {
        /// I/O or serialization failure description.
        reason: String,
    },

    /// The given job identifier is not registered with this manager.
    #[error("unknown job: {id}")]
    UnknownJob {
        /// The identifier that was looked up.
        id: JobId,
    },

    /// The requested action is not valid in the job's current state.
    #[error("cannot {action} job {id} in state {state}")]
    InvalidState {
        /// The job the action targeted.
        id: JobId,
        /// The action that was attempted.
        action: &'static str,
        /// The state the job was in.
        state: JobState,
    },
}

impl ControlError {
    /// Creates a [`ControlError::Config`].
    #[must_use]
    pub fn config(source: ConfigError) -> Self {
        Self::Config { source }
    }

    /// Creates a [`ControlError::Client`].
    #[must_use]
    pub fn client(reason: impl Into<String>) -> Self {
        Self::Client {
            reason: reason.into(),
        }
    }

    /// Creates a [`ControlError::Storage`].
    #[must_use]
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    /// Creates a [`ControlError::UnknownJob`].
    #[must_use]
    pub fn unknown_job(id: JobId) -> Self {
        Self::UnknownJob { id }
    }

    /// Creates a [`ControlError::InvalidState`].
    #[must_use]
    pub fn invalid_state(id: JobId, action: &'static str, state: JobState) -> Self {
        Self::InvalidState { id, action, state }
    }
}

// Note: no From<reqwest::Error> or From<std::io::Error> impls. Conversions
// are explicit at each call site so the variant always carries context.
