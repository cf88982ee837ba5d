//! Checkpoint persistence for resumable jobs.
//!
//! Each job owns one JSON file under the state directory, named
//! `<job_id>.json`. Writes go through a temporary file and a rename so a
//! crash mid-write never leaves a torn checkpoint behind. Loads are
//! forgiving: a missing or unparseable file reads as "no checkpoint" rather
//! than an error, because the worst outcome is a restart from scratch.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::download::{Segment, SegmentState};
use crate::job::JobId;
use crate::plugin::DownloadTarget;

/// How often the coordinator persists a checkpoint while transferring.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// How long a resolved target URL is trusted before resuming re-resolves it.
///
/// Plugin-extracted URLs are often signed and short-lived. Past this age a
/// resume runs extraction again instead of trusting the stored URL.
pub const TARGET_FRESHNESS: Duration = Duration::from_secs(15 * 60);

/// Errors produced by checkpoint persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// I/O error reading or writing a checkpoint file.
    #[error("I/O error accessing checkpoint: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization error (shouldn't occur for well-formed checkpoints).
    #[error("JSON serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything needed to resume a job after a pause or a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    /// The job this checkpoint belongs to.
    pub job_id: JobId,
    /// Source URL as originally submitted.
    pub source_url: String,
    /// Resolved target from plugin extraction.
    pub target: DownloadTarget,
    /// Final destination path for the completed file.
    pub destination: PathBuf,
    /// Path of the in-progress `.partial` file.
    pub partial_path: PathBuf,
    /// Total size in bytes, when the server declared one.
    pub total_size: Option<u64>,
    /// Whether the transfer runs in ranged mode.
    pub use_ranges: bool,
    /// When the target URL was resolved. Governs [`TARGET_FRESHNESS`].
    pub resolved_at: SystemTime,
    /// Per-segment progress at checkpoint time.
    pub segments: Vec<Segment>,
}

impl ResumeCheckpoint {
    /// Returns true while the resolved target URL is still trusted.
    ///
    /// A `resolved_at` in the future (clock moved backwards) reads as stale,
    /// forcing a harmless re-resolution.
    #[must_use]
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        now.duration_since(self.resolved_at)
            .is_ok_and(|age| age <= TARGET_FRESHNESS)
    }

    /// Sum of bytes transferred across all segments.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_transferred).sum()
    }
}

/// Directory-backed store of [`ResumeCheckpoint`] files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Creates a store rooted at `dir`. The directory is created lazily on
    /// first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the checkpoint file path for a job.
    #[must_use]
    pub fn path_for(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persists a checkpoint atomically (write to `.tmp`, then rename).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the state directory cannot be created
    /// or the file cannot be written.
    #[instrument(skip(self, checkpoint), fields(job_id = %checkpoint.job_id))]
    pub async fn save(&self, checkpoint: &ResumeCheckpoint) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&checkpoint.job_id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint)?;

        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    /// Loads the checkpoint for a job, if one exists.
    ///
    /// A missing file returns `Ok(None)`. So does an unparseable one, after
    /// a warning, since the caller can always restart from scratch. Segments
    /// recorded as `Active` are normalized to `Pending`: the worker that
    /// owned them is gone, but their byte counts still stand.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on I/O failures other than a missing file.
    pub async fn load(&self, id: &JobId) -> Result<Option<ResumeCheckpoint>, CheckpointError> {
        let path = self.path_for(id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match parse_checkpoint(&contents) {
            Some(checkpoint) => Ok(Some(checkpoint)),
            None => {
                warn!(path = %path.display(), "Ignoring unparseable checkpoint");
                Ok(None)
            }
        }
    }

    /// Deletes the checkpoint for a job. Missing files are fine.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on I/O failures other than a missing file.
    pub async fn remove(&self, id: &JobId) -> Result<(), CheckpointError> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Checkpoint removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Loads every parseable checkpoint in the state directory.
    ///
    /// A missing directory yields an empty list. Unparseable files are
    /// skipped with a warning, as are stray `.tmp` leftovers. Results are
    /// sorted by job id for stable iteration order.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the directory cannot be read.
    pub async fn list(&self) -> Result<Vec<ResumeCheckpoint>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                warn!(path = %path.display(), "Skipping unreadable checkpoint");
                continue;
            };
            match parse_checkpoint(&contents) {
                Some(checkpoint) => checkpoints.push(checkpoint),
                None => warn!(path = %path.display(), "Skipping unparseable checkpoint"),
            }
        }

        checkpoints.sort_by(|a, b| a.job_id.as_str().cmp(b.job_id.as_str()));
        Ok(checkpoints)
    }
}

/// Parses checkpoint JSON and normalizes interrupted segments.
fn parse_checkpoint(contents: &str) -> Option<ResumeCheckpoint> {
    let mut checkpoint: ResumeCheckpoint = serde_json::from_str(contents).ok()?;
    for segment in &mut checkpoint.segments {
        if segment.state == SegmentState::Active {
            segment.state = SegmentState::Pending;
        }
    }
    Some(checkpoint)
}
