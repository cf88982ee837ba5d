//! Per-job coordinator: resolve, plan, transfer, merge.
//!
//! One [`JobRunner`] task owns each job from submission to a terminal
//! state. It resolves the source through the plugin registry, probes the
//! server, plans segments, fans work out to [`SegmentWorker`] tasks over a
//! bounded event channel, persists a [`ResumeCheckpoint`] on an interval,
//! and finishes by verifying and renaming the `.partial` file.
//!
//! Stops arrive through a cancellation token plus an intent flag: the token
//! says "stop now", the intent says whether the user meant pause (keep
//! checkpoint and partial) or cancel (remove both).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Instant, SystemTime};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::download::worker::{SegmentWorker, WorkerEvent};
use crate::download::{
    HttpClient, ProbeResult, ProgressAggregator, RetryDecision, RetryPolicy, Segment,
    SegmentState, TransferError, classify_error, fallback_filename_from_url, plan_segments,
    resolve_unique_path,
};
use crate::job::checkpoint::{CHECKPOINT_INTERVAL, CheckpointStore, ResumeCheckpoint};
use crate::job::manager::ManagerInner;
use crate::job::{JobId, JobSnapshot, JobState};
use crate::plugin::{DownloadTarget, PluginRegistry};

/// Capacity of the worker-to-coordinator event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Read buffer size for checksum verification.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// What the user meant when they fired the stop token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopIntent {
    /// Keep the checkpoint and partial file for a later resume.
    Pause,
    /// Discard the job's on-disk state.
    Cancel,
}

/// Where a job picks up when its runner starts.
pub(crate) enum StartMode {
    /// New submission: resolve the source URL from scratch.
    Fresh,
    /// Sibling job for an extra target from a multi-target extraction.
    /// Resolution already happened; start at planning.
    Resolved(DownloadTarget),
    /// Continue from a persisted checkpoint.
    Resume(ResumeCheckpoint),
}

/// Terminal result of a runner, before intent is applied.
enum JobOutcome {
    Completed,
    Failed { message: String },
    Stopped { checkpoint: Option<ResumeCheckpoint> },
}

/// Why the transfer phase ended.
enum TransferOutcome {
    /// Every segment reached `Done`.
    AllDone,
    /// A worker saw its range refused or ignored; replan unranged.
    RangeFallback,
    /// A segment gave up. The whole job fails.
    Failed(String),
    /// The stop token fired.
    Stopped,
}

/// Drives one download job to a terminal state.
pub(crate) struct JobRunner {
    pub id: JobId,
    pub source_url: String,
    /// Per-job destination override. Falls back to the configured
    /// download directory.
    pub destination_dir: Option<PathBuf>,
    /// Per-job segment count override.
    pub threads: Option<usize>,
    pub config: Arc<Config>,
    pub registry: Arc<PluginRegistry>,
    pub client: HttpClient,
    pub store: CheckpointStore,
    pub snapshot_tx: Arc<watch::Sender<JobSnapshot>>,
    pub stop: CancellationToken,
    pub intent: Arc<StdMutex<Option<StopIntent>>>,
    /// Concurrency gate shared by all jobs. Permits are granted in FIFO
    /// submission order.
    pub admission: Arc<Semaphore>,
    /// Backref for spawning sibling jobs out of multi-target extractions.
    pub manager: Weak<ManagerInner>,
    pub start: StartMode,
}

impl JobRunner {
    /// Runs the job to a terminal state, publishing snapshots throughout.
    #[instrument(skip(self), fields(job_id = %self.id, url = %self.source_url))]
    pub(crate) async fn run(mut self) {
        let mut snapshot = JobSnapshot::new(self.id.clone(), self.source_url.clone());
        if let StartMode::Resume(checkpoint) = &self.start {
            seed_snapshot_from_checkpoint(&mut snapshot, checkpoint);
        }
        self.set_state(&mut snapshot, JobState::Pending);

        let outcome = self.run_to_outcome(&mut snapshot).await;
        self.finalize(outcome, &mut snapshot).await;
    }

    /// The happy-path pipeline. Returns as soon as any phase hits a
    /// terminal condition.
    async fn run_to_outcome(&mut self, snapshot: &mut JobSnapshot) -> JobOutcome {
        // Wait for a concurrency slot. A stop during the wait never
        // touches disk state beyond what already exists.
        let _permit = tokio::select! {
            () = self.stop.cancelled() => return JobOutcome::Stopped { checkpoint: None },
            permit = Arc::clone(&self.admission).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return JobOutcome::Failed {
                        message: "admission queue closed".to_string(),
                    };
                }
            },
        };

        let start = std::mem::replace(&mut self.start, StartMode::Fresh);
        let mut checkpoint = match start {
            StartMode::Resume(checkpoint) => {
                match self.prepare_resume(checkpoint, snapshot).await {
                    Ok(checkpoint) => checkpoint,
                    Err(outcome) => return outcome,
                }
            }
            StartMode::Resolved(target) => match self.prepare_fresh(target, snapshot).await {
                Ok(checkpoint) => checkpoint,
                Err(outcome) => return outcome,
            },
            StartMode::Fresh => {
                let target = match self.resolve(snapshot, true).await {
                    Ok(target) => target,
                    Err(outcome) => return outcome,
                };
                match self.prepare_fresh(target, snapshot).await {
                    Ok(checkpoint) => checkpoint,
                    Err(outcome) => return outcome,
                }
            }
        };

        // Transfer until every segment is done. A refused range replans
        // the job as a single unranged segment and goes around again.
        loop {
            self.set_state(snapshot, JobState::Transferring);
            match self.run_transfer(&mut checkpoint, snapshot).await {
                TransferOutcome::AllDone => break,
                TransferOutcome::RangeFallback => {
                    warn!("server stopped honoring ranges, replanning as single transfer");
                    self.replan_unranged(&mut checkpoint, snapshot).await;
                }
                TransferOutcome::Failed(message) => {
                    self.persist(&checkpoint).await;
                    return JobOutcome::Failed { message };
                }
                TransferOutcome::Stopped => {
                    // A pause that lands in the same instant as the last
                    // segment loses: everything is on disk, so finish.
                    if self.stop_intent() != Some(StopIntent::Cancel)
                        && checkpoint.segments.iter().all(Segment::is_done)
                    {
                        break;
                    }
                    return JobOutcome::Stopped {
                        checkpoint: Some(checkpoint),
                    };
                }
            }
        }

        self.persist(&checkpoint).await;
        self.set_state(snapshot, JobState::Merging);
        self.merge(&checkpoint, snapshot).await
    }

    // ==================== Resolution ====================

    /// Resolves the source URL into a transfer target via the plugin
    /// registry. Extra targets become sibling jobs when `spawn_siblings`
    /// is set; re-resolutions pass false so a resume never duplicates
    /// jobs that were already created at submit time.
    async fn resolve(
        &self,
        snapshot: &mut JobSnapshot,
        spawn_siblings: bool,
    ) -> Result<DownloadTarget, JobOutcome> {
        self.set_state(snapshot, JobState::Resolving);

        let plugin = self.registry.resolver_for(&self.source_url);
        let plugin_name = plugin.descriptor().name.clone();
        debug!(plugin = %plugin_name, "resolving source");

        let targets = tokio::select! {
            () = self.stop.cancelled() => {
                return Err(JobOutcome::Stopped { checkpoint: None });
            }
            result = plugin.extract(&self.source_url) => match result {
                Ok(targets) => targets,
                Err(error) => {
                    return Err(JobOutcome::Failed {
                        message: error.to_string(),
                    });
                }
            },
        };

        let mut targets = targets.into_iter();
        let Some(first) = targets.next() else {
            return Err(JobOutcome::Failed {
                message: format!("plugin '{plugin_name}' produced no download targets"),
            });
        };

        let rest: Vec<DownloadTarget> = targets.collect();
        if rest.is_empty() {
            return Ok(first);
        }
        if spawn_siblings {
            if let Some(manager) = self.manager.upgrade() {
                info!(count = rest.len(), "spawning sibling jobs for extra targets");
                for target in rest {
                    manager.spawn_sibling(
                        &self.source_url,
                        target,
                        self.destination_dir.clone(),
                        self.threads,
                    );
                }
            }
        } else {
            debug!(count = rest.len(), "ignoring extra targets on re-resolution");
        }
        Ok(first)
    }

    // ==================== Planning ====================

    /// Probes the target, picks a destination, plans segments, creates the
    /// partial file, and writes the first checkpoint.
    async fn prepare_fresh(
        &self,
        mut target: DownloadTarget,
        snapshot: &mut JobSnapshot,
    ) -> Result<ResumeCheckpoint, JobOutcome> {
        self.set_state(snapshot, JobState::Planning);
        let resolved_at = SystemTime::now();

        let probe = match self.probe_with_retry(&target.url, &target.headers).await {
            Ok(Some(probe)) => probe,
            Ok(None) => return Err(JobOutcome::Stopped { checkpoint: None }),
            Err(error) => {
                return Err(JobOutcome::Failed {
                    message: error.to_string(),
                });
            }
        };

        // Workers hit the post-redirect URL directly. The original source
        // URL stays in the checkpoint for re-resolution.
        target.url = probe.final_url.clone();

        let destination = match self.pick_destination(&target, &probe).await {
            Ok(destination) => destination,
            Err(error) => {
                return Err(JobOutcome::Failed {
                    message: error.to_string(),
                });
            }
        };
        let partial_path = partial_path_for(&destination);

        let total_size = probe.total_size.or(target.declared_size);
        let use_ranges = probe.supports_ranges;
        let threads = self.threads.unwrap_or(self.config.threads_per_download);
        let segments = plan_segments(total_size, use_ranges, threads, self.config.chunk_size);

        info!(
            total_size = ?total_size,
            use_ranges,
            segments = segments.len(),
            destination = %destination.display(),
            "planned download"
        );

        let checkpoint = ResumeCheckpoint {
            job_id: self.id.clone(),
            source_url: self.source_url.clone(),
            target,
            destination,
            partial_path,
            total_size,
            use_ranges,
            resolved_at,
            segments,
        };

        if let Err(error) = prepare_partial_file(&checkpoint).await {
            return Err(JobOutcome::Failed {
                message: error.to_string(),
            });
        }
        self.persist(&checkpoint).await;

        seed_snapshot_from_checkpoint(snapshot, &checkpoint);
        self.publish(snapshot);
        Ok(checkpoint)
    }

    /// Validates a loaded checkpoint and decides how much of it to trust.
    ///
    /// - partial file missing: full restart
    /// - fresh checkpoint: reuse the stored target URL as-is
    /// - stale checkpoint: re-resolve and re-probe; segment progress
    ///   survives only if the file still has the same size and the server
    ///   still honors ranges
    async fn prepare_resume(
        &self,
        mut checkpoint: ResumeCheckpoint,
        snapshot: &mut JobSnapshot,
    ) -> Result<ResumeCheckpoint, JobOutcome> {
        let partial_exists = tokio::fs::try_exists(&checkpoint.partial_path)
            .await
            .unwrap_or(false);
        if !partial_exists {
            warn!(
                path = %checkpoint.partial_path.display(),
                "partial file missing, restarting from scratch"
            );
            let target = self.resolve(snapshot, false).await?;
            return self.prepare_fresh(target, snapshot).await;
        }

        if checkpoint.is_fresh(SystemTime::now()) {
            debug!("checkpoint is fresh, reusing resolved target");
            reset_unranged_progress(&mut checkpoint);
            seed_snapshot_from_checkpoint(snapshot, &checkpoint);
            self.publish(snapshot);
            return Ok(checkpoint);
        }

        info!("checkpoint target is stale, re-resolving");
        let mut target = self.resolve(snapshot, false).await?;

        self.set_state(snapshot, JobState::Planning);
        let probe = match self.probe_with_retry(&target.url, &target.headers).await {
            Ok(Some(probe)) => probe,
            Ok(None) => {
                return Err(JobOutcome::Stopped {
                    checkpoint: Some(checkpoint),
                });
            }
            Err(error) => {
                return Err(JobOutcome::Failed {
                    message: error.to_string(),
                });
            }
        };
        target.url = probe.final_url.clone();

        let total_size = probe.total_size.or(target.declared_size);
        let same_shape = checkpoint.use_ranges
            && probe.supports_ranges
            && total_size == checkpoint.total_size;

        checkpoint.target = target;
        checkpoint.resolved_at = SystemTime::now();

        if !same_shape {
            info!(
                old_size = ?checkpoint.total_size,
                new_size = ?total_size,
                "source changed since checkpoint, replanning from scratch"
            );
            let threads = self.threads.unwrap_or(self.config.threads_per_download);
            checkpoint.total_size = total_size;
            checkpoint.use_ranges = probe.supports_ranges;
            checkpoint.segments =
                plan_segments(total_size, probe.supports_ranges, threads, self.config.chunk_size);
            if let Err(error) = prepare_partial_file(&checkpoint).await {
                return Err(JobOutcome::Failed {
                    message: error.to_string(),
                });
            }
        }
        reset_unranged_progress(&mut checkpoint);

        self.persist(&checkpoint).await;
        seed_snapshot_from_checkpoint(snapshot, &checkpoint);
        self.publish(snapshot);
        Ok(checkpoint)
    }

    /// Probes with the configured retry budget. `Ok(None)` means the stop
    /// token fired mid-probe.
    async fn probe_with_retry(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Option<ProbeResult>, TransferError> {
        let policy = RetryPolicy::with_max_retries(self.config.max_retries);
        let mut attempts = 0u32;

        loop {
            let result = tokio::select! {
                () = self.stop.cancelled() => return Ok(None),
                result = self.client.probe(url, headers) => result,
            };
            let error = match result {
                Ok(probe) => return Ok(Some(probe)),
                Err(error) => error,
            };

            attempts += 1;
            match policy.should_retry(classify_error(&error), attempts) {
                RetryDecision::Retry { delay, attempt } => {
                    info!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying probe"
                    );
                    tokio::select! {
                        () = self.stop.cancelled() => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(%reason, "probe giving up");
                    return Err(error);
                }
            }
        }
    }

    /// Picks the final destination path. Filename preference order:
    /// Content-Disposition, then the plugin's suggestion, then the last
    /// URL path segment.
    async fn pick_destination(
        &self,
        target: &DownloadTarget,
        probe: &ProbeResult,
    ) -> Result<PathBuf, TransferError> {
        let dir = self
            .destination_dir
            .clone()
            .unwrap_or_else(|| self.config.download_dir.clone());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::io(&dir, e))?;

        let filename = probe
            .content_disposition_filename
            .clone()
            .or_else(|| target.suggested_filename.clone())
            .unwrap_or_else(|| fallback_filename_from_url(&target.url));

        Ok(resolve_unique_path(&dir, &filename))
    }

    // ==================== Transfer ====================

    /// Spawns a worker per unfinished segment and consumes their events
    /// until the transfer finishes, fails, falls back, or is stopped.
    #[allow(clippy::too_many_lines)]
    async fn run_transfer(
        &self,
        checkpoint: &mut ResumeCheckpoint,
        snapshot: &mut JobSnapshot,
    ) -> TransferOutcome {
        if checkpoint.segments.iter().all(Segment::is_done) {
            return TransferOutcome::AllDone;
        }

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let workers_cancel = self.stop.child_token();
        let policy = RetryPolicy::with_max_retries(self.config.max_retries);
        let mut join_set = JoinSet::new();

        for segment in &mut checkpoint.segments {
            if segment.is_done() {
                continue;
            }
            segment.state = SegmentState::Active;
            let worker = SegmentWorker {
                job_id: self.id.clone(),
                segment: segment.clone(),
                url: checkpoint.target.url.clone(),
                headers: checkpoint.target.headers.clone(),
                path: checkpoint.partial_path.clone(),
                ranged: checkpoint.use_ranges,
                client: self.client.clone(),
                policy: policy.clone(),
                events: event_tx.clone(),
                cancel: workers_cancel.clone(),
            };
            join_set.spawn(worker.run());
        }
        // Workers hold the only senders; the channel closing means they
        // are all gone.
        drop(event_tx);

        let mut aggregator = ProgressAggregator::new(checkpoint.total_size, &checkpoint.segments);
        let mut checkpoint_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + CHECKPOINT_INTERVAL,
            CHECKPOINT_INTERVAL,
        );
        checkpoint_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                () = self.stop.cancelled() => break TransferOutcome::Stopped,
                _ = checkpoint_timer.tick() => {
                    self.persist(checkpoint).await;
                }
                event = event_rx.recv() => match event {
                    Some(WorkerEvent::Progress(sample)) => {
                        if let Some(segment) = checkpoint.segments.get_mut(sample.segment_index) {
                            segment.bytes_transferred =
                                segment.bytes_transferred.max(sample.bytes_transferred);
                        }
                        aggregator.record(&sample);
                        let now = Instant::now();
                        if aggregator.should_publish(now) {
                            update_progress(snapshot, &aggregator);
                            self.publish(snapshot);
                            aggregator.mark_published(now);
                        }
                    }
                    Some(WorkerEvent::SegmentDone { index }) => {
                        if let Some(segment) = checkpoint.segments.get_mut(index) {
                            segment.state = SegmentState::Done;
                            if let Some(size) = segment.size() {
                                segment.bytes_transferred = size;
                            }
                        }
                        let done = checkpoint.segments.iter().filter(|s| s.is_done()).count();
                        debug!(segment = index, done, total = checkpoint.segments.len(), "segment finished");
                        snapshot.segments_done = done;
                        update_progress(snapshot, &aggregator);
                        self.publish(snapshot);
                        if done == checkpoint.segments.len() {
                            break TransferOutcome::AllDone;
                        }
                    }
                    Some(WorkerEvent::SegmentFailed { index, error }) => {
                        if let Some(segment) = checkpoint.segments.get_mut(index) {
                            segment.state = SegmentState::Failed;
                            segment.last_error = Some(error.to_string());
                        }
                        break TransferOutcome::Failed(error.to_string());
                    }
                    Some(WorkerEvent::RangeRejected { index }) => {
                        debug!(segment = index, "range rejected event received");
                        break TransferOutcome::RangeFallback;
                    }
                    None => {
                        break if checkpoint.segments.iter().all(Segment::is_done) {
                            TransferOutcome::AllDone
                        } else {
                            TransferOutcome::Failed(
                                "transfer workers exited unexpectedly".to_string(),
                            )
                        };
                    }
                },
            }
        };

        // Stop the survivors and drain their events while joining, so a
        // worker blocked on a full channel can still exit. Progress and
        // completion events seen here still count toward the checkpoint.
        workers_cancel.cancel();
        loop {
            tokio::select! {
                joined = join_set.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                event = event_rx.recv() => match event {
                    Some(event) => note_late_event(checkpoint, &event),
                    None => {
                        while join_set.join_next().await.is_some() {}
                        break;
                    }
                },
            }
        }

        outcome
    }

    /// Collapses the plan to a single unranged segment after a range
    /// rejection. The worker restarts unranged transfers from zero, so
    /// all prior progress is discarded.
    async fn replan_unranged(&self, checkpoint: &mut ResumeCheckpoint, snapshot: &mut JobSnapshot) {
        checkpoint.use_ranges = false;
        checkpoint.segments = plan_segments(checkpoint.total_size, false, 1, self.config.chunk_size);
        self.persist(checkpoint).await;

        seed_snapshot_from_checkpoint(snapshot, checkpoint);
        snapshot.speed_bps = 0.0;
        snapshot.eta = None;
        self.publish(snapshot);
    }

    // ==================== Merge ====================

    /// Verifies the assembled partial file and moves it into place.
    ///
    /// On verification failure the partial file and checkpoint are left on
    /// disk for inspection and a possible retry.
    async fn merge(&self, checkpoint: &ResumeCheckpoint, snapshot: &mut JobSnapshot) -> JobOutcome {
        let partial = &checkpoint.partial_path;

        if let Err(error) = sync_file(partial).await {
            return JobOutcome::Failed {
                message: error.to_string(),
            };
        }

        let actual_len = match tokio::fs::metadata(partial).await {
            Ok(metadata) => metadata.len(),
            Err(error) => {
                return JobOutcome::Failed {
                    message: TransferError::io(partial, error).to_string(),
                };
            }
        };
        if let Some(total) = checkpoint.total_size {
            if actual_len != total {
                return JobOutcome::Failed {
                    message: TransferError::size_mismatch(partial, total, actual_len).to_string(),
                };
            }
        }

        if let Some(expected) = expected_sha256(checkpoint.target.checksum.as_deref()) {
            let actual = match file_sha256(partial).await {
                Ok(digest) => digest,
                Err(error) => {
                    return JobOutcome::Failed {
                        message: error.to_string(),
                    };
                }
            };
            if actual != expected {
                return JobOutcome::Failed {
                    message: TransferError::checksum_mismatch(partial, expected, actual)
                        .to_string(),
                };
            }
            debug!("checksum verified");
        }

        // The planned name may have been taken while this job ran.
        let destination = if tokio::fs::try_exists(&checkpoint.destination)
            .await
            .unwrap_or(false)
        {
            let dir = checkpoint.destination.parent().unwrap_or(Path::new("."));
            let name = checkpoint
                .destination
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("download.bin");
            resolve_unique_path(dir, name)
        } else {
            checkpoint.destination.clone()
        };

        if let Err(error) = tokio::fs::rename(partial, &destination).await {
            return JobOutcome::Failed {
                message: TransferError::io(&destination, error).to_string(),
            };
        }
        if let Err(error) = self.store.remove(&self.id).await {
            warn!(job_id = %self.id, error = %error, "failed to remove checkpoint");
        }

        snapshot.filename = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        snapshot.speed_bps = 0.0;
        snapshot.eta = None;
        info!(path = %destination.display(), "download complete");
        JobOutcome::Completed
    }

    // ==================== Finalization ====================

    /// Applies the outcome, folding in the user's stop intent.
    async fn finalize(&self, outcome: JobOutcome, snapshot: &mut JobSnapshot) {
        match outcome {
            JobOutcome::Completed => {
                self.set_state(snapshot, JobState::Completed);
            }
            JobOutcome::Failed { message } => {
                error!(error = %message, "job failed");
                snapshot.error = Some(message);
                snapshot.speed_bps = 0.0;
                snapshot.eta = None;
                self.set_state(snapshot, JobState::Failed);
            }
            JobOutcome::Stopped { checkpoint } => match self.stop_intent() {
                Some(StopIntent::Cancel) => self.finalize_cancel(checkpoint, snapshot).await,
                Some(StopIntent::Pause) | None => {
                    self.finalize_pause(checkpoint, snapshot).await;
                }
            },
        }
    }

    async fn finalize_pause(
        &self,
        checkpoint: Option<ResumeCheckpoint>,
        snapshot: &mut JobSnapshot,
    ) {
        if let Some(checkpoint) = checkpoint {
            self.persist(&checkpoint).await;
            seed_snapshot_from_checkpoint(snapshot, &checkpoint);
        }
        snapshot.speed_bps = 0.0;
        snapshot.eta = None;
        info!("job paused");
        self.set_state(snapshot, JobState::Paused);
    }

    async fn finalize_cancel(
        &self,
        checkpoint: Option<ResumeCheckpoint>,
        snapshot: &mut JobSnapshot,
    ) {
        discard_job_state(&self.config, &self.store, &self.id, checkpoint).await;
        snapshot.speed_bps = 0.0;
        snapshot.eta = None;
        info!("job cancelled");
        self.set_state(snapshot, JobState::Cancelled);
    }

    // ==================== Helpers ====================

    fn publish(&self, snapshot: &JobSnapshot) {
        self.snapshot_tx.send_replace(snapshot.clone());
    }

    fn set_state(&self, snapshot: &mut JobSnapshot, state: JobState) {
        snapshot.state = state;
        self.publish(snapshot);
    }

    fn stop_intent(&self) -> Option<StopIntent> {
        self.intent.lock().ok().and_then(|guard| *guard)
    }

    /// Best-effort checkpoint save; failures are logged, never fatal.
    async fn persist(&self, checkpoint: &ResumeCheckpoint) {
        if let Err(error) = self.store.save(checkpoint).await {
            warn!(job_id = %self.id, error = %error, "failed to save checkpoint");
        }
    }
}

/// Derives the in-progress path for a destination.
pub(crate) fn partial_path_for(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map_or_else(|| "download.bin".to_string(), |n| n.to_string_lossy().into_owned());
    name.push_str(".partial");
    destination.with_file_name(name)
}

/// Creates (or truncates) the partial file. Ranged plans with a known size
/// pre-allocate so workers can seek anywhere in the file.
async fn prepare_partial_file(checkpoint: &ResumeCheckpoint) -> Result<(), TransferError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&checkpoint.partial_path)
        .await
        .map_err(|e| TransferError::io(&checkpoint.partial_path, e))?;

    if checkpoint.use_ranges {
        if let Some(total) = checkpoint.total_size.filter(|t| *t > 0) {
            file.set_len(total)
                .await
                .map_err(|e| TransferError::io(&checkpoint.partial_path, e))?;
        }
    }
    Ok(())
}

/// Unranged transfers restart from byte zero on every attempt, so any
/// recorded progress on them is stale the moment the job stops.
fn reset_unranged_progress(checkpoint: &mut ResumeCheckpoint) {
    if checkpoint.use_ranges {
        return;
    }
    for segment in &mut checkpoint.segments {
        if !segment.is_done() {
            segment.bytes_transferred = 0;
            segment.state = SegmentState::Pending;
        }
    }
}

/// Folds worker events observed after the main loop broke into the
/// checkpoint table, so the persisted byte counts include everything the
/// workers flushed before exiting.
fn note_late_event(checkpoint: &mut ResumeCheckpoint, event: &WorkerEvent) {
    match event {
        WorkerEvent::Progress(sample) => {
            if let Some(segment) = checkpoint.segments.get_mut(sample.segment_index) {
                segment.bytes_transferred =
                    segment.bytes_transferred.max(sample.bytes_transferred);
            }
        }
        WorkerEvent::SegmentDone { index } => {
            if let Some(segment) = checkpoint.segments.get_mut(*index) {
                segment.state = SegmentState::Done;
                if let Some(size) = segment.size() {
                    segment.bytes_transferred = size;
                }
            }
        }
        WorkerEvent::SegmentFailed { .. } | WorkerEvent::RangeRejected { .. } => {}
    }
}

/// Removes a cancelled job's partial file and checkpoint.
///
/// The live checkpoint is used when the caller has one; otherwise the
/// persisted copy locates the partial file. Shared between runners and the
/// manager's cancel-while-paused path.
pub(crate) async fn discard_job_state(
    config: &Config,
    store: &CheckpointStore,
    id: &JobId,
    checkpoint: Option<ResumeCheckpoint>,
) {
    let checkpoint = match checkpoint {
        Some(checkpoint) => Some(checkpoint),
        None => store.load(id).await.ok().flatten(),
    };

    if let Some(checkpoint) = checkpoint {
        if config.keep_partial_on_cancel {
            debug!(path = %checkpoint.partial_path.display(), "keeping partial file");
        } else if let Err(error) = tokio::fs::remove_file(&checkpoint.partial_path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %checkpoint.partial_path.display(),
                    error = %error,
                    "failed to remove partial file"
                );
            }
        }
    }
    if let Err(error) = store.remove(id).await {
        warn!(job_id = %id, error = %error, "failed to remove checkpoint");
    }
}

pub(crate) fn seed_snapshot_from_checkpoint(snapshot: &mut JobSnapshot, checkpoint: &ResumeCheckpoint) {
    snapshot.filename = checkpoint
        .destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
    snapshot.total_size = checkpoint.total_size;
    snapshot.bytes_completed = checkpoint.bytes_transferred();
    snapshot.segments_total = checkpoint.segments.len();
    snapshot.segments_done = checkpoint.segments.iter().filter(|s| s.is_done()).count();
}

fn update_progress(snapshot: &mut JobSnapshot, aggregator: &ProgressAggregator) {
    snapshot.bytes_completed = aggregator.bytes_completed();
    snapshot.speed_bps = aggregator.speed_bps();
    snapshot.eta = aggregator.eta();
}

/// Flushes file data and metadata to the device.
async fn sync_file(path: &Path) -> Result<(), TransferError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    file.sync_all()
        .await
        .map_err(|e| TransferError::io(path, e))
}

/// Extracts a usable hex digest from a plugin-declared checksum.
///
/// Accepts `sha256:<hex>` or a bare 64-character hex string. Anything else
/// is skipped with a warning rather than failing the job over a hint that
/// cannot be checked.
fn expected_sha256(declared: Option<&str>) -> Option<String> {
    let declared = declared?.trim();
    if declared.is_empty() {
        return None;
    }
    let hex = declared.strip_prefix("sha256:").unwrap_or(declared);
    if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(hex.to_ascii_lowercase())
    } else {
        warn!(checksum = declared, "unrecognized checksum format, skipping verification");
        None
    }
}

/// Streams a file through SHA-256 and returns the lowercase hex digest.
async fn file_sha256(path: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; HASH_BUFFER_SIZE];

    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}
