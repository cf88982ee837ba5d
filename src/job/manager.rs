//! The job control surface: submit, pause, resume, cancel, observe.
//!
//! [`DownloadManager`] owns the shared machinery every job uses: validated
//! configuration, the plugin registry, the transfer client, the checkpoint
//! store, and the admission semaphore that caps concurrent downloads. Each
//! submitted job gets its own runner task and a watch channel of
//! [`JobSnapshot`]s; the manager keeps the sending half so control calls
//! can read current state without touching the runner.
//!
//! # Example
//!
//! ```no_run
//! use parget_core::config::Config;
//! use parget_core::job::{DownloadManager, SubmitRequest};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DownloadManager::new(Config::default())?;
//! let id = manager.submit(SubmitRequest::new("https://example.com/file.iso"));
//!
//! let mut subscription = manager.subscribe(&id)?;
//! while let Some(snapshot) = subscription.next().await {
//!     println!("{}: {} bytes", snapshot.state, snapshot.bytes_completed);
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::download::HttpClient;
use crate::job::checkpoint::CheckpointStore;
use crate::job::coordinator::{
    JobRunner, StartMode, StopIntent, discard_job_state, seed_snapshot_from_checkpoint,
};
use crate::job::{ControlError, JobId, JobSnapshot, JobState};
use crate::plugin::{DownloadTarget, PluginRegistry, build_plugin_client, default_registry};

/// A request to download one source URL.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Source URL to resolve and download.
    pub url: String,
    /// Destination directory override. Defaults to the configured
    /// download directory.
    pub destination_dir: Option<PathBuf>,
    /// Segment count override. Defaults to the configured threads per
    /// download.
    pub threads: Option<usize>,
}

impl SubmitRequest {
    /// Creates a request with no overrides.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination_dir: None,
            threads: None,
        }
    }

    /// Overrides the destination directory for this job.
    #[must_use]
    pub fn with_destination_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination_dir = Some(dir.into());
        self
    }

    /// Overrides the segment count for this job.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }
}

/// Per-job bookkeeping held by the manager.
#[derive(Clone)]
struct JobEntry {
    source_url: String,
    destination_dir: Option<PathBuf>,
    threads: Option<usize>,
    snapshot_tx: Arc<watch::Sender<JobSnapshot>>,
    stop: CancellationToken,
    intent: Arc<StdMutex<Option<StopIntent>>>,
}

impl JobEntry {
    fn new(
        id: &JobId,
        source_url: String,
        destination_dir: Option<PathBuf>,
        threads: Option<usize>,
    ) -> Self {
        let (snapshot_tx, _rx) = watch::channel(JobSnapshot::new(id.clone(), source_url.clone()));
        Self {
            source_url,
            destination_dir,
            threads,
            snapshot_tx: Arc::new(snapshot_tx),
            stop: CancellationToken::new(),
            intent: Arc::new(StdMutex::new(None)),
        }
    }

    fn state(&self) -> JobState {
        self.snapshot_tx.borrow().state
    }

    fn set_intent(&self, intent: StopIntent) {
        if let Ok(mut guard) = self.intent.lock() {
            *guard = Some(intent);
        }
    }
}

/// Shared state behind the manager handle.
pub(crate) struct ManagerInner {
    config: Arc<Config>,
    registry: Arc<PluginRegistry>,
    client: HttpClient,
    store: CheckpointStore,
    admission: Arc<Semaphore>,
    jobs: DashMap<JobId, JobEntry>,
}

impl ManagerInner {
    /// Spawns the runner task for a registered job.
    fn launch(self: &Arc<Self>, id: JobId, entry: &JobEntry, start: StartMode) {
        let runner = JobRunner {
            id,
            source_url: entry.source_url.clone(),
            destination_dir: entry.destination_dir.clone(),
            threads: entry.threads,
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            client: self.client.clone(),
            store: self.store.clone(),
            snapshot_tx: Arc::clone(&entry.snapshot_tx),
            stop: entry.stop.clone(),
            intent: Arc::clone(&entry.intent),
            admission: Arc::clone(&self.admission),
            manager: Arc::downgrade(self),
            start,
        };
        tokio::spawn(runner.run());
    }

    /// Registers and launches a job for an extra target produced by a
    /// multi-target extraction. Called by runners mid-resolution.
    pub(crate) fn spawn_sibling(
        self: &Arc<Self>,
        source_url: &str,
        target: DownloadTarget,
        destination_dir: Option<PathBuf>,
        threads: Option<usize>,
    ) -> JobId {
        let id = JobId::generate();
        debug!(job_id = %id, url = %target.url, "registering sibling job");
        let entry = JobEntry::new(&id, source_url.to_string(), destination_dir, threads);
        self.jobs.insert(id.clone(), entry.clone());
        self.launch(id.clone(), &entry, StartMode::Resolved(target));
        id
    }
}

/// Handle for submitting and controlling download jobs.
///
/// Cloning is cheap; all clones share the same job table and concurrency
/// budget. Job-spawning methods must be called from within a Tokio
/// runtime.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    /// Creates a manager with the default plugin registry.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Config`] if the configuration fails
    /// validation, or [`ControlError::Client`] if an HTTP client cannot
    /// be constructed.
    pub fn new(config: Config) -> Result<Self, ControlError> {
        config.validate().map_err(ControlError::config)?;
        let plugin_client =
            build_plugin_client(&config).map_err(|error| ControlError::client(error.to_string()))?;
        let registry = default_registry(plugin_client);
        Self::with_registry(config, registry)
    }

    /// Creates a manager with a caller-assembled plugin registry.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Config`] if the configuration fails
    /// validation, or [`ControlError::Client`] if the transfer client
    /// cannot be constructed.
    pub fn with_registry(config: Config, registry: PluginRegistry) -> Result<Self, ControlError> {
        config.validate().map_err(ControlError::config)?;
        let client =
            HttpClient::new(&config).map_err(|error| ControlError::client(error.to_string()))?;
        let store = CheckpointStore::new(config.state_dir.clone());
        let admission = Arc::new(Semaphore::new(config.max_concurrent_downloads));

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config: Arc::new(config),
                registry: Arc::new(registry),
                client,
                store,
                admission,
                jobs: DashMap::new(),
            }),
        })
    }

    /// Returns the manager's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Submits a download job and returns its identifier.
    ///
    /// The job starts immediately (subject to the concurrency cap) on a
    /// background task; this call does not wait for resolution.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub fn submit(&self, request: SubmitRequest) -> JobId {
        let id = JobId::generate();
        info!(job_id = %id, "job submitted");
        let entry = JobEntry::new(
            &id,
            request.url,
            request.destination_dir,
            request.threads,
        );
        self.inner.jobs.insert(id.clone(), entry.clone());
        self.inner.launch(id.clone(), &entry, StartMode::Fresh);
        id
    }

    /// Pauses a transferring job, persisting its checkpoint for resume.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::UnknownJob`] for unregistered ids and
    /// [`ControlError::InvalidState`] unless the job is `Transferring`.
    pub fn pause(&self, id: &JobId) -> Result<(), ControlError> {
        let entry = self
            .inner
            .jobs
            .get(id)
            .ok_or_else(|| ControlError::unknown_job(id.clone()))?;
        let state = entry.state();
        if state != JobState::Transferring {
            return Err(ControlError::invalid_state(id.clone(), "pause", state));
        }

        // Intent first, then the token: the runner reads the intent only
        // after it observes the cancellation.
        entry.set_intent(StopIntent::Pause);
        entry.stop.cancel();
        info!(job_id = %id, "pause requested");
        Ok(())
    }

    /// Cancels a job, discarding its checkpoint and partial file.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::UnknownJob`] for unregistered ids and
    /// [`ControlError::InvalidState`] if the job already reached a
    /// terminal state.
    pub fn cancel(&self, id: &JobId) -> Result<(), ControlError> {
        let entry = self
            .inner
            .jobs
            .get(id)
            .ok_or_else(|| ControlError::unknown_job(id.clone()))?;
        let state = entry.state();
        if state.is_terminal() {
            return Err(ControlError::invalid_state(id.clone(), "cancel", state));
        }

        if state == JobState::Paused {
            // Paused jobs have no runner listening on the token. Flip the
            // state here and clean up disk state in the background.
            let mut snapshot = entry.snapshot_tx.borrow().clone();
            snapshot.state = JobState::Cancelled;
            snapshot.speed_bps = 0.0;
            snapshot.eta = None;
            entry.snapshot_tx.send_replace(snapshot);

            let inner = Arc::clone(&self.inner);
            let id = id.clone();
            tokio::spawn(async move {
                discard_job_state(&inner.config, &inner.store, &id, None).await;
                info!(job_id = %id, "job cancelled");
            });
            return Ok(());
        }

        entry.set_intent(StopIntent::Cancel);
        entry.stop.cancel();
        info!(job_id = %id, "cancel requested");
        Ok(())
    }

    /// Resumes a paused or failed job from its checkpoint. Without a
    /// usable checkpoint the job restarts from scratch under the same id.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::UnknownJob`] for unregistered ids,
    /// [`ControlError::InvalidState`] unless the job is `Paused` or
    /// `Failed`, and [`ControlError::Storage`] if the checkpoint store
    /// cannot be read.
    pub async fn resume(&self, id: &JobId) -> Result<(), ControlError> {
        {
            let entry = self
                .inner
                .jobs
                .get(id)
                .ok_or_else(|| ControlError::unknown_job(id.clone()))?;
            let state = entry.state();
            if !matches!(state, JobState::Paused | JobState::Failed) {
                return Err(ControlError::invalid_state(id.clone(), "resume", state));
            }
        }

        let start = match self
            .inner
            .store
            .load(id)
            .await
            .map_err(|error| ControlError::storage(error.to_string()))?
        {
            Some(checkpoint) => StartMode::Resume(checkpoint),
            None => StartMode::Fresh,
        };

        let entry = {
            let Some(mut entry) = self.inner.jobs.get_mut(id) else {
                return Err(ControlError::unknown_job(id.clone()));
            };
            // Re-check under the exclusive ref; a concurrent resume or
            // cancel may have won the race.
            let state = entry.state();
            if !matches!(state, JobState::Paused | JobState::Failed) {
                return Err(ControlError::invalid_state(id.clone(), "resume", state));
            }

            let mut snapshot = entry.snapshot_tx.borrow().clone();
            snapshot.state = JobState::Pending;
            snapshot.error = None;
            entry.snapshot_tx.send_replace(snapshot);

            // The old token was cancelled by the pause; the new runner
            // needs fresh stop plumbing.
            entry.stop = CancellationToken::new();
            entry.intent = Arc::new(StdMutex::new(None));
            entry.clone()
        };

        info!(job_id = %id, "resume requested");
        self.inner.launch(id.clone(), &entry, start);
        Ok(())
    }

    /// Returns the current snapshot of a job.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::UnknownJob`] for unregistered ids.
    pub fn status(&self, id: &JobId) -> Result<JobSnapshot, ControlError> {
        let entry = self
            .inner
            .jobs
            .get(id)
            .ok_or_else(|| ControlError::unknown_job(id.clone()))?;
        Ok(entry.snapshot_tx.borrow().clone())
    }

    /// Returns snapshots of every known job, sorted by id.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.value().snapshot_tx.borrow().clone())
            .collect();
        snapshots.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        snapshots
    }

    /// Subscribes to a job's snapshot stream.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::UnknownJob`] for unregistered ids.
    pub fn subscribe(&self, id: &JobId) -> Result<ProgressSubscription, ControlError> {
        let entry = self
            .inner
            .jobs
            .get(id)
            .ok_or_else(|| ControlError::unknown_job(id.clone()))?;
        Ok(ProgressSubscription {
            rx: entry.snapshot_tx.subscribe(),
            yielded_first: false,
            finished: false,
        })
    }

    /// Registers every persisted checkpoint as a paused job, without
    /// starting any transfers. Call once at startup; already-registered
    /// ids are skipped.
    ///
    /// Returns the ids that were restored.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Storage`] if the state directory cannot
    /// be read.
    pub async fn restore(&self) -> Result<Vec<JobId>, ControlError> {
        let checkpoints = self
            .inner
            .store
            .list()
            .await
            .map_err(|error| ControlError::storage(error.to_string()))?;

        let mut restored = Vec::new();
        for checkpoint in checkpoints {
            let id = checkpoint.job_id.clone();
            if self.inner.jobs.contains_key(&id) {
                debug!(job_id = %id, "job already registered, skipping restore");
                continue;
            }

            let entry = JobEntry::new(&id, checkpoint.source_url.clone(), None, None);
            let mut snapshot = JobSnapshot::new(id.clone(), checkpoint.source_url.clone());
            snapshot.state = JobState::Paused;
            seed_snapshot_from_checkpoint(&mut snapshot, &checkpoint);
            entry.snapshot_tx.send_replace(snapshot);

            self.inner.jobs.insert(id.clone(), entry);
            restored.push(id);
        }

        if !restored.is_empty() {
            info!(count = restored.len(), "restored persisted jobs");
        }
        Ok(restored)
    }
}

/// A stream of job snapshots from [`DownloadManager::subscribe`].
pub struct ProgressSubscription {
    rx: watch::Receiver<JobSnapshot>,
    yielded_first: bool,
    finished: bool,
}

impl ProgressSubscription {
    /// Waits for the next snapshot.
    ///
    /// The first call yields the job's current state immediately; later
    /// calls wait for a change. Once a terminal snapshot has been
    /// yielded, all further calls return `None`.
    pub async fn next(&mut self) -> Option<JobSnapshot> {
        if self.finished {
            return None;
        }
        if !self.yielded_first {
            self.yielded_first = true;
            return Some(self.current());
        }
        if self.rx.changed().await.is_err() {
            self.finished = true;
            return None;
        }
        Some(self.current())
    }

    fn current(&mut self) -> JobSnapshot {
        let snapshot = self.rx.borrow_and_update().clone();
        if snapshot.state.is_terminal() {
            self.finished = true;
        }
        snapshot
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::download::Segment;
    use crate::job::checkpoint::ResumeCheckpoint;

    fn test_config(tmp: &TempDir) -> Config {
        Config {
            download_dir: tmp.path().join("downloads"),
            state_dir: tmp.path().join("state"),
            ..Config::default()
        }
    }

    async fn wait_terminal(manager: &DownloadManager, id: &JobId) -> JobSnapshot {
        let mut subscription = manager.subscribe(id).unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            let mut last = None;
            while let Some(snapshot) = subscription.next().await {
                last = Some(snapshot);
            }
            last.unwrap()
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            max_concurrent_downloads: 0,
            ..test_config(&tmp)
        };
        let result = DownloadManager::new(config);
        assert!(matches!(result, Err(ControlError::Config { .. })));
    }

    #[tokio::test]
    async fn test_submit_unsupported_scheme_fails_without_network() {
        let tmp = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&tmp)).unwrap();

        let id = manager.submit(SubmitRequest::new("ftp://example.com/file.bin"));
        let last = wait_terminal(&manager, &id).await;

        assert_eq!(last.state, JobState::Failed);
        assert!(last.error.is_some());
    }

    #[tokio::test]
    async fn test_status_unknown_job() {
        let tmp = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&tmp)).unwrap();

        let result = manager.status(&JobId::from("missing1"));
        assert!(matches!(result, Err(ControlError::UnknownJob { .. })));
    }

    #[tokio::test]
    async fn test_pause_requires_transferring() {
        let tmp = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&tmp)).unwrap();

        let id = manager.submit(SubmitRequest::new("ftp://example.com/file.bin"));
        let last = wait_terminal(&manager, &id).await;
        assert_eq!(last.state, JobState::Failed);

        let result = manager.pause(&id);
        assert!(matches!(
            result,
            Err(ControlError::InvalidState {
                action: "pause",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_rejects_terminal_job() {
        let tmp = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&tmp)).unwrap();

        let id = manager.submit(SubmitRequest::new("ftp://example.com/file.bin"));
        wait_terminal(&manager, &id).await;

        let result = manager.cancel(&id);
        assert!(matches!(
            result,
            Err(ControlError::InvalidState {
                action: "cancel",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_resume_requires_paused_or_failed() {
        let tmp = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&tmp)).unwrap();

        let result = manager.resume(&JobId::from("missing1")).await;
        assert!(matches!(result, Err(ControlError::UnknownJob { .. })));
    }

    #[tokio::test]
    async fn test_resume_allowed_after_failure() {
        let tmp = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&tmp)).unwrap();

        let id = manager.submit(SubmitRequest::new("ftp://example.com/file.bin"));
        wait_terminal(&manager, &id).await;

        // No checkpoint was ever written, so this restarts from scratch
        // and fails the same way.
        manager.resume(&id).await.unwrap();
        let last = wait_terminal(&manager, &id).await;
        assert_eq!(last.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_yields_final_state_once() {
        let tmp = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&tmp)).unwrap();

        let id = manager.submit(SubmitRequest::new("ftp://example.com/file.bin"));
        wait_terminal(&manager, &id).await;

        let mut subscription = manager.subscribe(&id).unwrap();
        let first = subscription.next().await.unwrap();
        assert_eq!(first.state, JobState::Failed);
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_restore_registers_paused_jobs() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let store = CheckpointStore::new(config.state_dir.clone());

        let mut segment = Segment::new(0, 0, Some(999));
        segment.bytes_transferred = 250;
        let checkpoint = ResumeCheckpoint {
            job_id: JobId::from("restored1"),
            source_url: "https://example.com/file.bin".to_string(),
            target: DownloadTarget::new("https://example.com/file.bin"),
            destination: tmp.path().join("downloads/file.bin"),
            partial_path: tmp.path().join("downloads/file.bin.partial"),
            total_size: Some(1000),
            use_ranges: true,
            resolved_at: std::time::SystemTime::now(),
            segments: vec![segment],
        };
        store.save(&checkpoint).await.unwrap();

        let manager = DownloadManager::new(config).unwrap();
        let restored = manager.restore().await.unwrap();
        assert_eq!(restored, vec![JobId::from("restored1")]);

        let snapshot = manager.status(&JobId::from("restored1")).unwrap();
        assert_eq!(snapshot.state, JobState::Paused);
        assert_eq!(snapshot.bytes_completed, 250);
        assert_eq!(snapshot.total_size, Some(1000));
        assert_eq!(snapshot.filename.as_deref(), Some("file.bin"));

        // Second restore is a no-op.
        let restored = manager.restore().await.unwrap();
        assert!(restored.is_empty());
    }

    #[tokio::test]
    async fn test_jobs_lists_all_snapshots_sorted() {
        let tmp = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&tmp)).unwrap();

        let a = manager.submit(SubmitRequest::new("ftp://example.com/a.bin"));
        let b = manager.submit(SubmitRequest::new("ftp://example.com/b.bin"));
        wait_terminal(&manager, &a).await;
        wait_terminal(&manager, &b).await;

        let snapshots = manager.jobs();
        assert_eq!(snapshots.len(), 2);
        let ids: Vec<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_submit_request_builders() {
        let request = SubmitRequest::new("https://example.com/f")
            .with_destination_dir("/tmp/downloads")
            .with_threads(4);
        assert_eq!(request.url, "https://example.com/f");
        assert_eq!(
            request.destination_dir.as_deref(),
            Some(std::path::Path::new("/tmp/downloads"))
        );
        assert_eq!(request.threads, Some(4));
    }
}
