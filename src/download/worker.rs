//! Segment worker: transfers one byte range into the shared partial file.
//!
//! Each worker owns one [`Segment`] and a write handle into the job's
//! `.partial` file. It requests `start + bytes_transferred ..= end` so a
//! retried or resumed segment continues from its last byte, streams the
//! body chunk by chunk at the segment's file offset, and reports progress
//! and terminal outcomes to the coordinator over a bounded channel.
//!
//! Retries follow the [`RetryPolicy`]: transient failures back off
//! exponentially, HTTP 429 honors the server's `Retry-After`, and
//! permanent failures are reported immediately. A rejected or ignored
//! range is not retried here at all; it is escalated so the coordinator
//! can replan the whole job as a single unranged transfer.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::HttpClient;
use super::error::TransferError;
use super::planner::Segment;
use super::progress::ProgressSample;
use super::retry::{
    FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after,
};
use crate::job::JobId;

/// Events a segment worker reports to its coordinator.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// A chunk was received and written.
    Progress(ProgressSample),
    /// The segment received every byte of its range.
    SegmentDone { index: usize },
    /// The segment gave up: retries exhausted or a permanent failure.
    SegmentFailed {
        index: usize,
        error: TransferError,
    },
    /// The server refused or ignored the byte range. The job must fall
    /// back to a single whole-file transfer.
    RangeRejected { index: usize },
}

/// Why a single transfer attempt stopped without an error.
enum StepOutcome {
    Finished,
    Cancelled,
}

/// One segment transfer task.
pub(crate) struct SegmentWorker {
    pub job_id: JobId,
    pub segment: Segment,
    /// The post-redirect transfer URL, shared by all segments.
    pub url: String,
    /// Extra request headers the source plugin asked for.
    pub headers: HashMap<String, String>,
    /// The job's `.partial` file.
    pub path: PathBuf,
    /// Whether to send `Range` headers. Unranged transfers restart from
    /// zero on every attempt.
    pub ranged: bool,
    pub client: HttpClient,
    pub policy: RetryPolicy,
    pub events: mpsc::Sender<WorkerEvent>,
    pub cancel: CancellationToken,
}

impl SegmentWorker {
    /// Runs the segment to a terminal event or cancellation.
    #[instrument(
        skip(self),
        fields(job_id = %self.job_id, segment = self.segment.index)
    )]
    pub(crate) async fn run(mut self) {
        let mut session_attempts = 0u32;

        loop {
            match self.transfer_once().await {
                Ok(StepOutcome::Finished) => {
                    debug!(bytes = self.segment.bytes_transferred, "segment complete");
                    let index = self.segment.index;
                    self.send_event(WorkerEvent::SegmentDone { index }).await;
                    return;
                }
                Ok(StepOutcome::Cancelled) => {
                    debug!("segment cancelled");
                    return;
                }
                Err(TransferError::RangeRejected { .. }) => {
                    warn!("range request not honored, escalating for replan");
                    let index = self.segment.index;
                    self.send_event(WorkerEvent::RangeRejected { index }).await;
                    return;
                }
                Err(error) => {
                    session_attempts += 1;
                    self.segment.attempts += 1;
                    self.segment.last_error = Some(error.to_string());

                    let failure_type = classify_error(&error);
                    let retry_after_delay = retry_after_from(&error, failure_type);

                    match self.policy.should_retry(failure_type, session_attempts) {
                        RetryDecision::Retry {
                            delay: backoff_delay,
                            attempt: next_attempt,
                        } => {
                            // The server's Retry-After wins over computed backoff
                            let delay = retry_after_delay.unwrap_or(backoff_delay);
                            info!(
                                attempt = next_attempt,
                                max_attempts = self.policy.max_attempts(),
                                delay_ms = delay.as_millis(),
                                using_retry_after = retry_after_delay.is_some(),
                                error = %error,
                                "retrying segment"
                            );
                            tokio::select! {
                                () = self.cancel.cancelled() => return,
                                () = tokio::time::sleep(delay) => {}
                            }
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(%reason, error = %error, "segment giving up");
                            let index = self.segment.index;
                            self.send_event(WorkerEvent::SegmentFailed { index, error })
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One transfer attempt: open, seek, request, stream.
    async fn transfer_once(&mut self) -> Result<StepOutcome, TransferError> {
        if !self.ranged {
            // Without ranges there is no mid-file resume. Restart from zero
            // and drop any stale tail a longer earlier attempt left behind.
            self.segment.bytes_transferred = 0;
        }

        // The coordinator creates the partial file before dispatch; a
        // missing file here means it was deleted out from under the job.
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| TransferError::io(self.path.clone(), e))?;

        if !self.ranged {
            file.set_len(0)
                .await
                .map_err(|e| TransferError::io(self.path.clone(), e))?;
        }

        let offset = self.segment.resume_offset();
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::io(self.path.clone(), e))?;

        let range = self.ranged.then_some((offset, self.segment.end));
        let response = tokio::select! {
            () = self.cancel.cancelled() => return Ok(StepOutcome::Cancelled),
            response = self.client.get_range(&self.url, &self.headers, range) => response?,
        };

        // A 200 answer to a ranged request means the server ignored the
        // range and is streaming the whole file, which would land at the
        // wrong offset. The one exception is `bytes=0-`, where the full
        // body is exactly what was asked for.
        if self.ranged
            && response.status().as_u16() == 200
            && !(offset == 0 && self.segment.end.is_none())
        {
            return Err(TransferError::range_rejected(&self.url));
        }

        let segment_size = self.segment.size();
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return Ok(StepOutcome::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    TransferError::timeout(&self.url)
                } else {
                    TransferError::network(&self.url, e)
                }
            })?;
            if chunk.is_empty() {
                continue;
            }

            let mut data: &[u8] = &chunk;
            let mut range_filled = false;
            if let Some(size) = segment_size {
                let remaining = size - self.segment.bytes_transferred;
                if data.len() as u64 >= remaining {
                    if data.len() as u64 > remaining {
                        warn!(
                            extra = data.len() as u64 - remaining,
                            "server delivered bytes past the requested range, truncating"
                        );
                    }
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        data = &data[..remaining as usize];
                    }
                    range_filled = true;
                }
            }

            if !data.is_empty() {
                file.write_all(data)
                    .await
                    .map_err(|e| TransferError::io(self.path.clone(), e))?;
                // Hand the bytes to the OS before counting them: the
                // checkpointed byte counts must never run ahead of the disk.
                file.flush()
                    .await
                    .map_err(|e| TransferError::io(self.path.clone(), e))?;
                self.segment.bytes_transferred += data.len() as u64;
            }

            let sample = ProgressSample {
                job_id: self.job_id.clone(),
                segment_index: self.segment.index,
                bytes_transferred: self.segment.bytes_transferred,
                at: Instant::now(),
            };
            if !self.send_event(WorkerEvent::Progress(sample)).await {
                return Ok(StepOutcome::Cancelled);
            }

            if range_filled {
                break;
            }
        }

        // The body ended: for a bounded range, short delivery is a
        // transient failure and the next attempt resumes from the counter.
        if let Some(size) = segment_size {
            if self.segment.bytes_transferred < size {
                return Err(TransferError::interrupted(
                    &self.url,
                    size,
                    self.segment.bytes_transferred,
                ));
            }
        }

        Ok(StepOutcome::Finished)
    }

    /// Sends an event to the coordinator, staying responsive to
    /// cancellation while the bounded channel applies backpressure.
    ///
    /// Returns false when the worker should stop: cancelled mid-send, or
    /// the coordinator has gone away.
    async fn send_event(&self, event: WorkerEvent) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}

fn retry_after_from(
    error: &TransferError,
    failure_type: FailureType,
) -> Option<std::time::Duration> {
    if failure_type != FailureType::RateLimited {
        return None;
    }
    match error {
        TransferError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::config::Config;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client() -> HttpClient {
        HttpClient::new(&Config::default()).unwrap()
    }

    /// Policy with sub-millisecond delays so retry tests run fast.
    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries + 1,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
    }

    async fn partial_file(dir: &TempDir, len: u64) -> PathBuf {
        let path = dir.path().join("out.partial");
        let file = tokio::fs::File::create(&path).await.unwrap();
        file.set_len(len).await.unwrap();
        path
    }

    fn worker_for(
        server: &MockServer,
        segment: Segment,
        path: PathBuf,
        ranged: bool,
        policy: RetryPolicy,
        events: mpsc::Sender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> SegmentWorker {
        SegmentWorker {
            job_id: JobId::from("testjob1"),
            segment,
            url: format!("{}/file.bin", server.uri()),
            headers: HashMap::new(),
            path,
            ranged,
            client: test_client(),
            policy,
            events,
            cancel,
        }
    }

    /// Collects events until the channel closes.
    async fn collect_events(mut rx: mpsc::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_worker_writes_range_at_segment_offset() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 20).await;

        // Segment 1 covers bytes 10..=19 of a 20-byte file
        let body = vec![7u8; 10];
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .and(header("Range", "bytes=10-19"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 10-19/20")
                    .set_body_bytes(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            Segment::new(1, 10, Some(19)),
            path.clone(),
            true,
            fast_policy(0),
            tx,
            CancellationToken::new(),
        );
        worker.run().await;

        let events = collect_events(rx).await;
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::SegmentDone { index: 1 })
        ));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, WorkerEvent::Progress(_))),
            "expected at least one progress sample"
        );

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 20);
        assert!(contents[..10].iter().all(|&b| b == 0), "head untouched");
        assert!(contents[10..].iter().all(|&b| b == 7), "tail written");
    }

    #[tokio::test]
    async fn test_worker_resumes_from_transferred_offset() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 100).await;

        // 40 of the segment's 100 bytes are already on disk; the request
        // must ask for the remainder only.
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .and(header("Range", "bytes=40-99"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 40-99/100")
                    .set_body_bytes(vec![3u8; 60]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut segment = Segment::new(0, 0, Some(99));
        segment.bytes_transferred = 40;

        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            segment,
            path,
            true,
            fast_policy(0),
            tx,
            CancellationToken::new(),
        );
        worker.run().await;

        let events = collect_events(rx).await;
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::SegmentDone { index: 0 })
        ));
    }

    #[tokio::test]
    async fn test_worker_escalates_surprise_full_response() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 100).await;

        // Server ignores the Range header and answers 200 with the full body
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 100]))
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            Segment::new(1, 50, Some(99)),
            path,
            true,
            fast_policy(3),
            tx,
            CancellationToken::new(),
        );
        worker.run().await;

        let events = collect_events(rx).await;
        assert_eq!(events.len(), 1, "no retries for an ignored range");
        assert!(matches!(
            events[0],
            WorkerEvent::RangeRejected { index: 1 }
        ));
    }

    #[tokio::test]
    async fn test_worker_escalates_416() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 100).await;

        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .respond_with(ResponseTemplate::new(416))
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            Segment::new(0, 0, Some(99)),
            path,
            true,
            fast_policy(3),
            tx,
            CancellationToken::new(),
        );
        worker.run().await;

        let events = collect_events(rx).await;
        assert!(matches!(events[0], WorkerEvent::RangeRejected { index: 0 }));
    }

    #[tokio::test]
    async fn test_worker_fails_fast_on_permanent_error() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 100).await;

        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            Segment::new(0, 0, Some(99)),
            path,
            true,
            fast_policy(3),
            tx,
            CancellationToken::new(),
        );
        worker.run().await;

        let events = collect_events(rx).await;
        match &events[0] {
            WorkerEvent::SegmentFailed { index: 0, error } => {
                assert!(matches!(
                    error,
                    TransferError::HttpStatus { status: 404, .. }
                ));
            }
            other => panic!("expected SegmentFailed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_retries_transient_then_succeeds() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 10).await;

        // First attempt hits a 503; once that mock is used up the retry
        // falls through to the 206.
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-9/10")
                    .set_body_bytes(vec![5u8; 10]),
            )
            .with_priority(2)
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            Segment::new(0, 0, Some(9)),
            path,
            true,
            fast_policy(2),
            tx,
            CancellationToken::new(),
        );
        worker.run().await;

        let events = collect_events(rx).await;
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::SegmentDone { index: 0 })
        ));
    }

    #[tokio::test]
    async fn test_worker_short_body_reports_interrupted() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 100).await;

        // Range claims 100 bytes but the body carries only 30
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-99/100")
                    .set_body_bytes(vec![1u8; 30]),
            )
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            Segment::new(0, 0, Some(99)),
            path,
            true,
            fast_policy(0),
            tx,
            CancellationToken::new(),
        );
        worker.run().await;

        let events = collect_events(rx).await;
        match events.last() {
            Some(WorkerEvent::SegmentFailed { error, .. }) => {
                assert!(
                    matches!(error, TransferError::Interrupted { received: 30, .. }),
                    "expected Interrupted with 30 bytes, got: {error:?}"
                );
            }
            other => panic!("expected SegmentFailed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_truncates_over_delivery() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 20).await;

        // Segment wants 10 bytes; the server sends 25 on a 206
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-9/20")
                    .set_body_bytes(vec![4u8; 25]),
            )
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            Segment::new(0, 0, Some(9)),
            path.clone(),
            true,
            fast_policy(0),
            tx,
            CancellationToken::new(),
        );
        worker.run().await;

        let events = collect_events(rx).await;
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::SegmentDone { index: 0 })
        ));

        let contents = std::fs::read(&path).unwrap();
        assert!(contents[..10].iter().all(|&b| b == 4), "range written");
        assert!(
            contents[10..].iter().all(|&b| b == 0),
            "bytes past the range must stay untouched"
        );
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancellation() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 100).await;

        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-99/100")
                    .set_body_bytes(vec![2u8; 100])
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            Segment::new(0, 0, Some(99)),
            path,
            true,
            fast_policy(0),
            tx,
            cancel.clone(),
        );

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        // The worker must exit long before the delayed body arrives
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();

        let events = collect_events(rx).await;
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, WorkerEvent::SegmentDone { .. })),
            "cancelled segment must not report completion"
        );
    }

    #[tokio::test]
    async fn test_worker_unranged_restarts_from_zero() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = partial_file(&dir, 0).await;
        std::fs::write(&path, vec![9u8; 50]).unwrap();

        // No Range header on unranged transfers
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![6u8; 10]))
            .expect(1)
            .mount(&server)
            .await;

        let mut segment = Segment::new(0, 0, Some(9));
        // A stale counter from a previous ranged attempt must be discarded
        segment.bytes_transferred = 50;

        let (tx, rx) = mpsc::channel(64);
        let worker = worker_for(
            &server,
            segment,
            path.clone(),
            false,
            fast_policy(0),
            tx,
            CancellationToken::new(),
        );
        worker.run().await;

        let events = collect_events(rx).await;
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::SegmentDone { index: 0 })
        ));

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, vec![6u8; 10], "stale bytes must be truncated away");
    }
}
