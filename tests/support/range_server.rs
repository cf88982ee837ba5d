//! A configurable byte-range responder for wiremock.
//!
//! The transfer engine talks to servers with very different range
//! behavior: honoring ranges, ignoring them, rejecting them mid-job, or
//! dropping connections early. `RangeResponder` simulates all of these
//! from one payload, and records every `Range` header it sees so tests
//! can assert exactly which slices were requested.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic test payload. A 251-byte period keeps byte values unique
/// within any segment-sized window, so misplaced writes corrupt the file
/// in a detectable way.
pub fn make_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Parses the start offset out of a `bytes=S-E` or `bytes=S-` header value.
pub fn range_start(header: &str) -> Option<u64> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, _) = spec.split_once('-')?;
    start.parse().ok()
}

/// How the responder treats `Range` headers.
enum RangeMode {
    /// Honor every range with a 206 slice.
    Ranged,
    /// Never honor ranges; every request gets a plain 200 with the full
    /// body, including the planning probe.
    Unranged,
    /// Honor the `bytes=0-0` planning probe, then answer later ranged
    /// requests with 200 and the full body as if the header were absent.
    IgnoresRangesAfterProbe,
    /// Honor the `bytes=0-0` planning probe, then answer later ranged
    /// requests with 416.
    RejectsRangesAfterProbe,
}

/// Serves slices of a fixed payload according to a [`RangeMode`], with
/// optional fault injection layered on top.
pub struct RangeResponder {
    payload: Vec<u8>,
    mode: RangeMode,
    /// Remaining requests to answer with 503 before serving normally.
    failures: AtomicUsize,
    /// Remaining 206 responses to truncate, and the length to cut to.
    shorts: AtomicUsize,
    short_len: usize,
    /// Delay applied to every response except the planning probe.
    delay: Option<Duration>,
    /// Delay applied only to the range starting at the given offset.
    slow_start: Option<(u64, Duration)>,
    served: Arc<Mutex<Vec<String>>>,
}

impl RangeResponder {
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_mode(payload, RangeMode::Ranged)
    }

    pub fn unranged(payload: Vec<u8>) -> Self {
        Self::with_mode(payload, RangeMode::Unranged)
    }

    pub fn ignoring_ranges_after_probe(payload: Vec<u8>) -> Self {
        Self::with_mode(payload, RangeMode::IgnoresRangesAfterProbe)
    }

    pub fn rejecting_ranges_after_probe(payload: Vec<u8>) -> Self {
        Self::with_mode(payload, RangeMode::RejectsRangesAfterProbe)
    }

    fn with_mode(payload: Vec<u8>, mode: RangeMode) -> Self {
        Self {
            payload,
            mode,
            failures: AtomicUsize::new(0),
            shorts: AtomicUsize::new(0),
            short_len: 0,
            delay: None,
            slow_start: None,
            served: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answer the first `count` requests with 503 before serving normally.
    pub fn fail_first(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    /// Truncate the bodies of the first `count` sliced responses to
    /// `bytes`, simulating a connection that drops mid-transfer. Responses
    /// already shorter than `bytes` (like the probe) are left alone and do
    /// not consume the budget.
    pub fn short_first(mut self, count: usize, bytes: usize) -> Self {
        self.shorts.store(count, Ordering::SeqCst);
        self.short_len = bytes;
        self
    }

    /// Delay every response except the planning probe.
    pub fn delay_responses(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay only the range starting at `offset`, so one segment lags
    /// behind its siblings. The probe is never delayed.
    pub fn slow_range_start(mut self, offset: u64, delay: Duration) -> Self {
        self.slow_start = Some((offset, delay));
        self
    }

    /// Handle to the recorded `Range` header values, in arrival order.
    /// Clone before mounting; the responder is consumed by the mock.
    pub fn served_ranges(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.served)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn full_body(&self) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_bytes(self.payload.clone())
    }

    fn sliced(&self, header: &str) -> ResponseTemplate {
        let total = self.payload.len() as u64;
        let Some((start, end)) = parse_range(header, total) else {
            return ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{total}"));
        };

        let mut body = self.payload[start as usize..=end as usize].to_vec();
        if body.len() > self.short_len && Self::take(&self.shorts) {
            body.truncate(self.short_len);
        }
        ResponseTemplate::new(206)
            .insert_header("Accept-Ranges", "bytes")
            .insert_header("Content-Range", format!("bytes {start}-{end}/{total}"))
            .set_body_bytes(body)
    }

    fn apply_delay(&self, response: ResponseTemplate, range: Option<&str>) -> ResponseTemplate {
        let is_probe = range == Some("bytes=0-0");
        if let (Some((offset, delay)), Some(value)) = (self.slow_start, range) {
            if !is_probe && range_start(value) == Some(offset) {
                return response.set_delay(delay);
            }
        }
        if let Some(delay) = self.delay {
            if !is_probe {
                return response.set_delay(delay);
            }
        }
        response
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        if let Some(value) = &range {
            if let Ok(mut served) = self.served.lock() {
                served.push(value.clone());
            }
        }

        if Self::take(&self.failures) {
            return ResponseTemplate::new(503);
        }

        let is_probe = range.as_deref() == Some("bytes=0-0");
        let response = match (&self.mode, range.as_deref()) {
            (RangeMode::Unranged, _) | (_, None) => self.full_body(),
            (RangeMode::IgnoresRangesAfterProbe, Some(_)) if !is_probe => self.full_body(),
            (RangeMode::RejectsRangesAfterProbe, Some(_)) if !is_probe => {
                ResponseTemplate::new(416)
            }
            (_, Some(value)) => self.sliced(value),
        };
        self.apply_delay(response, range.as_deref())
    }
}

/// Parses `bytes=S-E` / `bytes=S-` into inclusive offsets, clamped to the
/// payload. Returns `None` for unsatisfiable requests, which map to 416.
fn parse_range(header: &str, total: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = match end {
        "" => total.checked_sub(1)?,
        explicit => explicit.parse().ok()?,
    };
    if total == 0 || start >= total || start > end {
        return None;
    }
    Some((start, end.min(total - 1)))
}
