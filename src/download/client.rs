//! HTTP client for probing sources and fetching byte ranges.
//!
//! The [`HttpClient`] is created once per manager and shared by every
//! worker, taking advantage of connection pooling. It has two jobs:
//!
//! - [`probe`](HttpClient::probe) - a `bytes=0-0` request that learns the
//!   file's total size, whether the server honors ranges, any
//!   Content-Disposition filename, and the post-redirect URL
//! - [`get_range`](HttpClient::get_range) - the streaming GET a segment
//!   worker consumes

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE, RETRY_AFTER};
use tracing::{debug, instrument};

use super::error::TransferError;
use super::filename::parse_content_disposition;
use crate::config::Config;

/// What a `bytes=0-0` probe learned about a source.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// The URL after following redirects. Workers request this directly so
    /// every segment hits the same origin.
    pub final_url: String,
    /// Total file size in bytes, when the server declared one.
    pub total_size: Option<u64>,
    /// Whether the server honored the byte-range request.
    pub supports_ranges: bool,
    /// Filename from the Content-Disposition header, if present.
    pub content_disposition_filename: Option<String>,
}

/// HTTP client for segmented file transfers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client from the injected configuration.
    ///
    /// The timeout applies to connection establishment and to read
    /// inactivity, not to the whole transfer; a multi-gigabyte download
    /// must be able to outlive any fixed request deadline.
    ///
    /// # Errors
    ///
    /// Returns the underlying builder error if the TLS backend cannot be
    /// initialized.
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            // Transparent decompression would break the byte<->offset mapping
            // that segmented ranges depend on.
            .no_gzip()
            .build()?;
        Ok(Self { client })
    }

    /// Probes a URL with a `bytes=0-0` request.
    ///
    /// The one-byte range is answered three ways:
    /// - `206` with `Content-Range: bytes 0-0/N` - ranges work, size known
    /// - `200` - the server ignored the range; size from Content-Length
    /// - `416` with `Content-Range: bytes */0` - the file is empty
    ///
    /// `headers` are extra request headers the source plugin asked for.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::HttpStatus`] for error responses,
    /// [`TransferError::Timeout`] / [`TransferError::Network`] for
    /// transport failures, and [`TransferError::InvalidUrl`] when the URL
    /// cannot be turned into a request.
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn probe(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ProbeResult, TransferError> {
        debug!("probing source");

        let mut request = self.client.get(url).header(RANGE, "bytes=0-0");
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| map_send_error(url, e))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_disposition_filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);
        let content_range_total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        // The body is never read here; dropping the response closes the
        // connection, which matters for the 200 case where the server has
        // started streaming the whole file.
        let result = match status {
            206 => ProbeResult {
                final_url,
                total_size: content_range_total,
                supports_ranges: true,
                content_disposition_filename,
            },
            200 => ProbeResult {
                final_url,
                total_size: content_length,
                supports_ranges: false,
                content_disposition_filename,
            },
            416 => match content_range_total {
                // bytes */0 - an empty but range-capable file
                Some(0) => ProbeResult {
                    final_url,
                    total_size: Some(0),
                    supports_ranges: true,
                    content_disposition_filename,
                },
                // The server knows the size but refused a range it should
                // have satisfied; treat it as range-incapable.
                Some(total) => ProbeResult {
                    final_url,
                    total_size: Some(total),
                    supports_ranges: false,
                    content_disposition_filename,
                },
                None => return Err(TransferError::http_status(url, 416)),
            },
            _ => {
                let retry_after = retry_after_header(&response);
                return Err(TransferError::http_status_with_retry_after(
                    url,
                    status,
                    retry_after,
                ));
            }
        };

        debug!(
            total_size = ?result.total_size,
            supports_ranges = result.supports_ranges,
            "probe complete"
        );
        Ok(result)
    }

    /// Issues a streaming GET, optionally for a byte range.
    ///
    /// `range` is `(start, Some(end))` for an inclusive range or
    /// `(start, None)` for an open-ended one. The caller owns status
    /// interpretation beyond errors: a `200` answer to a ranged request is
    /// returned as-is so the worker can detect servers that silently drop
    /// range support mid-job.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::RangeRejected`] on 416,
    /// [`TransferError::HttpStatus`] on other error responses, and the
    /// transport errors described on [`probe`](Self::probe).
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn get_range(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<reqwest::Response, TransferError> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            let value = match end {
                Some(end) => format!("bytes={start}-{end}"),
                None => format!("bytes={start}-"),
            };
            request = request.header(RANGE, value);
        }
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| map_send_error(url, e))?;

        let status = response.status().as_u16();
        if status == 416 {
            return Err(TransferError::range_rejected(url));
        }
        if !response.status().is_success() {
            let retry_after = retry_after_header(&response);
            return Err(TransferError::http_status_with_retry_after(
                url,
                status,
                retry_after,
            ));
        }

        Ok(response)
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

fn map_send_error(url: &str, error: reqwest::Error) -> TransferError {
    if error.is_timeout() {
        TransferError::timeout(url)
    } else if error.is_builder() {
        TransferError::invalid_url(url)
    } else {
        TransferError::network(url, error)
    }
}

fn retry_after_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(std::string::ToString::to_string)
}

/// Parses the total from a `Content-Range` value such as
/// `bytes 0-0/10485760` or `bytes */10485760`. A `*` total means the
/// server does not know the size.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}
