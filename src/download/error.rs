//! Error types for the transfer layer.
//!
//! Every variant carries enough context (URL or path) to produce a useful
//! message without the caller re-wrapping it.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while transferring or finalizing a download.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS, connection refused, TLS, stream reset).
    #[error("network error for {url}: {source}")]
    Network {
        /// The URL the request was for.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out (connect or read inactivity).
    #[error("timeout for {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// The URL that returned the error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The `Retry-After` header value, if the server sent one.
        retry_after: Option<String>,
    },

    /// The server rejected or ignored a byte-range request.
    ///
    /// Raised for HTTP 416 and for a 200 response to a ranged request.
    /// Not a failure: the job falls back to a single whole-file transfer.
    #[error("range request not honored for {url}")]
    RangeRejected {
        /// The URL whose range request was refused.
        url: String,
    },

    /// The response body ended before the requested range was delivered.
    #[error("transfer interrupted for {url}: expected {expected} bytes, received {received}")]
    Interrupted {
        /// The URL being transferred.
        url: String,
        /// Bytes the segment needed in total.
        expected: u64,
        /// Bytes actually received so far.
        received: u64,
    },

    /// File system error (create, seek, write, rename).
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The URL is malformed or uses a scheme the client cannot request.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
    },

    /// Merged file size does not match the expected total.
    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The partial file that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected: u64,
        /// Actual size in bytes.
        actual: u64,
    },

    /// Merged file digest does not match the source-declared checksum.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The partial file that failed verification.
        path: PathBuf,
        /// Declared digest (lowercase hex).
        expected: String,
        /// Computed digest (lowercase hex).
        actual: String,
    },
}

impl TransferError {
    /// Creates a network error from a transport error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error carrying a `Retry-After` header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a range-rejected error.
    pub fn range_rejected(url: impl Into<String>) -> Self {
        Self::RangeRejected { url: url.into() }
    }

    /// Creates an interrupted-transfer error.
    pub fn interrupted(url: impl Into<String>, expected: u64, received: u64) -> Self {
        Self::Interrupted {
            url: url.into(),
            expected,
            received,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a size mismatch error.
    pub fn size_mismatch(path: impl Into<PathBuf>, expected: u64, actual: u64) -> Self {
        Self::SizeMismatch {
            path: path.into(),
            expected,
            actual,
        }
    }

    /// Creates a checksum mismatch error.
    pub fn checksum_mismatch(
        path: impl Into<PathBuf>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

// No From<reqwest::Error> or From<std::io::Error> impls: the variants need
// context (url, path) the source errors do not carry, so conversions happen
// through the helper constructors at the call site.
