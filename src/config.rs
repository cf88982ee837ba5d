//! Runtime configuration for the download engine.
//!
//! The engine never reads the environment or disk for its own settings:
//! callers (CLI flags, GUI settings pages, tests) build a [`Config`] and
//! inject it at construction time. [`Config::default`] provides the stock
//! values; [`Config::validate`] rejects settings the engine cannot run with.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default number of jobs allowed to transfer at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Default number of segments (worker tasks) per job.
pub const DEFAULT_THREADS_PER_DOWNLOAD: usize = 8;

/// Default transfer chunk size (1 MiB); also the minimum useful segment size.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default connect and read-inactivity timeout per request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries per segment after a failed first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default `User-Agent` header value.
pub const DEFAULT_USER_AGENT: &str = concat!("parget/", env!("CARGO_PKG_VERSION"));

/// Immutable engine configuration.
///
/// Fields are public so callers can build the struct directly; treat the
/// value as frozen once handed to the manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory completed files are written to.
    pub download_dir: PathBuf,

    /// Directory resume checkpoints are stored in.
    pub state_dir: PathBuf,

    /// Jobs allowed to transfer concurrently; the rest stay `Pending`.
    pub max_concurrent_downloads: usize,

    /// Maximum segments (and worker tasks) per job.
    pub threads_per_download: usize,

    /// Minimum segment size in bytes. Small files get fewer segments so no
    /// segment is ever smaller than this.
    pub chunk_size: u64,

    /// Connect timeout and read-inactivity timeout applied to every request.
    pub timeout: Duration,

    /// Transient-failure retries per segment after the initial attempt.
    pub max_retries: u32,

    /// `User-Agent` header sent on every outgoing request.
    pub user_agent: String,

    /// Keep `.partial` files on disk when a job is cancelled.
    pub keep_partial_on_cancel: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            state_dir: PathBuf::from(".parget"),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            threads_per_download: DEFAULT_THREADS_PER_DOWNLOAD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            keep_partial_on_cancel: false,
        }
    }
}

impl Config {
    /// Checks that the numeric settings are usable.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first rejected field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.threads_per_download == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Rejections reported by [`Config::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_concurrent_downloads` was zero.
    #[error("max_concurrent_downloads must be at least 1")]
    ZeroConcurrency,

    /// `threads_per_download` was zero.
    #[error("threads_per_download must be at least 1")]
    ZeroThreads,

    /// `chunk_size` was zero.
    #[error("chunk_size must be at least 1 byte")]
    ZeroChunkSize,

    /// `timeout` was zero.
    #[error("timeout must be non-zero")]
    ZeroTimeout,
}
