//! Error types for source resolution.

use thiserror::Error;

/// Errors a plugin can produce while resolving a source URL.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The source page or API could not be reached or understood.
    ///
    /// Covers network failures, unexpected response shapes, and upstream
    /// server errors during resolution.
    #[error("resolution failed for {url}: {reason}")]
    Resolution {
        /// The source URL being resolved.
        url: String,
        /// Human-readable description of what went wrong.
        reason: String,
    },

    /// The URL matched a plugin but holds no extractable download target.
    ///
    /// Covers deleted files, unrecognized page layouts, and URL shapes the
    /// plugin does not understand.
    #[error("no downloadable target at {url}: {reason}")]
    Unsupported {
        /// The source URL that was inspected.
        url: String,
        /// Why no target could be produced.
        reason: String,
    },
}

impl ExtractError {
    /// Creates a resolution failure.
    pub fn resolution(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unsupported-source failure.
    pub fn unsupported(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

// No From<reqwest::Error> impl: resolution errors need the source URL for
// context, which the transport error does not carry. Plugins log the
// underlying error and construct a reason string at the call site.
