//! Direct-link plugin - passthrough for plain HTTP/HTTPS URLs.
//!
//! The [`DirectPlugin`] is the registry fallback: any URL no site plugin
//! claims resolves here. It performs no network requests; it passes the URL
//! through as a single target and guesses the filename from the URL path.
//! Range support is assumed and corrected later by the planning probe.

use async_trait::async_trait;
use url::Url;

use crate::download::filename_from_url_path;

use super::{DownloadTarget, ExtractError, Plugin, PluginDescriptor};

/// Fallback plugin that passes HTTP/HTTPS URLs through unchanged.
#[derive(Debug)]
pub struct DirectPlugin {
    descriptor: PluginDescriptor,
}

impl DirectPlugin {
    /// Creates a new `DirectPlugin`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("direct", &[], 0),
        }
    }
}

impl Default for DirectPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for DirectPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self), fields(plugin = "direct"))]
    async fn extract(&self, url: &str) -> Result<Vec<DownloadTarget>, ExtractError> {
        let parsed = Url::parse(url)
            .map_err(|e| ExtractError::unsupported(url, format!("not a valid URL: {e}")))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ExtractError::unsupported(
                url,
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }

        let mut target = DownloadTarget::new(parsed.as_str());
        target.suggested_filename = filename_from_url_path(parsed.as_str());
        Ok(vec![target])
    }
}
