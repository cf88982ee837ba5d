//! Pixeldrain plugin - resolves `pixeldrain.com/u/<id>` share links.
//!
//! Pixeldrain exposes a JSON info endpoint per file, so resolution is an API
//! call rather than page scraping: `GET {api}/file/{id}/info` returns the
//! filename and size, and `{api}/file/{id}` serves the bytes with range
//! support.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{DownloadTarget, ExtractError, Plugin, PluginDescriptor};

/// Production API base for pixeldrain.
const DEFAULT_API_BASE: &str = "https://pixeldrain.com/api";

#[allow(clippy::expect_used)]
static FILE_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"pixeldrain\.com/u/([a-zA-Z0-9]+)").expect("pixeldrain id regex is valid")
});

/// Info endpoint response. Only the fields resolution needs are decoded.
#[derive(Debug, Deserialize)]
struct PixeldrainFileInfo {
    success: bool,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
}

/// Resolves pixeldrain share links via the site API.
#[derive(Debug)]
pub struct PixeldrainPlugin {
    descriptor: PluginDescriptor,
    client: Client,
    api_base: String,
}

impl PixeldrainPlugin {
    /// Creates a plugin pointed at the production pixeldrain API.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self::with_api_base(client, DEFAULT_API_BASE)
    }

    /// Creates a plugin with a custom API base (for testing with wiremock).
    #[must_use]
    pub fn with_api_base(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            descriptor: PluginDescriptor::new("pixeldrain", &["pixeldrain.com"], 10),
            client,
            api_base: api_base.into(),
        }
    }

    fn file_id(url: &str) -> Option<String> {
        FILE_ID_PATTERN
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[async_trait]
impl Plugin for PixeldrainPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self), fields(plugin = "pixeldrain"))]
    async fn extract(&self, url: &str) -> Result<Vec<DownloadTarget>, ExtractError> {
        let Some(id) = Self::file_id(url) else {
            return Err(ExtractError::unsupported(
                url,
                "not a pixeldrain share link (expected pixeldrain.com/u/<id>)",
            ));
        };

        let info_url = format!("{}/file/{id}/info", self.api_base);
        debug!(info_url = %info_url, "Calling pixeldrain info API");

        let response = match self.client.get(&info_url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "Pixeldrain info request failed");
                return Err(ExtractError::resolution(
                    url,
                    "cannot reach the pixeldrain API",
                ));
            }
        };

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ExtractError::unsupported(url, "file not found"));
        }
        if !status.is_success() {
            return Err(ExtractError::resolution(
                url,
                format!("pixeldrain API returned HTTP {}", status.as_u16()),
            ));
        }

        let info = match response.json::<PixeldrainFileInfo>().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Failed to parse pixeldrain info JSON");
                return Err(ExtractError::resolution(
                    url,
                    "unexpected pixeldrain API response format",
                ));
            }
        };

        if !info.success {
            return Err(ExtractError::unsupported(url, "file is not available"));
        }

        let mut target = DownloadTarget::new(format!("{}/file/{id}", self.api_base));
        if !info.name.is_empty() {
            target.suggested_filename = Some(info.name);
        }
        if info.size > 0 {
            target.declared_size = Some(info.size);
        }
        debug!(
            filename = ?target.suggested_filename,
            size = ?target.declared_size,
            "Resolved pixeldrain target"
        );
        Ok(vec![target])
    }
}
