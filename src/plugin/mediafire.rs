//! Mediafire plugin - scrapes file landing pages for the download link.
//!
//! Mediafire has no public metadata API, so resolution fetches the share
//! page and pulls the download button's href out of the HTML. The direct
//! link lives on a mediafire CDN host that expects the share page as
//! `Referer`, so the produced target carries that header.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, warn};

use super::{DownloadTarget, ExtractError, Plugin, PluginDescriptor};

#[allow(clippy::expect_used)]
static DOWNLOAD_ANCHOR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*id="downloadButton"[^>]*>"#)
        .expect("mediafire anchor regex is valid")
});

#[allow(clippy::expect_used)]
static HREF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="([^"]+)""#).expect("mediafire href regex is valid"));

#[allow(clippy::expect_used)]
static FILENAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<div\s[^>]*class="filename"[^>]*>([^<]+)</div>"#)
        .expect("mediafire filename regex is valid")
});

/// Resolves mediafire share pages by scraping the download button.
#[derive(Debug)]
pub struct MediafirePlugin {
    descriptor: PluginDescriptor,
    client: Client,
}

impl MediafirePlugin {
    /// Creates a new `MediafirePlugin`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            descriptor: PluginDescriptor::new("mediafire", &["mediafire.com"], 10),
            client,
        }
    }

    fn download_href(page: &str) -> Option<String> {
        let anchor = DOWNLOAD_ANCHOR_PATTERN.find(page)?;
        HREF_PATTERN
            .captures(anchor.as_str())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|href| href.starts_with("http"))
    }

    fn page_filename(page: &str) -> Option<String> {
        FILENAME_PATTERN
            .captures(page)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|name| !name.is_empty())
    }
}

#[async_trait]
impl Plugin for MediafirePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self), fields(plugin = "mediafire"))]
    async fn extract(&self, url: &str) -> Result<Vec<DownloadTarget>, ExtractError> {
        debug!("Fetching mediafire share page");
        let response = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "Mediafire page request failed");
                return Err(ExtractError::resolution(url, "cannot reach mediafire"));
            }
        };

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ExtractError::unsupported(url, "file not found"));
        }
        if !status.is_success() {
            return Err(ExtractError::resolution(
                url,
                format!("mediafire returned HTTP {}", status.as_u16()),
            ));
        }

        let page = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to read mediafire page body");
                return Err(ExtractError::resolution(url, "could not read share page"));
            }
        };

        let Some(href) = Self::download_href(&page) else {
            return Err(ExtractError::unsupported(
                url,
                "no download button on the page; the file may be deleted",
            ));
        };

        let mut target = DownloadTarget::new(href);
        target.suggested_filename = Self::page_filename(&page);
        // The CDN host rejects bare requests for some files.
        target
            .headers
            .insert("Referer".to_string(), url.to_string());
        debug!(
            download_url = %target.url,
            filename = ?target.suggested_filename,
            "Resolved mediafire target"
        );
        Ok(vec![target])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE_PAGE: &str = r#"
        <html><body>
        <div class="dl-info"><div class="filename">report-final.pdf</div></div>
        <a class="input popsok" aria-label="Download file"
           href="https://download2291.mediafire.com/abc/report-final.pdf"
           id="downloadButton">Download (1.2MB)</a>
        </body></html>
    "#;

    #[test]
    fn test_download_href_extracts_button_link() {
        let href = MediafirePlugin::download_href(SAMPLE_PAGE);
        assert_eq!(
            href.as_deref(),
            Some("https://download2291.mediafire.com/abc/report-final.pdf")
        );
    }

    #[test]
    fn test_download_href_handles_id_before_href() {
        let page = r#"<a id="downloadButton" href="https://download.mediafire.com/x/f.zip">go</a>"#;
        let href = MediafirePlugin::download_href(page);
        assert_eq!(href.as_deref(), Some("https://download.mediafire.com/x/f.zip"));
    }

    #[test]
    fn test_download_href_missing_button_returns_none() {
        assert!(MediafirePlugin::download_href("<html><body>gone</body></html>").is_none());
    }

    #[test]
    fn test_download_href_rejects_relative_links() {
        let page = r#"<a id="downloadButton" href="/error">go</a>"#;
        assert!(MediafirePlugin::download_href(page).is_none());
    }

    #[test]
    fn test_page_filename_extracts_and_trims() {
        let name = MediafirePlugin::page_filename(SAMPLE_PAGE);
        assert_eq!(name.as_deref(), Some("report-final.pdf"));
    }

    #[test]
    fn test_descriptor_claims_mediafire_domain() {
        let plugin = MediafirePlugin::new(Client::new());
        assert_eq!(plugin.descriptor().name, "mediafire");
        assert_eq!(plugin.descriptor().domains, vec!["mediafire.com"]);
    }
}
