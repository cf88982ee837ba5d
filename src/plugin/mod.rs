//! Source-resolution plugins for turning page URLs into download targets.
//!
//! A plugin recognizes URLs for one hosting site and resolves them into
//! concrete, fetchable [`DownloadTarget`]s. The [`PluginRegistry`] matches an
//! input URL's host against each plugin's declared domains and falls back to
//! the [`DirectPlugin`] passthrough when nothing matches, so resolution always
//! produces *some* resolver.
//!
//! # Architecture
//!
//! - [`Plugin`] - Async trait individual resolvers implement
//! - [`PluginDescriptor`] - Name, domain set, and priority of a plugin
//! - [`PluginRegistry`] - Domain-matched plugin collection with fallback
//! - [`PixeldrainPlugin`] - Resolves `pixeldrain.com/u/<id>` via the site API
//! - [`MediafirePlugin`] - Scrapes mediafire landing pages for the file link
//! - [`DirectPlugin`] - Fallback passthrough for plain HTTP/HTTPS URLs
//!
//! # Example
//!
//! ```no_run
//! use parget_core::config::Config;
//! use parget_core::plugin::{build_plugin_client, default_registry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let client = build_plugin_client(&config)?;
//! let registry = default_registry(client);
//!
//! let plugin = registry.resolver_for("https://pixeldrain.com/u/abc123");
//! let targets = plugin.extract("https://pixeldrain.com/u/abc123").await?;
//! println!("download url: {}", targets[0].url);
//! # Ok(())
//! # }
//! ```

mod direct;
mod error;
mod mediafire;
mod pixeldrain;
mod registry;

pub use direct::DirectPlugin;
pub use error::ExtractError;
pub use mediafire::MediafirePlugin;
pub use pixeldrain::PixeldrainPlugin;
pub use registry::PluginRegistry;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// A concrete, fetchable download produced by a resolver.
///
/// Immutable once produced. A single source URL may resolve to several
/// targets; each becomes an independent job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTarget {
    /// The URL the bytes are fetched from.
    pub url: String,

    /// Filename suggested by the resolving site, if it knows one.
    pub suggested_filename: Option<String>,

    /// Total size in bytes as declared by the site, if known.
    pub declared_size: Option<u64>,

    /// Whether the target is expected to serve byte ranges.
    ///
    /// Optimistic: the planning probe corrects this against the server's
    /// actual response before any segmentation happens.
    pub supports_ranges: bool,

    /// Extra request headers the transfer must send (e.g. `Referer`).
    pub headers: HashMap<String, String>,

    /// Source-declared digest in `sha256:<hex>` form, when published.
    pub checksum: Option<String>,
}

impl DownloadTarget {
    /// Creates a target for `url` with optimistic defaults.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            suggested_filename: None,
            declared_size: None,
            supports_ranges: true,
            headers: HashMap::new(),
            checksum: None,
        }
    }
}

/// Identity and matching metadata a plugin registers under.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Short plugin name used in logs (e.g. "pixeldrain").
    pub name: String,

    /// Domains this plugin handles. A URL matches when its host equals a
    /// domain or is a subdomain of one.
    pub domains: Vec<String>,

    /// Match priority; when several plugins match a host, the highest
    /// priority wins and ties go to the earliest registration.
    pub priority: u32,
}

impl PluginDescriptor {
    /// Creates a descriptor from a name, domain list, and priority.
    #[must_use]
    pub fn new(name: impl Into<String>, domains: &[&str], priority: u32) -> Self {
        Self {
            name: name.into(),
            domains: domains.iter().map(|d| (*d).to_lowercase()).collect(),
            priority,
        }
    }
}

/// Trait all source-resolution plugins implement.
///
/// # Object Safety
///
/// Uses `async_trait` so the registry can hold `Arc<dyn Plugin>` trait
/// objects; native async traits are not object-safe.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Returns the plugin's registration metadata.
    fn descriptor(&self) -> &PluginDescriptor;

    /// Resolves a source URL into one or more download targets.
    ///
    /// Must be idempotent: repeated calls for the same URL produce
    /// equivalent targets, modulo time-limited signed links.
    ///
    /// # Errors
    ///
    /// [`ExtractError::Resolution`] when the source cannot be reached or
    /// parsed; [`ExtractError::Unsupported`] when it holds no recognizable
    /// download target.
    async fn extract(&self, url: &str) -> Result<Vec<DownloadTarget>, ExtractError>;
}

/// Builds the HTTP client plugins use for page and API fetches.
///
/// Separate from the transfer client: resolution wants compression and JSON
/// decoding, transfers want byte-exact ranged bodies.
///
/// # Errors
///
/// Returns the underlying builder error when TLS or resolver initialization
/// fails.
pub fn build_plugin_client(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(config.timeout)
        .timeout(config.timeout.saturating_mul(2))
        .user_agent(config.user_agent.clone())
        .gzip(true)
        .build()
}

/// Builds the registry with the bundled site plugins registered.
#[must_use]
pub fn default_registry(client: reqwest::Client) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register(PixeldrainPlugin::new(client.clone()));
    registry.register(MediafirePlugin::new(client));
    registry
}
