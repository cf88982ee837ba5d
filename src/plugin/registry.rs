//! Domain-matched plugin registry with direct-link fallback.

use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::{DirectPlugin, Plugin};

/// Holds the registered resolver plugins and matches URLs to them.
///
/// The set is fixed at startup: plugins are registered while the registry is
/// still exclusively owned, then the registry is shared read-only for the
/// lifetime of the process. There is no unregistration.
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
    fallback: Arc<dyn Plugin>,
}

impl PluginRegistry {
    /// Creates an empty registry holding only the direct-link fallback.
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            fallback: Arc::new(DirectPlugin::new()),
        }
    }

    /// Registers a plugin.
    ///
    /// Registration order matters only for priority ties, where the earliest
    /// registration wins.
    pub fn register(&mut self, plugin: impl Plugin + 'static) {
        debug!(
            plugin = %plugin.descriptor().name,
            domains = ?plugin.descriptor().domains,
            priority = plugin.descriptor().priority,
            "Registered plugin"
        );
        self.plugins.push(Arc::new(plugin));
    }

    /// Matches a URL to the plugin that should resolve it.
    ///
    /// A plugin matches when the URL's host equals one of its domains or is
    /// a subdomain of one. Among matches the highest priority wins; with no
    /// match (or an unparseable URL) the direct-link fallback is returned,
    /// so this never fails to produce a resolver.
    #[must_use]
    pub fn resolver_for(&self, url: &str) -> Arc<dyn Plugin> {
        let Some(host) = host_of(url) else {
            return Arc::clone(&self.fallback);
        };

        let mut best: Option<&Arc<dyn Plugin>> = None;
        for plugin in &self.plugins {
            let descriptor = plugin.descriptor();
            if !descriptor.domains.iter().any(|d| host_matches(&host, d)) {
                continue;
            }
            // Strict comparison keeps the earliest registration on ties.
            let beats_current =
                best.is_none_or(|b| descriptor.priority > b.descriptor().priority);
            if beats_current {
                best = Some(plugin);
            }
        }

        match best {
            Some(plugin) => {
                debug!(host = %host, plugin = %plugin.descriptor().name, "Matched plugin");
                Arc::clone(plugin)
            }
            None => {
                debug!(host = %host, "No plugin matched; using direct fallback");
                Arc::clone(&self.fallback)
            }
        }
    }

    /// Returns the registered plugin names, fallback last.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .iter()
            .map(|p| p.descriptor().name.clone())
            .chain(std::iter::once(self.fallback.descriptor().name.clone()))
            .collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugin_names())
            .finish_non_exhaustive()
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.strip_suffix(domain).is_some_and(|rest| rest.ends_with('.'))
}
