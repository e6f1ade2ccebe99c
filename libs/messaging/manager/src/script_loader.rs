//! Script loading
//!
//! Nodes forward `load_script` requests to the process that hosts their
//! counterpart; that process runs the script against the receiving node
//! through a [`ScriptLoader`]. Fetching and executing sources belong to the
//! embedder ([`ScriptSource`], [`ScriptExecutor`]). [`CachingScriptLoader`]
//! glues the two together and keeps fetched sources by URL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use manager_config::ScriptsConfig;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{MessageManagerError, Result};
use crate::node::MessageManager;

/// Loads a script into the scope of a node
pub trait ScriptLoader: Send + Sync {
    fn load(&self, url: &str, scope: &Arc<MessageManager>) -> Result<()>;

    /// Drop cached sources
    fn clear_cache(&self) {}
}

/// Fetches script source text
pub trait ScriptSource: Send + Sync {
    fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

/// Runs script source against a node
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, url: &str, source: &str, scope: &Arc<MessageManager>) -> anyhow::Result<()>;
}

/// Reads `file:` URLs and bare paths, relative ones against `base_dir`
#[derive(Debug, Clone, Default)]
pub struct FileScriptSource {
    base_dir: Option<PathBuf>,
}

impl FileScriptSource {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self { base_dir }
    }

    fn resolve_path(&self, url: &str) -> PathBuf {
        let raw = url.strip_prefix("file://").unwrap_or(url);
        let path = Path::new(raw);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ScriptSource for FileScriptSource {
    fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let path = self.resolve_path(url);
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read script {}", path.display()))
    }
}

/// `data:` URL payload (text after the first comma)
fn data_url_source(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("data:")?;
    rest.split_once(',').map(|(_, body)| body)
}

/// Script loader with a per-URL source cache
pub struct CachingScriptLoader {
    source: Arc<dyn ScriptSource>,
    executor: Arc<dyn ScriptExecutor>,
    cache: Mutex<HashMap<String, Arc<str>>>,
    cache_enabled: bool,
}

impl CachingScriptLoader {
    pub fn new(source: Arc<dyn ScriptSource>, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            source,
            executor,
            cache: Mutex::new(HashMap::new()),
            cache_enabled: true,
        }
    }

    /// Loader configured from the `[scripts]` section with a file source
    pub fn from_config(config: &ScriptsConfig, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self::new(
            Arc::new(FileScriptSource::new(config.base_dir.clone())),
            executor,
        )
        .with_cache_enabled(config.cache_enabled)
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn cached_urls(&self) -> usize {
        self.cache.lock().len()
    }

    fn source_for(&self, url: &str) -> Result<Arc<str>> {
        if let Some(body) = data_url_source(url) {
            return Ok(Arc::from(body));
        }

        if self.cache_enabled {
            if let Some(cached) = self.cache.lock().get(url) {
                trace!(url, "Script cache hit");
                return Ok(Arc::clone(cached));
            }
        }

        let fetched: Arc<str> = self
            .source
            .fetch(url)
            .map_err(|e| MessageManagerError::script(url, format!("{:#}", e)))?
            .into();

        if self.cache_enabled {
            self.cache.lock().insert(url.to_string(), Arc::clone(&fetched));
        }
        Ok(fetched)
    }
}

impl ScriptLoader for CachingScriptLoader {
    fn load(&self, url: &str, scope: &Arc<MessageManager>) -> Result<()> {
        let source = self.source_for(url)?;
        debug!(url, node = scope.id(), "Running script");
        self.executor
            .execute(url, &source, scope)
            .map_err(|e| MessageManagerError::script(url, format!("{:#}", e)))
    }

    fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url_source() {
        assert_eq!(data_url_source("data:,hello"), Some("hello"));
        assert_eq!(data_url_source("data:text/plain,a,b"), Some("a,b"));
        assert_eq!(data_url_source("data:nocomma"), None);
        assert_eq!(data_url_source("file:///x.js"), None);
    }

    #[test]
    fn test_file_source_resolution() {
        let source = FileScriptSource::new(Some(PathBuf::from("/base")));
        assert_eq!(source.resolve_path("a/b.js"), PathBuf::from("/base/a/b.js"));
        assert_eq!(source.resolve_path("file:///abs.js"), PathBuf::from("/abs.js"));
        assert_eq!(
            FileScriptSource::default().resolve_path("rel.js"),
            PathBuf::from("rel.js")
        );
    }
}
