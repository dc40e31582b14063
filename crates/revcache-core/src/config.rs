//! Engine and proxy configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Name of the persisted metadata index inside the cache root.
pub const INDEX_FILE_NAME: &str = "cache.json";

/// Cache engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding cached content, mirroring origin URL paths.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Metadata index location. Defaults to `cache.json` next to the cache root,
    /// outside the mirrored URL space.
    #[serde(default)]
    pub index_path: Option<PathBuf>,

    /// Quiet period before a queued index save is flushed.
    #[serde(default = "default_save_quiet_ms")]
    pub save_quiet_ms: u64,

    /// Number of queued saves after which the pending flush stops being postponed.
    #[serde(default = "default_save_trigger_cap")]
    pub save_trigger_cap: u32,

    /// User-Agent sent to the origin when the client supplied none.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Origin request timeout in seconds. Unset means reqwest's default (none).
    #[serde(default)]
    pub origin_timeout_secs: Option<u64>,
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .or_else(dirs::home_dir)
        .map(|base| base.join("revcache").join("content"))
        .unwrap_or_else(|| PathBuf::from("/tmp/revcache/content"))
}

fn default_save_quiet_ms() -> u64 {
    5_000
}

fn default_save_trigger_cap() -> u32 {
    24
}

fn default_user_agent() -> String {
    concat!("revcache/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            index_path: None,
            save_quiet_ms: default_save_quiet_ms(),
            save_trigger_cap: default_save_trigger_cap(),
            user_agent: default_user_agent(),
            origin_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `REVCACHE_CACHE_ROOT` | Content directory |
    /// | `REVCACHE_INDEX_PATH` | Metadata index file |
    /// | `REVCACHE_SAVE_QUIET_MS` | Index save quiet period |
    /// | `REVCACHE_ORIGIN_TIMEOUT` | Origin request timeout in seconds |
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Overlay `REVCACHE_*` variables onto an existing config.
    pub fn apply_env(mut self) -> Self {
        if let Ok(root) = std::env::var("REVCACHE_CACHE_ROOT") {
            self.cache_root = PathBuf::from(root);
        }
        if let Ok(path) = std::env::var("REVCACHE_INDEX_PATH") {
            self.index_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = std::env::var("REVCACHE_SAVE_QUIET_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.save_quiet_ms = ms;
        }
        if let Some(secs) = std::env::var("REVCACHE_ORIGIN_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.origin_timeout_secs = Some(secs);
        }
        self
    }

    /// Resolved metadata index path.
    pub fn index_path(&self) -> PathBuf {
        self.index_path.clone().unwrap_or_else(|| {
            self.cache_root
                .parent()
                .unwrap_or(&self.cache_root)
                .join(INDEX_FILE_NAME)
        })
    }

    /// Set the cache root.
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    /// Set the index path.
    pub fn with_index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.index_path = Some(path.into());
        self
    }

    /// Set the save quiet period.
    pub fn with_save_quiet_ms(mut self, ms: u64) -> Self {
        self.save_quiet_ms = ms;
        self
    }

    /// Set the origin timeout.
    pub fn with_origin_timeout_secs(mut self, secs: u64) -> Self {
        self.origin_timeout_secs = Some(secs);
        self
    }
}

/// Proxy configuration as read from the YAML config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Fixed origin base URL for origin-form requests (e.g. `http://203.104.209.7`).
    #[serde(default)]
    pub origin: Option<String>,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Resource keys never served from cache.
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Manifest resource keys invalidated while the origin is suspect.
    #[serde(default = "default_manifests")]
    pub manifests: Vec<String>,
}

fn default_listen() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_manifests() -> Vec<String> {
    vec![
        "/kcs2/version.json".to_string(),
        "/kcs2/js/main.js".to_string(),
        "/gadget_html5/js/kcs_const.js".to_string(),
    ]
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            origin: None,
            engine: EngineConfig::default(),
            blacklist: Vec::new(),
            manifests: default_manifests(),
        }
    }
}

impl ProxyConfig {
    /// Load from a YAML file, then overlay environment variables.
    pub fn load(path: &Path) -> CacheResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CacheError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_yaml(&text).map(Self::apply_env)
    }

    /// Parse YAML text without touching the environment.
    pub fn from_yaml(text: &str) -> CacheResult<Self> {
        serde_yaml::from_str(text).map_err(|e| CacheError::Config {
            message: format!("invalid config: {}", e),
        })
    }

    /// Defaults plus environment variables.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    fn apply_env(mut self) -> Self {
        if let Ok(listen) = std::env::var("REVCACHE_LISTEN") {
            self.listen = listen;
        }
        if let Ok(origin) = std::env::var("REVCACHE_ORIGIN") {
            self.origin = Some(origin);
        }
        self.engine = self.engine.apply_env();
        self
    }
}
