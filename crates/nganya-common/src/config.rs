//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::logging::LogFormat;
use crate::{ConfigError, Result};

/// Generation name of the deployed site cache.
pub const DEFAULT_CACHE_NAME: &str = "nganya-groove-v1";

/// Origin the site is served from.
const DEFAULT_ORIGIN: &str = "http://localhost/";

/// Assets precached by the deployed site.
const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/gal/index.html",
    "/gal/home.css",
    "/gal/images/blog/detroit.jpg",
    "/gal/images/blog/baba_yaga.jpg",
    "/gal/images/blog/x-trail.jpg",
    "/gal/images/ab.jpg",
    "/gal/favicon.jpg",
    "/gal/manifest.json",
    "https://fonts.googleapis.com/css2?family=Bebas+Neue&family=Montserrat:wght@400;500;700&family=Playfair+Display:ital,wght@0,400..900;1,400..900&display=swap",
    "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/5.15.4/css/all.min.css",
];

/// Asset cache worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name of the cache generation. Changing it invalidates every
    /// previously cached asset on the next activation.
    pub cache_name: String,

    /// Origin that root-relative manifest entries resolve against
    pub origin: String,

    /// Ordered precache manifest
    pub precache: Vec<String>,

    /// Directory for persistent cache storage; in-memory when unset
    pub storage_dir: Option<PathBuf>,

    /// Network loader settings
    pub loader: LoaderSettings,

    /// Logging settings
    pub logging: LoggingSettings,
}

/// Network loader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// User agent string
    pub user_agent: String,

    /// Per-request timeout in seconds; requests never time out when unset
    pub timeout_secs: Option<u64>,

    /// Maximum redirects followed per request
    pub max_redirects: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Level name (`trace`, `debug`, `info`, `warn`, `error`)
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Custom filter directive, e.g. `nganya_sw=debug`
    pub filter: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
            storage_dir: None,
            loader: LoaderSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("nganya-groove/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: None,
            max_redirects: 10,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

impl WorkerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Parse and validate a configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the worker can run with this configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::invalid("cache_name must not be empty"));
        }
        self.origin_url()?;
        Ok(())
    }

    /// Parsed origin.
    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| ConfigError::invalid(format!("origin {:?}: {}", self.origin, e)))
    }
}
