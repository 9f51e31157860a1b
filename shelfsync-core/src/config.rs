use crate::image::ImageSettings;
use serde::{Deserialize, Serialize};
use shelfsync_scanner::crawler::CrawlConfig;
use shelfsync_scanner::extract::StrategyBook;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CONFIG_DIR: &str = "~/.config/shelfsync";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DATABASE_FILE_NAME: &str = "catalog.db";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_secs: u64,
    pub max_page_bytes: u64,
    /// Rotated per request; empty means the built-in browser set.
    pub user_agents: Vec<String>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_page_bytes: 5 * 1024 * 1024,
            user_agents: Vec::new(),
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub ttl_hours: u64,
    pub database: String,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            database: format!("{}/{}", DEFAULT_CONFIG_DIR, DATABASE_FILE_NAME),
        }
    }
}

impl CatalogSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.saturating_mul(60 * 60))
    }

    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database)
    }
}

/// Everything shelfsync reads from its settings file. Every field has a
/// default, so a partial file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub crawl: CrawlConfig,
    pub fetch: FetchSettings,
    pub image: ImageSettings,
    pub catalog: CatalogSettings,
    pub strategies: StrategyBook,
}

impl Settings {
    /// Read settings from `path`, or the default location when `None`.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

pub fn default_config_dir() -> PathBuf {
    expand_path(DEFAULT_CONFIG_DIR)
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE_NAME)
}
