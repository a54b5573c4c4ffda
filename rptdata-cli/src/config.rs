use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rptdata_core::search::StreamSettings;
use rptdata_core::{CacheSizes, SearchSettings};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Values that parse but cannot be used
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("'{key}' must be greater than zero")]
    MustBePositive { key: &'static str },

    #[error("unknown config key '{key}'")]
    UnknownKey { key: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache_control: CacheControlConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl CliConfig {
    /// Reject values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first offending key.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let positive = [
            ("timeouts.request_timeout_ms", self.timeouts.request_timeout_ms),
            ("timeouts.keep_alive_interval_ms", self.timeouts.keep_alive_interval_ms),
            (
                "timeouts.check_request_alive_delay_ms",
                self.timeouts.check_request_alive_delay_ms,
            ),
            ("search.sse_event_search_step_ms", self.search.sse_event_search_step_ms),
            ("search.message_page_size", self.search.message_page_size as u64),
            ("search.max_queue_size", self.search.max_queue_size as u64),
        ];
        match positive.into_iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::MustBePositive { key }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            request_timeout: Duration::from_millis(self.timeouts.request_timeout_ms),
            sse_event_search_step: Duration::from_millis(self.search.sse_event_search_step_ms),
            message_page_size: self.search.message_page_size,
            event_lookback: Duration::from_millis(self.search.event_lookback_ms),
        }
    }

    #[must_use]
    pub const fn cache_sizes(&self) -> CacheSizes {
        CacheSizes {
            events: self.cache.event_cache_size,
            messages: self.cache.message_cache_size,
        }
    }

    #[must_use]
    pub fn stream_settings(&self) -> StreamSettings {
        let max_duration = match self.timeouts.sse_search_max_duration_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        StreamSettings {
            liveness_interval: Duration::from_millis(self.timeouts.check_request_alive_delay_ms),
            keep_alive_interval: Duration::from_millis(self.timeouts.keep_alive_interval_ms),
            max_duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub request_timeout_ms: u64,
    pub codec_response_timeout_ms: u64,
    pub check_request_alive_delay_ms: u64,
    pub keep_alive_interval_ms: u64,
    /// 0 means unlimited
    pub sse_search_max_duration_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            codec_response_timeout_ms: 6_000,
            check_request_alive_delay_ms: 2_000,
            keep_alive_interval_ms: 5_000,
            sse_search_max_duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub event_cache_size: usize,
    pub message_cache_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            event_cache_size: 100_000,
            message_cache_size: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub sse_event_search_step_ms: u64,
    pub message_page_size: usize,
    pub event_lookback_ms: u64,
    /// Frames buffered per streaming request
    pub max_queue_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            sse_event_search_step_ms: 3_600_000,
            message_page_size: 100,
            event_lookback_ms: 86_400_000,
            max_queue_size: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheControlConfig {
    pub not_modified_max_age_s: u64,
    pub rarely_modified_max_age_s: u64,
    pub frequently_modified_max_age_s: u64,
}

impl Default for CacheControlConfig {
    fn default() -> Self {
        Self {
            not_modified_max_age_s: 86_400,
            rarely_modified_max_age_s: 60,
            frequently_modified_max_age_s: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodecMode {
    /// Messages are served raw with type `unknown`
    Disabled,
    /// Bodies are decoded in-process as JSON
    #[default]
    LoopbackJson,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub mode: CodecMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Empty starts with an empty store
    pub fixtures_path: String,
}

impl StorageConfig {
    #[must_use]
    pub fn fixtures(&self) -> Option<&Path> {
        (!self.fixtures_path.is_empty()).then(|| Path::new(&self.fixtures_path))
    }
}

/// Built-in defaults overlaid with an optional user file
pub struct ConfigManager {
    path: Option<PathBuf>,
    table: toml::Table,
    config: CliConfig,
}

impl ConfigManager {
    /// Built-in defaults only.
    ///
    /// # Errors
    ///
    /// Fails only if the bundled defaults are invalid.
    pub fn load_defaults() -> Result<Self> {
        Self::from_table(None, bundled_table()?)
    }

    /// Defaults overlaid with the file at `path` when it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// holds unusable values.
    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut table = bundled_table()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            let user: toml::Table = toml::from_str(&contents)
                .with_context(|| format!("invalid config at {}", path.display()))?;
            merge_tables(&mut table, user);
        }

        Self::from_table(Some(path), table)
    }

    fn from_table(path: Option<PathBuf>, table: toml::Table) -> Result<Self> {
        let config: CliConfig = toml::Value::Table(table.clone())
            .try_into()
            .context("config values have the wrong shape")?;
        config.validate()?;
        Ok(Self {
            path,
            table,
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &CliConfig {
        &self.config
    }

    pub const fn config_mut(&mut self) -> &mut CliConfig {
        &mut self.config
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Value at a dotted key such as `timeouts.request_timeout_ms`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownKey`] when nothing is configured under `key`.
    pub fn get(&self, key: &str) -> std::result::Result<String, ConfigError> {
        let mut parts = key.split('.');
        let unknown = || ConfigError::UnknownKey {
            key: key.to_string(),
        };
        let first = parts.next().ok_or_else(unknown)?;
        let mut value = self.table.get(first).ok_or_else(unknown)?;
        for part in parts {
            value = value.get(part).ok_or_else(unknown)?;
        }

        Ok(match value {
            toml::Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }

    /// Effective configuration rendered as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn render(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("failed to render config")
    }
}

fn bundled_table() -> Result<toml::Table> {
    toml::from_str(DEFAULT_CONFIG).context("bundled default config is invalid")
}

/// Overlay `overlay` onto `base`, descending into nested tables
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
