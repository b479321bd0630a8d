//! Configuration management for carelog.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "carelog";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "records.db";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `CARELOG_`)
/// 2. TOML config file at `~/.config/carelog/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Remote blob store configuration.
    pub remote: RemoteConfig,
    /// Upload relay configuration.
    pub relay: RelayConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/carelog/records.db`
    pub database_path: Option<PathBuf>,
}

/// Remote blob store configuration.
///
/// The remote is a user-private application-data folder behind a Drive-style
/// HTTP API; metadata operations and content uploads live on different hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL for file metadata operations (list, delete).
    pub api_base_url: String,
    /// Base URL for content uploads (create, overwrite).
    pub upload_base_url: String,
    /// Path to the credential file the external sign-in flow deposits.
    /// Defaults to `~/.local/share/carelog/credentials.json`
    pub credentials_path: Option<PathBuf>,
}

/// Upload relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Whether the relay may submit consented records.
    pub enabled: bool,
    /// Form endpoint receiving the export.
    pub endpoint_url: String,
    /// Name of the query parameter carrying the JSON-encoded field subset.
    pub entry_field: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base_url: "https://www.googleapis.com/upload/drive/v3".to_string(),
            credentials_path: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint_url:
                "https://docs.google.com/forms/d/e/1FAIpQLSfCuhvlQ2KMw4nORV7dOBbmBNNvWZgvJ8jWSD-Tqr6bXOCgsw/formResponse"
                    .to_string(),
            entry_field: "entry.1164512684".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `CARELOG_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            .merge(Env::prefixed("CARELOG_").split("_"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("remote.api_base_url", &self.remote.api_base_url),
            ("remote.upload_base_url", &self.remote.upload_base_url),
            ("relay.endpoint_url", &self.relay.endpoint_url),
        ] {
            if reqwest::Url::parse(value).is_err() {
                return Err(Error::ConfigValidation {
                    message: format!("{name} is not a valid URL: {value}"),
                });
            }
        }

        if self.relay.entry_field.is_empty() {
            return Err(Error::ConfigValidation {
                message: "relay.entry_field must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the credential file path, resolving defaults if not set.
    #[must_use]
    pub fn credentials_path(&self) -> PathBuf {
        self.remote
            .credentials_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("credentials.json"))
    }
}
