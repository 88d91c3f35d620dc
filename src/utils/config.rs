//! Configuration management for the contacts library and CLI.
//!
//! TOML-based configuration layered from defaults, an optional file and
//! environment variables, validated before use.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "contacts.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "CONTACTS";

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactsConfig {
    /// PANDA rendezvous exchange tuning
    pub panda: PandaConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// PANDA coordinator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PandaConfig {
    /// Delay between rendezvous polls in milliseconds
    pub poll_interval_ms: u64,
    /// Number of polls before the exchange is declared failed
    pub max_attempts: u32,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// File holding the serialized contact book
    pub state_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for PandaConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: crate::defaults::DEFAULT_PANDA_POLL_INTERVAL_MS,
            max_attempts: crate::defaults::DEFAULT_PANDA_MAX_ATTEMPTS,
        }
    }
}

impl PandaConfig {
    /// Poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mixnet-contacts");

        Self {
            state_file: data_dir.join("contacts.bin"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ContactsConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            config = Self::from_file(path)?;
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("mixnet-contacts")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|l| l.exists()) {
                log::debug!("Loading configuration from {}", location.display());
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Point storage at a different data directory, keeping the state file name
    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        let file_name = self
            .storage
            .state_file
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("contacts.bin"));
        self.storage.state_file = data_dir.join(file_name);
        self.storage.data_dir = data_dir;
        self
    }

    fn merge_from_env(mut self) -> Result<Self> {
        let var = |name: &str| std::env::var(format!("{ENV_PREFIX}_{name}"));

        if let Ok(interval) = var("PANDA_POLL_INTERVAL_MS") {
            self.panda.poll_interval_ms = interval.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_PANDA_POLL_INTERVAL_MS"),
                value: interval,
            })?;
        }

        if let Ok(attempts) = var("PANDA_MAX_ATTEMPTS") {
            self.panda.max_attempts = attempts.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_PANDA_MAX_ATTEMPTS"),
                value: attempts,
            })?;
        }

        if let Ok(level) = var("LOGGING_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(data_dir) = var("STORAGE_DATA_DIR") {
            self = self.with_data_dir(PathBuf::from(data_dir));
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.panda.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "panda.poll_interval_ms".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.panda.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "panda.max_attempts".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: self.logging.level.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Ensure the data directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        let dir = &self.storage.data_dir;
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                path: dir.display().to_string(),
            })?;
        }
        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
