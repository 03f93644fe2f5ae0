//! Configuration system for the Kocmoc CLI.

use kocmoc_crypto::config::CryptoConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Largest accepted `max_skip`; keeps a flooded cache within a few MiB.
const MAX_SKIP_CEILING: u32 = 100_000;

/// Kocmoc configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Session and pre-key limits (`[session]` and `[prekeys]` tables)
    #[serde(flatten)]
    pub crypto: CryptoConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path` if it exists; `None` means the caller falls back to defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_if_exists<P: AsRef<Path>>(path: P) -> anyhow::Result<Option<Self>> {
        if path.as_ref().exists() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from("kocmoc.toml")
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let max_skip = self.crypto.session.max_skip;
        if max_skip == 0 || max_skip > MAX_SKIP_CEILING {
            anyhow::bail!("max_skip must be between 1 and {}", MAX_SKIP_CEILING);
        }

        if self.crypto.prekeys.signed_prekey_max_age_secs == 0 {
            anyhow::bail!("signed_prekey_max_age_secs must be positive");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}
