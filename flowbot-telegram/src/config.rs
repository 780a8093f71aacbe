//! Configuration for the Telegram adapter.
//!
//! Provides configuration loading from TOML files with support for
//! multiple file locations, environment variable overrides, and sensible
//! defaults. The bot token is resolved separately and is never logged.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        /// Path to the configuration file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as TOML.
    #[error("failed to parse config file '{path}': {source}")]
    ParseError {
        /// Path to the configuration file that could not be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        source: toml::de::Error,
    },
}

/// Adapter configuration loaded from TOML.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Config {
    /// Telegram settings.
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,

    /// Optional file logging settings.
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// Telegram connection settings.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct TelegramConfig {
    /// Bot API token. The `TELEGRAM_BOT_TOKEN` env var takes precedence.
    #[serde(default)]
    pub token: Option<String>,
}

/// Rolling file logging settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Directory for log files.
    pub directory: String,

    /// Rotation: "daily", "hourly", or "never".
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Maximum number of rotated files to keep.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Config {
    /// Load configuration from the file system.
    ///
    /// Priority order:
    /// 1. An explicit path, when given
    /// 2. `FLOWBOT_CONFIG` environment variable
    /// 3. `./flowbot.toml` (local directory)
    /// 4. `~/.config/flowbot/config.toml` (user config)
    ///
    /// Returns default config if no config file is found.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IoError`] if a found file cannot be read.
    /// Returns [`ConfigError::ParseError`] if a found file is not valid TOML.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from(path);
        }

        if let Ok(path) = std::env::var("FLOWBOT_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                return Self::load_from(p);
            }
        }

        let local = PathBuf::from("flowbot.toml");
        if local.exists() {
            return Self::load_from(local);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config/flowbot/config.toml");
            if user_config.exists() {
                return Self::load_from(user_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IoError`] if the file cannot be read.
    /// Returns [`ConfigError::ParseError`] if the file is not valid TOML.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Resolve the bot token with the following priority:
///
/// 1. `TELEGRAM_BOT_TOKEN` environment variable (if set and non-empty).
/// 2. `telegram.token` in the config file.
///
/// The token is **never** passed to any tracing macro.
///
/// # Errors
///
/// Returns an error if neither source provides a token.
pub fn resolve_bot_token(config: &Config) -> anyhow::Result<String> {
    if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN")
        && !token.is_empty()
    {
        return Ok(token);
    }
    config
        .telegram
        .as_ref()
        .and_then(|t| t.token.clone())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Bot token required: set TELEGRAM_BOT_TOKEN env var or telegram.token in config"
            )
        })
}
