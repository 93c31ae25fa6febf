//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/taskweave/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/taskweave/` (~/.config/taskweave/)
//! - Data: `$XDG_DATA_HOME/taskweave/` (~/.local/share/taskweave/)
//! - State/Logs: `$XDG_STATE_HOME/taskweave/` (~/.local/state/taskweave/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Backend server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Event stream behavior
    #[serde(default)]
    pub stream: StreamConfig,

    /// Local history cache behavior
    #[serde(default)]
    pub history: HistoryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Base URL of the agent backend (e.g. `http://localhost:5172`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// HTTP request timeout in seconds (stream requests are exempt)
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:5172".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// Event stream behavior
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    /// Render consecutive `think` lines as collapsible groups
    #[serde(default)]
    pub long_thought: bool,

    /// Reconnect attempts after a transport failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between reconnect attempts, in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            long_thought: false,
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

/// Local history cache behavior
#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Days before a cached session is considered stale and evicted
    #[serde(default = "default_chat_max_age_days")]
    pub chat_max_age_days: u32,

    /// Hours before the last-active session pointer expires
    #[serde(default = "default_resume_max_age_hours")]
    pub resume_max_age_hours: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            chat_max_age_days: default_chat_max_age_days(),
            resume_max_age_hours: default_resume_max_age_hours(),
        }
    }
}

fn default_chat_max_age_days() -> u32 {
    7
}

fn default_resume_max_age_hours() -> u32 {
    24
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl ServerConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config(
                "server.base_url must not be empty".to_string(),
            ));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "server.base_url must be an http(s) URL, got {:?}",
                self.base_url
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.server.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/taskweave/config.toml` (~/.config/taskweave/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("taskweave").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite history cache)
    ///
    /// `$XDG_DATA_HOME/taskweave/` (~/.local/share/taskweave/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("taskweave")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/taskweave/` (~/.local/state/taskweave/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("taskweave")
    }

    /// Returns the history cache file path
    ///
    /// `$XDG_DATA_HOME/taskweave/history.db` (~/.local/share/taskweave/history.db)
    pub fn cache_path() -> PathBuf {
        Self::data_dir().join("history.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/taskweave/taskweave.log` (~/.local/state/taskweave/taskweave.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("taskweave.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
