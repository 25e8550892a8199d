//! Configuration for the server wrapper.
//!
//! Supports configuration via:
//! - Environment variables (primary)
//! - Optional TOML config file (secondary)
//!
//! Environment variables take precedence over config file values. The
//! configuration is immutable once a server has been constructed from it.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ServerError};

/// Server wrapper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name reported by `info` (default: crate name)
    #[serde(default = "default_name")]
    pub name: String,

    /// Listen host (default: 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Compress response bodies when the client accepts it (default: false)
    #[serde(default)]
    pub enable_content_encoding: bool,

    /// Requests slower than this many milliseconds get a `slow` access-log
    /// field; values <= 0 disable the check (default: 500)
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: i64,

    /// How long a graceful stop may wait for in-flight requests (default: 10)
    #[serde(default = "default_graceful_timeout_secs")]
    pub graceful_timeout_secs: u64,

    /// Log level filter (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_name() -> String {
    env!("CARGO_PKG_NAME").to_owned()
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_slow_query_threshold_ms() -> i64 {
    500
}

fn default_graceful_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
            enable_content_encoding: false,
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
            graceful_timeout_secs: default_graceful_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - SERVEKIT_CONFIG_FILE: optional path to a TOML config file
    /// - SERVEKIT_NAME: service name
    /// - SERVEKIT_HOST: listen host (default: 0.0.0.0)
    /// - SERVEKIT_PORT: listen port (default: 8080)
    /// - SERVEKIT_ENABLE_CONTENT_ENCODING: true|false
    /// - SERVEKIT_SLOW_QUERY_THRESHOLD_MS: slow-request threshold, <= 0 disables
    /// - SERVEKIT_GRACEFUL_TIMEOUT_SECS: graceful-stop drain budget
    /// - SERVEKIT_LOG_LEVEL: log level filter (default: info)
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SERVEKIT_CONFIG_FILE") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(name) = std::env::var("SERVEKIT_NAME") {
            config.name = name;
        }

        if let Ok(host) = std::env::var("SERVEKIT_HOST") {
            config.host = host;
        }

        if let Ok(port) = std::env::var("SERVEKIT_PORT") {
            config.port = port
                .parse()
                .map_err(|e| ServerError::Config(format!("invalid port: {e}")))?;
        }

        if let Ok(enabled) = std::env::var("SERVEKIT_ENABLE_CONTENT_ENCODING") {
            config.enable_content_encoding = enabled
                .parse()
                .map_err(|e| ServerError::Config(format!("invalid content-encoding flag: {e}")))?;
        }

        if let Ok(threshold) = std::env::var("SERVEKIT_SLOW_QUERY_THRESHOLD_MS") {
            config.slow_query_threshold_ms = threshold
                .parse()
                .map_err(|e| ServerError::Config(format!("invalid slow-query threshold: {e}")))?;
        }

        if let Ok(secs) = std::env::var("SERVEKIT_GRACEFUL_TIMEOUT_SECS") {
            config.graceful_timeout_secs = secs
                .parse()
                .map_err(|e| ServerError::Config(format!("invalid graceful timeout: {e}")))?;
        }

        if let Ok(level) = std::env::var("SERVEKIT_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// The `host:port` address the listener binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
