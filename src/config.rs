//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - dbplugin.toml (default configuration)
//! - dbplugin.local.toml (git-ignored local overrides)
//! - Environment variables (DBPLUGIN_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # dbplugin.toml
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [rpc]
//! control_timeout_ms = 1000
//!
//! [plugin]
//! startup_timeout_ms = 10000
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! DBPLUGIN_RPC__CONTROL_TIMEOUT_MS=5000
//! DBPLUGIN_LOGGING__LEVEL=trace
//! ```

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub plugin: PluginConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Append logs to this file instead of standard error.
    /// Standard output belongs to the plugin handshake.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// RPC client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Deadline of the `Type` and `Close` calls
    #[serde(default = "default_control_timeout_ms")]
    pub control_timeout_ms: u64,

    /// How long to wait for the exit signal after a transport failure
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: default_control_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl RpcConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Plugin process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// How long the host waits for the handshake line
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Address the plugin listens on
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Lifetime of the wrap token carrying TLS material
    #[serde(default = "default_wrap_ttl_secs")]
    pub wrap_ttl_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            bind_host: default_bind_host(),
            wrap_ttl_secs: default_wrap_ttl_secs(),
        }
    }
}

impl PluginConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn wrap_ttl(&self) -> Duration {
        Duration::from_secs(self.wrap_ttl_secs)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_control_timeout_ms() -> u64 {
    1_000
}
fn default_shutdown_grace_ms() -> u64 {
    250
}
fn default_startup_timeout_ms() -> u64 {
    10_000
}
fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}
fn default_wrap_ttl_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. dbplugin.toml (base configuration)
    /// 2. dbplugin.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (DBPLUGIN_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("dbplugin.toml"))
            .merge(Toml::file("dbplugin.local.toml"))
            .merge(Env::prefixed("DBPLUGIN_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DBPLUGIN_").split("__"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.rpc.control_timeout(), Duration::from_secs(1));
        assert_eq!(config.plugin.startup_timeout(), Duration::from_secs(10));
        assert_eq!(config.plugin.bind_host, "127.0.0.1");
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: Config = toml::from_str("[rpc]\ncontrol_timeout_ms = 50\n").unwrap();
        assert_eq!(config.rpc.control_timeout_ms, 50);
        assert_eq!(config.rpc.shutdown_grace_ms, 250);
        assert_eq!(config.logging, LoggingConfig::default());
    }
}
