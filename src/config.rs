//! Bootstrap configuration for the switchd server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The result
//! seeds the runtime [`ConfigStore`](crate::store::ConfigStore): the
//! `[settings]` table and the built-in defaults become its init values,
//! CLI overrides are written after it is opened.

use crate::server::DEFAULT_PORT;
use crate::switchboard::access::{
    MAX_TRACKING_COUNT_KEY, MAX_TRACKING_HOST_COUNT_KEY, MAX_TRACKING_TIME_KEY,
};
use crate::switchboard::ACCESS_CLEANUP_THREAD;
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Thread name of the connection server.
pub const HTTPD_THREAD: &str = "10_httpd";

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "switchd")]
#[command(version = "0.1.0")]
#[command(about = "A line protocol server with scheduled maintenance threads", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address, `[bind:]port` (e.g., 8090 or 127.0.0.1:8090)
    #[arg(short, long)]
    pub port: Option<String>,

    /// Path of the persisted settings store
    #[arg(short, long)]
    pub store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Initial values of runtime settings.
    #[serde(default)]
    pub settings: BTreeMap<String, toml::Value>,
}

/// Settings store configuration
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("DATA/SETTINGS/switchd.toml")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Keys every store starts with.
pub fn default_settings() -> BTreeMap<String, String> {
    let mut settings: BTreeMap<String, String> = [
        ("port", DEFAULT_PORT),
        ("bindPort", ""),
        ("httpdMaxBusySessions", "100"),
        ("keyStore", ""),
        ("keyStorePassword", ""),
        ("pkcs12ImportFile", ""),
        ("pkcs12ImportPwd", ""),
        (MAX_TRACKING_TIME_KEY, "3600000"),
        (MAX_TRACKING_COUNT_KEY, "1000"),
        (MAX_TRACKING_HOST_COUNT_KEY, "100"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    for (thread, idle, busy, memprereq) in [
        (HTTPD_THREAD, "0", "0", "0"),
        (ACCESS_CLEANUP_THREAD, "60000", "60000", "0"),
    ] {
        settings.insert(format!("{thread}_idlesleep"), idle.to_string());
        settings.insert(format!("{thread}_busysleep"), busy.to_string());
        settings.insert(format!("{thread}_memprereq"), memprereq.to_string());
    }
    settings
}

fn setting_text(value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub store_path: PathBuf,
    pub log_level: String,
    /// Init values of the settings store.
    pub settings: BTreeMap<String, String>,
    /// Values written over the opened store.
    pub overrides: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut settings = default_settings();
        settings.extend(
            toml_config
                .settings
                .into_iter()
                .map(|(k, v)| (k, setting_text(v))),
        );

        let mut overrides = BTreeMap::new();
        if let Some(port) = cli.port {
            overrides.insert("port".to_string(), port);
        }

        Ok(Config {
            store_path: cli.store.unwrap_or(toml_config.store.path),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            settings,
            overrides,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
