//! Layered configuration loading
//!
//! Priority (highest to lowest):
//! 1. Environment variables `{SERVICE}_*`, nested keys separated by `__`
//! 2. Explicit config file (`--config`) or `config/{service}.{yaml,yml,toml,json}`
//! 3. `Default` values of the config type

use std::path::{Path, PathBuf};

use errors::{FeederError, FeederResult};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Logging section shared by service configs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log root directory (FEEDSRV_LOG_DIR takes precedence)
    pub dir: String,
    /// Base filter level when RUST_LOG is not set
    pub level: String,
    /// Write device frames to a dedicated file
    pub enable_frame_log: bool,
    /// Days to keep log files
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            level: "info".to_string(),
            enable_frame_log: true,
            retention_days: 30,
        }
    }
}

/// Environment prefix for a service: `feedsrv` -> `FEEDSRV_`
pub fn env_prefix(service_name: &str) -> String {
    format!("{}_", service_name.to_uppercase())
}

/// Figment provider for a single config file, chosen by extension
fn file_figment(figment: Figment, path: &Path) -> FeederResult<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            FeederError::Configuration(format!(
                "Config file must have an extension: {}",
                path.display()
            ))
        })?;

    match extension {
        "toml" => Ok(figment.merge(Toml::file(path))),
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        "json" => Ok(figment.merge(Json::file(path))),
        _ => Err(FeederError::Configuration(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

/// Find `config/{service}.{yaml,yml,toml,json}` relative to the working directory
pub fn default_config_path(service_name: &str) -> Option<PathBuf> {
    ["yaml", "yml", "toml", "json"]
        .iter()
        .map(|ext| PathBuf::from(format!("config/{}.{}", service_name, ext)))
        .find(|path| path.exists())
}

/// Load a service configuration from defaults, file and environment
///
/// An explicit path must exist; the default location is optional.
pub fn load_config<T>(service_name: &str, explicit_path: Option<&Path>) -> FeederResult<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    match explicit_path {
        Some(path) => {
            if !path.exists() {
                return Err(FeederError::Configuration(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            info!("Loading configuration from: {}", path.display());
            figment = file_figment(figment, path)?;
        },
        None => match default_config_path(service_name) {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                figment = file_figment(figment, &path)?;
            },
            None => debug!("No config file for {}, using defaults", service_name),
        },
    }

    figment = figment.merge(Env::prefixed(&env_prefix(service_name)).split("__"));

    figment
        .extract()
        .map_err(|e| FeederError::Configuration(format!("Failed to load configuration: {}", e)))
}
