//! Service configuration
//!
//! Loaded from defaults, `config/feedsrv.yaml` (or `--config`) and
//! `FEEDSRV_*` environment variables, in increasing priority.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use common::config_loader::{self, LoggingConfig};
use errors::FeederResult;
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::error::{FeedSrvError, Result};
use crate::protocol::constants::DEFAULT_PORT;
use crate::protocol::{DeviceIdentifier, TimeOffset};

pub const SERVICE_NAME: &str = "feedsrv";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeedSrvConfig {
    pub listen: ListenConfig,
    /// Feeder identifiers allowed to connect; empty accepts all
    pub allow_list: Vec<String>,
    pub command_timeout_secs: u64,
    pub availability_window_secs: u64,
    pub idle_timeout_secs: u64,
    pub eviction_interval_secs: u64,
    pub time_offset: TimeOffset,
    pub logging: LoggingConfig,
}

impl Default for FeedSrvConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            allow_list: Vec::new(),
            command_timeout_secs: 30,
            availability_window_secs: 30,
            idle_timeout_secs: 600,
            eviction_interval_secs: 60,
            time_offset: TimeOffset::DEFAULT,
            logging: LoggingConfig::default(),
        }
    }
}

impl FeedSrvConfig {
    /// Load the layered configuration; `path` overrides the default file
    pub fn load(path: Option<&Path>) -> FeederResult<Self> {
        config_loader::load_config(SERVICE_NAME, path)
    }

    /// Check values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.listen.port == 0 {
            return Err(FeedSrvError::config("listen.port must not be 0"));
        }
        self.listen_ip()?;
        self.allowed_identifiers()?;

        let timeouts = [
            ("command_timeout_secs", self.command_timeout_secs),
            ("availability_window_secs", self.availability_window_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("eviction_interval_secs", self.eviction_interval_secs),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(FeedSrvError::config(format!("{} must be positive", field)));
        }
        Ok(())
    }

    fn listen_ip(&self) -> Result<IpAddr> {
        self.listen.host.parse().map_err(|_| {
            FeedSrvError::config(format!("listen.host is not an IP address: {}", self.listen.host))
        })
    }

    fn allowed_identifiers(&self) -> Result<HashSet<DeviceIdentifier>> {
        self.allow_list
            .iter()
            .map(|entry| {
                DeviceIdentifier::new(entry)
                    .map_err(|e| FeedSrvError::config(format!("allow_list: {}", e)))
            })
            .collect()
    }

    /// Validated engine parameters
    pub fn to_engine_config(&self) -> Result<EngineConfig> {
        self.validate()?;
        Ok(EngineConfig {
            listen_addr: SocketAddr::new(self.listen_ip()?, self.listen.port),
            allow_list: self.allowed_identifiers()?,
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            availability_window: Duration::from_secs(self.availability_window_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            eviction_interval: Duration::from_secs(self.eviction_interval_secs),
            time_offset: self.time_offset,
        })
    }
}
