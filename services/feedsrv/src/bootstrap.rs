//! Service bootstrap
//!
//! Command-line parsing, configuration loading and logging setup for the
//! `feedsrv` binary. Shared pieces live in `common`.

use clap::Parser;
use tracing::info;

use common::service_bootstrap::{self, ServiceInfo};
use errors::{FeederError, FeederResult};

use crate::config::{FeedSrvConfig, SERVICE_NAME};
use crate::protocol::constants::DEFAULT_PORT;

pub use common::bootstrap_args::ServiceArgs;

/// Command-line arguments for feedsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "feedsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Feeder protocol engine",
    long_about = None
)]
pub struct Args {
    #[command(flatten)]
    pub service: ServiceArgs,
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        SERVICE_NAME,
        env!("CARGO_PKG_VERSION"),
        "Feeder Protocol Engine - TCP server for pet-feeder hardware",
        DEFAULT_PORT,
    )
}

/// Load configuration and apply command-line overrides
pub fn load_configuration(args: &ServiceArgs) -> FeederResult<FeedSrvConfig> {
    let mut config = FeedSrvConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.listen.port = port;
    }
    if args.debug && args.log_level.is_none() {
        config.logging.level = "debug".to_string();
    }
    config.validate()?;
    Ok(config)
}

/// Install the tracing subscriber
pub fn initialize_logging(
    args: &ServiceArgs,
    service: &ServiceInfo,
    config: &FeedSrvConfig,
) -> FeederResult<()> {
    service_bootstrap::load_development_env();
    service_bootstrap::init_logging(
        service,
        &config.logging,
        args.log_level.as_deref(),
        !args.no_color,
    )
    .map_err(|e| FeederError::StartupFailed(format!("Failed to init logging: {}", e)))
}

/// Report the effective configuration (`--validate`)
pub fn report_configuration(config: &FeedSrvConfig) {
    info!(
        "Listen address: {}:{}",
        config.listen.host, config.listen.port
    );
    if config.allow_list.is_empty() {
        info!("Allow-list: disabled, any feeder may connect");
    } else {
        info!("Allow-list: {} feeder(s)", config.allow_list.len());
    }
    info!(
        "Command timeout: {}s, availability window: {}s, idle timeout: {}s",
        config.command_timeout_secs, config.availability_window_secs, config.idle_timeout_secs
    );
    info!(
        "Time offset: {:02}:{:02}",
        config.time_offset.hours(),
        config.time_offset.minutes()
    );
}
