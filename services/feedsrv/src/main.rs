//! Feeder Service binary

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use errors::{FeederError, FeederResult};
use feedsrv::bootstrap::{self, Args};
use feedsrv::{InMemoryFeederDatabase, ProtocolEngine};

#[tokio::main]
async fn main() -> FeederResult<()> {
    let args = Args::parse();
    let service_info = bootstrap::service_info();

    let config = bootstrap::load_configuration(&args.service)?;
    bootstrap::initialize_logging(&args.service, &service_info, &config)?;
    if !args.service.no_color {
        common::service_bootstrap::print_startup_banner(&service_info);
    }

    if args.service.validate {
        bootstrap::report_configuration(&config);
        info!("Validation completed successfully");
        return Ok(());
    }

    let database = Arc::new(InMemoryFeederDatabase::new());
    let engine = ProtocolEngine::new(config.to_engine_config()?, database);
    let bound = engine.bind().await.map_err(|e| {
        FeederError::StartupFailed(format!(
            "Failed to bind {}:{}: {}",
            config.listen.host, config.listen.port, e
        ))
    })?;

    let shutdown = common::shutdown::shutdown_token();
    bound.run(shutdown).await?;

    info!("Service shutdown complete");
    Ok(())
}
