//! Shared plumbing for the feeder services
//!
//! - logging (console, daily-rolling business and frame logs)
//! - layered configuration loading
//! - command-line service arguments
//! - graceful shutdown
//! - hex helpers

pub mod bootstrap_args;
pub mod config_loader;
pub mod hex;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use config_loader::LoggingConfig;
pub use service_bootstrap::ServiceInfo;
