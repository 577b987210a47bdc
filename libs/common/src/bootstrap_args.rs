//! Common command-line arguments for the feeder services
//!
//! Services flatten [`ServiceArgs`] into their own `clap` parser.

use std::path::PathBuf;

use clap::Args;

/// Common service startup arguments
#[derive(Debug, Clone, Default, Args)]
pub struct ServiceArgs {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Log level or filter spec (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RUST_LOG")]
    pub log_level: Option<String>,

    /// Listen port override
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Enable debug mode with verbose output
    #[arg(long)]
    pub debug: bool,

    /// Disable colored output (useful when piping to files)
    #[arg(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}
