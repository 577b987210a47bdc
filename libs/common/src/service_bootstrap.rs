//! Service startup helpers: banner, logging and `.env` loading

use tracing::{info, Level};

use crate::config_loader::LoggingConfig;
use crate::logging::{self, LogConfig};

/// Service metadata shown at startup
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub default_port: u16,
}

impl ServiceInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        default_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            default_port,
        }
    }
}

const FEEDSRV_BANNER: &str = r#"
 ███████╗███████╗███████╗██████╗ ███████╗██████╗ ██╗   ██╗
 ██╔════╝██╔════╝██╔════╝██╔══██╗██╔════╝██╔══██╗██║   ██║
 █████╗  █████╗  █████╗  ██║  ██║███████╗██████╔╝██║   ██║
 ██╔══╝  ██╔══╝  ██╔══╝  ██║  ██║╚════██║██╔══██╗╚██╗ ██╔╝
 ██║     ███████╗███████╗██████╔╝███████║██║  ██║ ╚████╔╝
 ╚═╝     ╚══════╝╚══════╝╚═════╝ ╚══════╝╚═╝  ╚═╝  ╚═══╝
"#;

pub fn print_startup_banner(service: &ServiceInfo) {
    if service.name == "feedsrv" {
        info!("{}", FEEDSRV_BANNER);
    }
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!(" Default Port: {}", service.default_port);
}

/// Leading level of a filter spec (`debug,feeder_frames=trace` -> DEBUG)
fn leading_level(spec: &str) -> Option<Level> {
    spec.split(',').next()?.trim().parse::<Level>().ok()
}

/// Install the service's subscriber
///
/// Files go to `{log_root}/{service}/` where the root is FEEDSRV_LOG_DIR,
/// else `logging_config.dir`. `level_override` (CLI / RUST_LOG) wins over
/// `logging_config.level`; a full filter spec is applied verbatim once the
/// subscriber is installed.
pub fn init_logging(
    service: &ServiceInfo,
    logging_config: &LoggingConfig,
    level_override: Option<&str>,
    ansi: bool,
) -> anyhow::Result<()> {
    logging::init_log_root(Some(logging_config.dir.as_str()));

    let spec = level_override.unwrap_or(logging_config.level.as_str());
    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::get_log_root().join(&service.name),
        console_level: leading_level(spec).unwrap_or(Level::INFO),
        ansi,
        enable_frame_log: logging_config.enable_frame_log,
        retention_days: logging_config.retention_days,
    };
    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    if spec.contains(',') || spec.contains('=') {
        logging::set_log_level(spec).map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}

/// Debug builds only: export `KEY=VALUE` lines of `./.env` not already set
pub fn load_development_env() {
    #[cfg(debug_assertions)]
    {
        let Ok(content) = std::fs::read_to_string(".env") else {
            return;
        };
        let pairs = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='));
        for (key, value) in pairs {
            let key = key.trim();
            if std::env::var_os(key).is_none() {
                std::env::set_var(key, value.trim());
            }
        }
    }
}
