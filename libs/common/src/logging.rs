//! Logging for the feeder services
//!
//! Console output plus two daily files per service under
//! `{log_root}/{service}/`: the business log and a frame log fed only by
//! the [`FRAME_TARGET`] tracing target.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter,
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Tracing target carrying hex dumps of every frame read from or written to a device
pub const FRAME_TARGET: &str = "feeder_frames";

/// Environment variable overriding the log root directory
pub const LOG_DIR_ENV: &str = "FEEDSRV_LOG_DIR";

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// `timestamp [LEVEL] message`
///
/// Example output: `2026-03-02T00:50:44.809123Z [INFO] Feeder engine listening on 0.0.0.0:9999`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// ============================================================================
// Log root
// ============================================================================

/// Priority: FEEDSRV_LOG_DIR env > config dir > "logs"
static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Fix the log root; the first call wins
pub fn init_log_root(config_dir: Option<&str>) {
    LOG_ROOT.get_or_init(|| {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(config_dir.unwrap_or("logs")))
    });
}

pub fn get_log_root() -> PathBuf {
    LOG_ROOT.get().cloned().unwrap_or_else(|| {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("logs"))
    })
}

// ============================================================================
// Subscriber
// ============================================================================

/// Keeps the non-blocking writers flushing until process exit
static GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub service_name: String,
    /// Directory holding this service's files
    pub log_dir: PathBuf,
    /// Base level used when RUST_LOG is not set
    pub console_level: Level,
    pub ansi: bool,
    /// Write the frame target to its own file
    pub enable_frame_log: bool,
    /// Daily files kept per log
    pub retention_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "feedsrv".to_string(),
            log_dir: get_log_root(),
            console_level: Level::INFO,
            ansi: true,
            enable_frame_log: true,
            retention_days: 30,
        }
    }
}

/// Daily file `{service}{suffix}.{YYYY-MM-DD}.log`, keeping `retention_days` files
fn daily_appender(
    config: &LogConfig,
    suffix: &str,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(format!("{}{}", config.service_name, suffix))
        .filename_suffix("log")
        .max_log_files(config.retention_days.max(1) as usize)
        .build(&config.log_dir)
}

fn keep_guard(guard: WorkerGuard) {
    match GUARDS.lock() {
        Ok(mut guards) => guards.push(guard),
        Err(poisoned) => poisoned.into_inner().push(guard),
    }
}

/// Filter applied before the per-layer filters; RUST_LOG wins
fn initial_filter(config: &LogConfig) -> String {
    let frame_level = if config.enable_frame_log {
        "debug"
    } else {
        "off"
    };

    match std::env::var("RUST_LOG") {
        Ok(env_str) if env_str.contains(FRAME_TARGET) => env_str,
        Ok(env_str) => format!("{},{}={}", env_str, FRAME_TARGET, frame_level),
        Err(_) => format!(
            "{},{}={}",
            config.console_level.as_str().to_lowercase(),
            FRAME_TARGET,
            frame_level
        ),
    }
}

/// Install the global subscriber
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(&config.log_dir)?;

    let env_filter = EnvFilter::try_new(initial_filter(&config))?;
    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let _ = FILTER_HANDLE.set(reload_handle);

    // Frame dumps reach the console only at trace level
    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() != FRAME_TARGET || *metadata.level() == Level::TRACE
        }));

    let (business_writer, guard) = tracing_appender::non_blocking(daily_appender(&config, "")?);
    keep_guard(guard);
    let business_layer = fmt::layer()
        .with_writer(business_writer)
        .with_ansi(false)
        .event_format(BracketedLevelFormat)
        .with_filter(filter::filter_fn(|metadata| metadata.target() != FRAME_TARGET));

    let frame_layer = if config.enable_frame_log {
        let (frame_writer, guard) =
            tracing_appender::non_blocking(daily_appender(&config, "_frames")?);
        keep_guard(guard);
        Some(
            fmt::layer()
                .with_writer(frame_writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .with_filter(filter::filter_fn(|metadata| metadata.target() == FRAME_TARGET)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(business_layer)
        .with(frame_layer)
        .try_init()?;

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    Ok(())
}

/// Replace the filter at runtime
///
/// Accepts a plain level (`debug`) or a full spec (`info,feeder_frames=debug`).
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;
    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}
