//! Shared error surface for the feeder services
//!
//! Each service keeps its own domain error and implements
//! [`FeederErrorTrait`] on it. [`FeederError`] is the type used at process
//! boundaries (bootstrap, `main`) and by the API layer for status codes.

use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error)]
pub enum FeederError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The target is busy with another request
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service startup failed: {0}")]
    StartupFailed(String),
}

pub type FeederResult<T> = Result<T, FeederError>;

impl FeederError {
    /// HTTP-like status code for the API layer
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::ResourceBusy(_) => 409,
            Self::Protocol { .. } => 502,
            Self::NotConnected(_) | Self::StartupFailed(_) => 503,
            Self::Timeout(_) => 504,
            Self::Configuration(_) | Self::Storage(_) | Self::Io(_) => 500,
        }
    }
}

impl FeederErrorTrait for FeederError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::ResourceBusy(_) => "RESOURCE_BUSY",
            Self::Io(_) => "IO_ERROR",
            Self::StartupFailed(_) => "STARTUP_FAILED",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Storage(_) => ErrorCategory::Database,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::NotConnected(_) => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Unauthorized(_) => ErrorCategory::Permission,
            Self::ResourceBusy(_) => ErrorCategory::ResourceBusy,
            Self::Io(_) | Self::StartupFailed(_) => ErrorCategory::Internal,
        }
    }
}

/// Coarse classification driving retry hints and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Database,
    Timeout,
    Validation,
    Permission,
    Protocol,
    Connection,
    ResourceBusy,
    Internal,
}

/// Common interface over the per-service error types
pub trait FeederErrorTrait: std::error::Error + Send + Sync + 'static {
    fn error_code(&self) -> &'static str;

    fn category(&self) -> ErrorCategory;

    /// Whether the caller may retry; the services never retry on their own
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Timeout | ErrorCategory::ResourceBusy | ErrorCategory::Connection
        )
    }

    fn log_level(&self) -> Level {
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Database => Level::ERROR,
            ErrorCategory::Validation => Level::INFO,
            _ => Level::WARN,
        }
    }
}
