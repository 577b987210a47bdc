//! Error handling for the Feeder Service
//!
//! `ValidationError` and `ProtocolError` are raised by the value types and the
//! codec; `FeedSrvError` is what the engine and its public operations return.

use std::time::Duration;

use bytes::Bytes;
use errors::{ErrorCategory, FeederError, FeederErrorTrait};
use thiserror::Error;

/// Malformed time, quantity or identifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid feeder identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Invalid time {hours}:{minutes}")]
    InvalidTime { hours: i64, minutes: i64 },

    #[error("Unparsable time: {0:?}")]
    UnparsableTime(String),

    #[error("Encoded time out of range: {0}")]
    EncodedTimeOutOfRange(u16),

    #[error("Invalid time offset {hours}:{minutes}")]
    InvalidOffset { hours: u8, minutes: u8 },

    #[error("Quantity {0} out of range [5, 150]")]
    QuantityOutOfRange(i64),

    #[error("Invalid quantity: {0:?}")]
    InvalidQuantity(String),

    #[error("Too many enabled meals: {0} (max 255)")]
    TooManyMeals(usize),
}

/// Wire-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown frame: {}", common::hex::encode_upper(.0))]
    UnknownFrame(Bytes),
}

/// Feeder Service error type
#[derive(Error, Debug, Clone)]
pub enum FeedSrvError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Identifier absent from the configured allow-list
    #[error("Unauthorized feeder: {0}")]
    Unauthorized(String),

    #[error("Feeder not connected: {0}")]
    NotConnected(String),

    #[error("Timeout after {after:?} waiting for acknowledgement from {identifier}")]
    Timeout { identifier: String, after: Duration },

    /// Another command is still awaiting its acknowledgement on this feeder
    #[error("Command already in flight for feeder {0}")]
    ConcurrentCommand(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for the Feeder Service
pub type Result<T> = std::result::Result<T, FeedSrvError>;

impl FeedSrvError {
    pub fn not_connected(identifier: impl std::fmt::Display) -> Self {
        FeedSrvError::NotConnected(identifier.to_string())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        FeedSrvError::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        FeedSrvError::Config(msg.into())
    }

    /// Unknown frame error carrying a copy of the raw bytes
    pub fn unknown_frame(raw: &[u8]) -> Self {
        FeedSrvError::Protocol(ProtocolError::UnknownFrame(Bytes::copy_from_slice(raw)))
    }

    /// Errors that close the device connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Unauthorized(_) | Self::Validation(_)
        )
    }
}

impl From<std::io::Error> for FeedSrvError {
    fn from(err: std::io::Error) -> Self {
        FeedSrvError::Io(err.to_string())
    }
}

// ============================================================================
// Conversion from FeedSrvError to FeederError at the process boundary
// ============================================================================

impl From<FeedSrvError> for FeederError {
    fn from(err: FeedSrvError) -> Self {
        match err {
            FeedSrvError::Validation(e) => FeederError::Validation(e.to_string()),
            FeedSrvError::Protocol(e) => FeederError::Protocol {
                protocol: "feeder".to_string(),
                message: e.to_string(),
            },
            FeedSrvError::Unauthorized(id) => FeederError::Unauthorized(id),
            FeedSrvError::NotConnected(id) => FeederError::NotConnected(id),
            FeedSrvError::Timeout { identifier, .. } => FeederError::Timeout(identifier),
            FeedSrvError::ConcurrentCommand(id) => FeederError::ResourceBusy(id),
            FeedSrvError::Storage(msg) => FeederError::Storage(msg),
            FeedSrvError::Io(msg) => FeederError::Io(std::io::Error::other(msg)),
            FeedSrvError::Config(msg) => FeederError::Configuration(msg),
        }
    }
}

impl FeederErrorTrait for FeedSrvError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "FEEDSRV_VALIDATION_ERROR",
            Self::Protocol(_) => "FEEDSRV_PROTOCOL_ERROR",
            Self::Unauthorized(_) => "FEEDSRV_UNAUTHORIZED",
            Self::NotConnected(_) => "FEEDSRV_NOT_CONNECTED",
            Self::Timeout { .. } => "FEEDSRV_TIMEOUT",
            Self::ConcurrentCommand(_) => "FEEDSRV_CONCURRENT_COMMAND",
            Self::Storage(_) => "FEEDSRV_STORAGE_ERROR",
            Self::Io(_) => "FEEDSRV_IO_ERROR",
            Self::Config(_) => "FEEDSRV_CONFIG_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Unauthorized(_) => ErrorCategory::Permission,
            Self::NotConnected(_) => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::ConcurrentCommand(_) => ErrorCategory::ResourceBusy,
            Self::Storage(_) => ErrorCategory::Database,
            Self::Io(_) => ErrorCategory::Internal,
            Self::Config(_) => ErrorCategory::Configuration,
        }
    }
}
