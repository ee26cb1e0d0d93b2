//! Unified error handling for ValveLink services
//!
//! Crates keep their own small error enums and convert into [`ValveError`]
//! at their public boundary. [`ValveErrorTrait`] gives every error a stable
//! code, a category, and from the category a retry hint and a log level.

use thiserror::Error;
use tracing::Level;

/// Error taxonomy shared across the workspace
#[derive(Debug, Error)]
pub enum ValveError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Device link is down")]
    LinkDown,

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Authentication not completed within the grace period")]
    AuthTimeout,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ValveResult<T> = Result<T, ValveError>;

impl From<serde_json::Error> for ValveError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Coarse grouping used for retry and log decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    /// Device link could not be opened or was lost
    Connection,
    Protocol,
    /// Subscriber credentials
    Permission,
    /// A collaborator (worker, task) is gone
    Unavailable,
    Internal,
    Unknown,
}

pub trait ValveErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Stable SCREAMING_SNAKE code for logs and clients
    fn error_code(&self) -> &'static str;

    fn category(&self) -> ErrorCategory;

    /// Link failures heal on reconnect; nothing else does by itself
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connection | ErrorCategory::Unavailable
        )
    }

    fn log_level(&self) -> Level {
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Configuration => Level::ERROR,
            ErrorCategory::Permission => Level::INFO,
            ErrorCategory::Connection
            | ErrorCategory::Protocol
            | ErrorCategory::Unavailable
            | ErrorCategory::Unknown => Level::WARN,
        }
    }
}

impl ValveErrorTrait for ValveError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::LinkDown => "LINK_DOWN",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::AuthTimeout => "AUTH_TIMEOUT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::ConnectionFailed { .. } | Self::LinkDown => ErrorCategory::Connection,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Unauthorized(_) | Self::AuthTimeout => ErrorCategory::Permission,
            Self::ServiceUnavailable(_) => ErrorCategory::Unavailable,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorCategory::Internal,
            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ValveError::LinkDown.error_code(), "LINK_DOWN");
        assert_eq!(ValveError::AuthTimeout.error_code(), "AUTH_TIMEOUT");
        let err = ValveError::Protocol {
            message: "bad line".into(),
        };
        assert_eq!(err.error_code(), "PROTOCOL_ERROR");
        assert_eq!(err.to_string(), "Protocol error: bad line");
    }

    #[test]
    fn test_only_link_and_availability_retry() {
        assert!(ValveError::LinkDown.is_retryable());
        assert!(ValveError::ConnectionFailed {
            endpoint: "/dev/ttyUSB0".into(),
            reason: "busy".into()
        }
        .is_retryable());
        assert!(ValveError::ServiceUnavailable("supervisor".into()).is_retryable());
        assert!(!ValveError::Unauthorized("bad token".into()).is_retryable());
        assert!(!ValveError::InvalidConfig {
            field: "link.baud_rate".into(),
            reason: "must be > 0".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(ValveError::LinkDown.log_level(), Level::WARN);
        assert_eq!(ValveError::Internal("boom".into()).log_level(), Level::ERROR);
        assert_eq!(ValveError::AuthTimeout.log_level(), Level::INFO);
    }

    #[test]
    fn test_conversions() {
        let err: ValveError = serde_json::from_str::<u8>("x").unwrap_err().into();
        assert_eq!(err.category(), ErrorCategory::Internal);

        let err: ValveError = anyhow::anyhow!("wrapped").into();
        assert_eq!(err.to_string(), "wrapped");
        assert_eq!(err.error_code(), "OTHER_ERROR");
    }
}
