//! Error handling for the valve service
//!
//! Local error enums stay small and map into [`errors::ValveError`] at the
//! service boundary. Command timeouts and a down link are not errors here:
//! they are reported as [`crate::link::CommandOutcome`] values.

use errors::{ErrorCategory, ValveError, ValveErrorTrait};
use thiserror::Error;

/// Device link failures (open/read/write)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Failed to open {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },

    #[error("No matching serial device found")]
    NoDevice,

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Link closed by peer")]
    Closed,

    #[error("Link shut down")]
    Shutdown,
}

/// Malformed or oversized input from the device
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed telemetry: {reason}")]
    MalformedTelemetry { reason: String },

    #[error("Line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Unknown command verb: {0}")]
    UnknownVerb(String),
}

/// Subscriber authentication failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    Expired,

    #[error("Authentication timed out")]
    Timeout,

    #[error("Unknown subscriber")]
    UnknownSubscriber,
}

/// Result type alias for the valve service
pub type Result<T> = std::result::Result<T, ValveError>;

impl From<LinkError> for ValveError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Open { endpoint, reason } => ValveError::ConnectionFailed { endpoint, reason },
            LinkError::NoDevice => ValveError::ConnectionFailed {
                endpoint: "AUTO".to_string(),
                reason: err.to_string(),
            },
            LinkError::Write(_) | LinkError::Read(_) | LinkError::Closed | LinkError::Shutdown => {
                ValveError::LinkDown
            },
        }
    }
}

impl From<ProtocolError> for ValveError {
    fn from(err: ProtocolError) -> Self {
        ValveError::Protocol {
            message: err.to_string(),
        }
    }
}

impl From<AuthError> for ValveError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Timeout => ValveError::AuthTimeout,
            other => ValveError::Unauthorized(other.to_string()),
        }
    }
}

impl ValveErrorTrait for LinkError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Open { .. } => "LINK_OPEN_FAILED",
            Self::NoDevice => "LINK_NO_DEVICE",
            Self::Write(_) => "LINK_WRITE_FAILED",
            Self::Read(_) => "LINK_READ_FAILED",
            Self::Closed => "LINK_CLOSED",
            Self::Shutdown => "LINK_SHUTDOWN",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Shutdown => ErrorCategory::Internal,
            _ => ErrorCategory::Connection,
        }
    }
}

impl ValveErrorTrait for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidToken(_) => "AUTH_INVALID_TOKEN",
            Self::Expired => "AUTH_EXPIRED",
            Self::Timeout => "AUTH_TIMEOUT",
            Self::UnknownSubscriber => "AUTH_UNKNOWN_SUBSCRIBER",
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Permission
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_link_error_conversion() {
        let err: ValveError = LinkError::Open {
            endpoint: "/dev/ttyACM0".into(),
            reason: "busy".into(),
        }
        .into();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");

        let err: ValveError = LinkError::Closed.into();
        assert!(matches!(err, ValveError::LinkDown));
    }

    #[test]
    fn test_link_errors_are_retryable() {
        assert!(LinkError::Read("eof".into()).is_retryable());
        assert!(!LinkError::Shutdown.is_retryable());
    }

    #[test]
    fn test_auth_error_conversion() {
        let err: ValveError = AuthError::InvalidToken("bad".into()).into();
        assert_eq!(err.error_code(), "UNAUTHORIZED");
        assert!(!AuthError::Expired.is_retryable());
        assert_eq!(AuthError::Timeout.log_level(), tracing::Level::INFO);
    }
}
