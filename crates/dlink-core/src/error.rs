//! Application error types with rich context

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to connect: {message}")]
    Connect { message: String },

    #[error("Failed to send frame: {message}")]
    Send { message: String },

    #[error("Connection closed: {reason}")]
    Closed { reason: String },

    #[error("HTTP request failed: {message}")]
    Http { message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("Server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel send error: {message}")]
    ChannelSend { message: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    pub fn send(message: impl Into<String>) -> Self {
        Self::Send {
            message: message.into(),
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors are logged and the session keeps running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage { .. }
                | Error::Send { .. }
                | Error::Rpc { .. }
                | Error::ChannelSend { .. }
        )
    }

    /// Check if this error should end the session
    ///
    /// `AuthFailed` is absent: it is fatal during the initial exchange and
    /// tolerated during a refresh, so the controller decides.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. } | Error::Closed { .. } | Error::ConfigInvalid { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::connect("dns lookup failed");
        assert_eq!(err.to_string(), "Failed to connect: dns lookup failed");

        let err = Error::rpc(13009, "invalid_credentials");
        assert_eq!(
            err.to_string(),
            "Server returned error 13009: invalid_credentials"
        );

        let err = Error::timeout("auth response");
        assert!(err.to_string().contains("auth response"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::connect("tls").is_fatal());
        assert!(Error::closed("eof").is_fatal());
        assert!(Error::config_invalid("bad url").is_fatal());
        assert!(!Error::malformed("x").is_fatal());
        assert!(!Error::auth_failed("x").is_fatal());
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::malformed("not json").is_recoverable());
        assert!(Error::send("socket gone").is_recoverable());
        assert!(Error::rpc(10000, "x").is_recoverable());
        assert!(!Error::closed("eof").is_recoverable());
        assert!(!Error::auth_failed("x").is_recoverable());
    }
}
