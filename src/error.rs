//! Error types for gadget-dbus.

use thiserror::Error;

/// A specialized Result type for bus operations.
pub type Result<T> = std::result::Result<T, DbusError>;

/// Main error type for proxy and connection operations.
#[derive(Error, Debug)]
pub enum DbusError {
    // ─────────────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Bus connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Invalid proxy identity: {0}")]
    InvalidIdentity(String),

    // ─────────────────────────────────────────────────────────────────────
    // Call Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Introspection failed for {0}")]
    IntrospectionFailed(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Method call timed out: {0}")]
    Timeout(String),

    #[error("Remote error {name}: {message}")]
    RemoteError { name: String, message: String },

    #[error("Method call cancelled")]
    CallCancelled,

    // ─────────────────────────────────────────────────────────────────────
    // Infrastructure Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] zbus::zvariant::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbusError {
    pub fn type_mismatch(detail: impl Into<String>) -> Self {
        DbusError::TypeMismatch(detail.into())
    }

    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        DbusError::RemoteError {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for DbusError {
    fn from(err: config::ConfigError) -> Self {
        DbusError::Config(err.to_string())
    }
}
