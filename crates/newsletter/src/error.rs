//! Error types for the newsletter crate.

use thiserror::Error;

/// Reasons a single delivery attempt can fail.
///
/// Every variant carries a human readable reason so the failure can be
/// logged once and handed back to the caller inside a
/// [`DeliveryResult`](crate::mailer::DeliveryResult).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailError {
    /// Sender/recipient could not be parsed or the MIME message could not be built.
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Host is empty or port is zero.
    #[error("Invalid SMTP endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// DNS resolution, TCP connect or greeting failed.
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// Implicit TLS handshake or STARTTLS upgrade failed.
    #[error("TLS negotiation failed: {reason}")]
    SecurityNegotiation { reason: String },

    /// The server rejected the credentials.
    #[error("SMTP authentication failed: {reason}")]
    Authentication { reason: String },

    /// The server rejected the envelope or message data.
    #[error("Message transmission failed: {reason}")]
    Transmission { reason: String },
}

impl MailError {
    /// Short, stable name of the failing step, used as a log field.
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::InvalidMessage { .. } => "message",
            Self::InvalidEndpoint { .. } => "endpoint",
            Self::Connection { .. } => "connect",
            Self::SecurityNegotiation { .. } => "tls",
            Self::Authentication { .. } => "auth",
            Self::Transmission { .. } => "send",
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

/// Result type alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
