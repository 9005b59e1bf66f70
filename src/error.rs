//! Error types for the Tollgate engine.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Rejections are not errors: a denied request is an ordinary
/// [`Decision`](crate::ratelimit::Decision) value.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit policy with values the engine cannot honor
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// An endpoint signature that is not of the form `METHOD /path`
    #[error("Invalid endpoint signature: {0:?}")]
    InvalidEndpoint(String),

    /// Bucket or registry state that violates its invariants
    #[error("Internal state fault: {0}")]
    StateFault(String),

    /// Layered configuration loading errors
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
