//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Every variant is raised while building configuration, guards, or the
/// registry. A request over its rate is not an error: see
/// [`Decision::Denied`](crate::ratelimit::Decision::Denied).
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate must be a positive, finite number of permits per second
    #[error("Invalid rate {0}: must be greater than zero")]
    InvalidRate(f64),

    /// Burst must allow at least one permit
    #[error("Invalid burst {0}: must be at least 1")]
    InvalidBurst(u32),

    /// A limiter set was requested after the registry shut down
    #[error("Limiter registry is shut down")]
    RegistryClosed,

    /// The registry was built outside a Tokio runtime
    #[error("Limiter registry must be created within a Tokio runtime")]
    NoRuntime,

    /// Configuration source errors (file or environment)
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error stems from invalid limiter configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidRate(_) | Self::InvalidBurst(_) | Self::ConfigSource(_)
        )
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
