use thiserror::Error;

/// Custom error types for the edge shield
#[derive(Error, Debug)]
pub enum ShieldError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Redis related errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Upstream HTTP errors (proxying and health probes)
    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// A collaborator did not answer within the lookup budget
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// WAF rule set could not be compiled or parsed
    #[error("Invalid WAF rule {id}: {reason}")]
    InvalidRule { id: String, reason: String },

    /// Invalid request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for edge shield operations
pub type ShieldResult<T> = Result<T, ShieldError>;

impl From<serde_json::Error> for ShieldError {
    fn from(err: serde_json::Error) -> Self {
        ShieldError::Internal(err.to_string())
    }
}
