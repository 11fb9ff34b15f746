//! Configuration errors.
//!
//! Runtime failures live with the storage backend; this module only covers
//! problems detected while building a [`PoolConfig`](crate::PoolConfig).

/// Error type for configuration loading and validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Pool size {size} is out of range (must be {min}-{max})")]
    PoolSizeOutOfRange { size: usize, min: usize, max: usize },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

impl ConfigError {
    pub(crate) fn invalid_env(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidEnvVar {
            key: key.to_string(),
            message: message.into(),
        }
    }
}
