//! Model client error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during model calls
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Provider error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Context window exceeded: {tokens} tokens over limit {limit}")]
    ContextWindowExceeded { tokens: u64, limit: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),
}

impl ModelError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ModelError::RateLimited { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::RateLimited { .. } => true,
            ModelError::Api { status, .. } => *status >= 500,
            ModelError::Network(_) => true,
            ModelError::Timeout(_) => true,
            ModelError::ContextWindowExceeded { .. } => false,
            ModelError::InvalidResponse(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
