//! Provider error types

use thiserror::Error;

/// Errors that can occur while fetching a trip
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Temporary failure; the same request may succeed later
    #[error("Provider temporarily unavailable ({status:?}): {message}")]
    Transient { status: Option<u16>, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Trip not found: {0}")]
    NotFound(String),

    #[error("Invalid provider response: {0}")]
    Invalid(String),
}

impl ProviderError {
    /// Check if retrying the request may help
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transient { .. } => true,
            ProviderError::Network(err) => !err.is_decode() && !err.is_builder(),
            ProviderError::NotFound(_) => false,
            ProviderError::Invalid(_) => false,
        }
    }
}

/// Check if an HTTP status code is worth retrying
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
}
