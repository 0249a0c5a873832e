//! Tracker error taxonomy

use thiserror::Error;

use crate::provider::ProviderError;

/// Errors that end a tracker invocation
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Fetching the trip failed; transient provider errors pass through untouched
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A trip stop referenced an unknown stop and recovery did not help
    #[error("Stop {stop_code} is not known to storage")]
    ReferentialIntegrity { stop_code: String },

    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// Broken invariant in the fetched data or the job payload
    #[error("Logic error: {0}")]
    Logic(String),

    #[error("Failed to enqueue continuation: {0}")]
    Queue(String),
}

impl TrackerError {
    /// Whether running the same job again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TrackerError::Provider(err) => err.is_transient(),
            TrackerError::ReferentialIntegrity { .. } => true,
            TrackerError::Persistence(_) => true,
            TrackerError::Logic(_) => false,
            TrackerError::Queue(_) => true,
        }
    }

    /// Short machine-readable kind, used in error reports
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::Provider(err) if err.is_transient() => "transient_provider",
            TrackerError::Provider(_) => "provider",
            TrackerError::ReferentialIntegrity { .. } => "referential_integrity",
            TrackerError::Persistence(_) => "persistence",
            TrackerError::Logic(_) => "logic",
            TrackerError::Queue(_) => "queue",
        }
    }
}
