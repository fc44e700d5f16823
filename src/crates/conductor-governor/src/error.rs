//! Error types for the rate-limit governor.

use thiserror::Error;

/// Result type for governor operations.
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Errors that can occur while gating dispatches.
#[derive(Debug, Error)]
pub enum GovernorError {
    /// Capacity is exhausted and the policy forbids blocking until reset.
    #[error("rate limit exhausted for {provider}/{model}; resets at {resets_at}")]
    Exhausted {
        provider: String,
        model: String,
        resets_at: String,
    },

    /// No provider client is registered for this provider name.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// An out-of-band status probe failed.
    #[error("status probe failed for {provider}/{model}: {message}")]
    ProbeFailed {
        provider: String,
        model: String,
        message: String,
    },

    /// Recording a snapshot to the execution log failed.
    #[error("snapshot store error: {0}")]
    Store(#[from] conductor_store::StoreError),
}
