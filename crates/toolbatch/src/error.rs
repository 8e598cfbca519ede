//! Service-level errors for batch execution.
//!
//! Failures that can be localized to a single action or tool group never
//! surface here: they are written into the outcome array as structured
//! observations. [`BatchError`] covers the conditions that reject or abort a
//! whole batch, and maps one-to-one onto transport status codes.

use std::time::Duration;

use thiserror::Error;

/// An error that rejects or aborts an entire batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The request failed validation (mismatched parallel sequences).
    #[error("{0}")]
    InvalidRequest(String),
    /// The batch did not finish before the configured deadline.
    #[error("Request timeout after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),
    /// The admission gate was closed (service shutting down).
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl BatchError {
    /// Whether this error is the distinguished batch-level timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BatchError::Timeout(_))
    }
}
