//! Error taxonomy for the ingestion and retrieval pipeline

use std::time::Duration;

/// Result alias used throughout the crate
pub type Result<T, E = InboxError> = std::result::Result<T, E>;

/// Errors raised while turning a raw payload into a [`Message`](crate::models::Message)
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed mail payload: {0}")]
    Malformed(String),

    #[error("Could not determine a recipient address")]
    UnresolvableRecipient,
}

/// Errors surfaced by the pipeline
///
/// Each variant maps to one user-visible outcome, see [`InboxError::status_code`].
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    /// Bad input; never retried
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Malformed inbound mail; ingestion is abandoned
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Appending to the selected store failed
    #[error("Write failed: {0}")]
    Write(String),

    /// A remote call was rejected with "too many requests"
    #[error("Rate limited by remote store")]
    RateLimited { retry_after: Option<Duration> },

    /// Every attempt allowed by the retry budget was rate limited
    #[error("Rate limited after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    /// Delete target absent for the given address
    #[error("Message {id} not found for {address}")]
    NotFound { address: String, id: String },

    /// No usable storage binding in the execution context
    #[error("No storage backend available")]
    BackendUnavailable,

    /// Low-level storage or transport failure
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl InboxError {
    /// HTTP status a thin API layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            InboxError::Validation(_) => 400,
            InboxError::Parse(_) => 422,
            InboxError::NotFound { .. } => 404,
            InboxError::RateLimited { .. } | InboxError::RetriesExhausted { .. } => 429,
            InboxError::BackendUnavailable => 503,
            InboxError::Write(_) | InboxError::Storage(_) => 500,
        }
    }

    /// Whether the caller should back off and retry later
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            InboxError::RateLimited { .. } | InboxError::RetriesExhausted { .. }
        )
    }

    /// Retry-after hint in whole seconds (rounded up), for rate limited errors.
    ///
    /// Exhausted retries without a server hint still get a one second hint so
    /// clients always have something to back off on.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            InboxError::RateLimited { retry_after } => retry_after.map(ceil_secs),
            InboxError::RetriesExhausted { retry_after, .. } => {
                Some(retry_after.map(ceil_secs).unwrap_or(1).max(1))
            }
            _ => None,
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}
