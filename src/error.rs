use thiserror::Error;

/// Caller-facing error taxonomy for the lifecycle engine and advisor.
///
/// `ClockAnomaly` is never returned from an operation: a negative computed
/// duration clamps to zero and the variant is only logged, so the
/// user-visible flow keeps going.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("storage unavailable: {0}")]
    StoreUnavailable(#[from] anyhow::Error),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("clock anomaly on session {session_id}: start time is {skew_secs}s in the future")]
    ClockAnomaly { session_id: String, skew_secs: i64 },
}

impl EngineError {
    pub fn invariant(message: impl Into<String>) -> Self {
        EngineError::InvariantViolation(message.into())
    }
}
