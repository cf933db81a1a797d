use thiserror::Error;

/// All failure modes the engine can surface, per the error-kind table.
#[derive(Debug, Error)]
pub enum SpacesError {
    #[error("storage operation failed: {0}")]
    Storage(String),

    #[error("lock acquisition on {id} timed out after {timeout_ms}ms")]
    LockTimeout { id: String, timeout_ms: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("restore failed for {closed_space_id}: {reason}")]
    RestoreFailed {
        closed_space_id: String,
        reason: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type SpacesResult<T> = Result<T, SpacesError>;

impl From<std::io::Error> for SpacesError {
    fn from(e: std::io::Error) -> Self {
        SpacesError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SpacesError {
    fn from(e: serde_json::Error) -> Self {
        SpacesError::Storage(format!("serialization failed: {e}"))
    }
}
