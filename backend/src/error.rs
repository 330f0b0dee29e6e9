use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to intake callers (`submit` / `get_status`).
///
/// Scheduler faults never appear here; they only delay completion.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid priority {0:?}: expected HIGH, MEDIUM or LOW")]
    InvalidPriority(String),

    #[error("ingestion request not found: {0}")]
    NotFound(Uuid),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl IngestError {
    /// True for errors the caller can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidInput(_) | IngestError::InvalidPriority(_) | IngestError::NotFound(_)
        )
    }
}
