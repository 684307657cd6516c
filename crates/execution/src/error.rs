//! Engine errors.
//!
//! Trajectory-level failures never show up here: they become FAILED or
//! TIMED_OUT records. An `EngineError` ends the run.

use evoloop_core::{IntegrityError, PolicyError};
use evoloop_evolution::{CheckpointError, SelectionError};
use evoloop_storage::StorageError;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that terminate a run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Pool invariant violated (logic defect)
    #[error("integrity error: {0}")]
    Integrity(IntegrityError),

    /// Pool or persistence failure
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Checkpoint could not be written or read
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Policy rejected at construction
    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    /// Next generation could not be planned
    #[error("selection failed: {0}")]
    Selection(#[from] SelectionError),

    /// Collaborator could not be set up
    #[error("engine setup failed: {0}")]
    Setup(String),

    /// Run request is malformed
    #[error("invalid run request: {0}")]
    InvalidRequest(String),
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Integrity(inner) => EngineError::Integrity(inner),
            other => EngineError::Storage(other),
        }
    }
}

impl From<IntegrityError> for EngineError {
    fn from(e: IntegrityError) -> Self {
        EngineError::Integrity(e)
    }
}

impl EngineError {
    /// Whether this is a logic defect rather than an environmental failure.
    pub fn is_integrity(&self) -> bool {
        matches!(self, EngineError::Integrity(_) | EngineError::Selection(SelectionError::Unsettled { .. }))
    }
}
