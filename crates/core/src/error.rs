//! Integrity errors.
//!
//! These are programming errors: a caller asked the pool or the state
//! machine to do something that can only happen because of a logic defect.
//! They are never produced by environmental failures (sandbox, scoring),
//! and the orchestrator halts the run when it sees one.

use crate::id::TrajectoryId;
use crate::trajectory::TrajectoryStatus;

/// Result alias for integrity-checked operations.
pub type Result<T> = std::result::Result<T, IntegrityError>;

/// A violated invariant of the trajectory record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntegrityError {
    /// Status change not permitted by the state machine
    #[error("invalid transition for trajectory {id}: {from} -> {to}")]
    InvalidTransition {
        /// Trajectory being updated
        id: TrajectoryId,
        /// Current status
        from: TrajectoryStatus,
        /// Requested status
        to: TrajectoryStatus,
    },

    /// A parent referenced by a new trajectory is not in the pool
    #[error("trajectory {child} references missing parent {parent}")]
    MissingParent {
        /// Trajectory being inserted
        child: TrajectoryId,
        /// Parent that could not be found
        parent: TrajectoryId,
    },

    /// The same id was inserted twice
    #[error("trajectory {0} already exists")]
    DuplicateId(TrajectoryId),

    /// Update or lookup of an id the pool never saw
    #[error("trajectory {0} not found")]
    UnknownTrajectory(TrajectoryId),

    /// Lineage does not match the operator that produced the trajectory
    #[error("trajectory {id}: operator {operator} expects {expected} parent(s), got {actual}")]
    ParentArity {
        /// Trajectory being inserted
        id: TrajectoryId,
        /// Operator name
        operator: String,
        /// Parent count the operator requires
        expected: usize,
        /// Parent count supplied
        actual: usize,
    },
}
