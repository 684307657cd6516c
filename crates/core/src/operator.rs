//! Operator output.

use serde::{Deserialize, Serialize};
use crate::id::TrajectoryId;
use crate::trajectory::{CodeArtifact, OperatorKind};

/// Output of applying an operator to its parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorResult {
    /// New candidate code
    pub code_artifact: CodeArtifact,
    /// Operator that produced it
    pub operator: OperatorKind,
    /// Explanation of the transformation (audit + selection heuristics)
    pub rationale: String,
    /// Parents the operator consumed
    pub parent_ids: Vec<TrajectoryId>,
}
