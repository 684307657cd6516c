//! Trajectory model - one evolution attempt and its state machine.

use serde::{Deserialize, Serialize};
use crate::error::{IntegrityError, Result};
use crate::execution::SandboxResult;
use crate::id::{RunId, TrajectoryId};
use crate::safety::SafetyReport;
use crate::score::JudgeScore;
use crate::Time;

/// The transformation that produced a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    /// Initial candidate (no parents)
    Seed,
    /// Alternative strategy for a low-scoring parent
    Revision,
    /// Merge of two high-scoring parents
    Recombination,
    /// Targeted optimization of a medium-scoring parent
    Refinement,
}

impl OperatorKind {
    /// All operator kinds, seed first.
    pub const ALL: [OperatorKind; 4] = [
        OperatorKind::Seed,
        OperatorKind::Revision,
        OperatorKind::Recombination,
        OperatorKind::Refinement,
    ];

    /// Number of parents a trajectory produced by this operator must have.
    pub fn parent_count(self) -> usize {
        match self {
            OperatorKind::Seed => 0,
            OperatorKind::Revision | OperatorKind::Refinement => 1,
            OperatorKind::Recombination => 2,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            OperatorKind::Seed => "seed",
            OperatorKind::Revision => "revision",
            OperatorKind::Recombination => "recombination",
            OperatorKind::Refinement => "refinement",
        }
    }
}

impl std::fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperatorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "seed" => Ok(OperatorKind::Seed),
            "revision" => Ok(OperatorKind::Revision),
            "recombination" => Ok(OperatorKind::Recombination),
            "refinement" => Ok(OperatorKind::Refinement),
            other => Err(format!("unknown operator: {other}")),
        }
    }
}

/// Trajectory lifecycle.
///
/// ```text
/// PROPOSED → EXECUTING → EXECUTED → JUDGED → SAFETY_REVIEW → APPROVED | REJECTED
///     │          ├──────────┴──────────→ FAILED
///     └──────────┴→ TIMED_OUT (from EXECUTING only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrajectoryStatus {
    /// Created by an operator, not yet run
    Proposed,
    /// Sandbox run in progress
    Executing,
    /// Sandbox run completed without a fatal error
    Executed,
    /// Judge and benchmark have both produced scores
    Judged,
    /// Submitted to the safety layer
    SafetyReview,
    /// Safety layer approved promotion
    Approved,
    /// Safety layer rejected promotion
    Rejected,
    /// No usable result (execution or scoring error)
    Failed,
    /// Sandbox wall-clock timeout
    TimedOut,
}

impl TrajectoryStatus {
    /// Whether this status can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrajectoryStatus::Approved
                | TrajectoryStatus::Rejected
                | TrajectoryStatus::Failed
                | TrajectoryStatus::TimedOut
        )
    }

    /// Whether a batch task holding this trajectory has finished its work.
    ///
    /// Operator selection for the next iteration only runs once every
    /// trajectory of the current batch is settled.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            TrajectoryStatus::Executed
                | TrajectoryStatus::Judged
                | TrajectoryStatus::Failed
                | TrajectoryStatus::TimedOut
        ) || self.is_terminal()
            || self == TrajectoryStatus::SafetyReview
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    pub fn can_transition_to(self, next: TrajectoryStatus) -> bool {
        use TrajectoryStatus::*;
        matches!(
            (self, next),
            (Proposed, Executing)
                | (Proposed, Failed)
                | (Executing, Executed)
                | (Executing, Failed)
                | (Executing, TimedOut)
                | (Executed, Judged)
                | (Executed, Failed)
                | (Judged, SafetyReview)
                // Re-submission after a hold_for_review.
                | (SafetyReview, SafetyReview)
                | (SafetyReview, Approved)
                | (SafetyReview, Rejected)
        )
    }

    /// Stable name.
    pub fn as_str(self) -> &'static str {
        match self {
            TrajectoryStatus::Proposed => "PROPOSED",
            TrajectoryStatus::Executing => "EXECUTING",
            TrajectoryStatus::Executed => "EXECUTED",
            TrajectoryStatus::Judged => "JUDGED",
            TrajectoryStatus::SafetyReview => "SAFETY_REVIEW",
            TrajectoryStatus::Approved => "APPROVED",
            TrajectoryStatus::Rejected => "REJECTED",
            TrajectoryStatus::Failed => "FAILED",
            TrajectoryStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl std::fmt::Display for TrajectoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate source code. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeArtifact(String);

impl CodeArtifact {
    /// Wrap source text.
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    /// Borrow the source text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the artifact is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for CodeArtifact {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One evolution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Unique identifier
    pub id: TrajectoryId,

    /// Run that produced this trajectory
    pub run_id: RunId,

    /// Agent whose code is being evolved
    pub agent_name: String,

    /// Lineage (0, 1 or 2 parents)
    pub parent_ids: Vec<TrajectoryId>,

    /// Generation number (seed population is 0)
    pub generation: u32,

    /// Operator that produced the code
    pub operator_used: OperatorKind,

    /// Candidate source
    pub code_artifact: CodeArtifact,

    /// Operator's explanation of the transformation
    pub rationale: String,

    /// Current status
    pub status: TrajectoryStatus,

    /// Composite judge score
    pub cmp_score: Option<f64>,

    /// Raw benchmark score
    pub benchmark_score: Option<f64>,

    /// Full judge output
    pub judge_score: Option<JudgeScore>,

    /// Sandbox run
    pub sandbox_result: Option<SandboxResult>,

    /// Why the trajectory failed, if it did
    pub failure_reason: Option<String>,

    /// Every safety review, oldest first
    pub safety_reports: Vec<SafetyReport>,

    /// Creation time
    pub created_at: Time,

    /// Last status change
    pub updated_at: Time,

    /// Soft-pruning marker
    pub archived_at: Option<Time>,
}

impl Trajectory {
    /// Create a PROPOSED trajectory.
    pub fn propose(
        run_id: RunId,
        agent_name: impl Into<String>,
        generation: u32,
        operator_used: OperatorKind,
        parent_ids: Vec<TrajectoryId>,
        code_artifact: CodeArtifact,
        rationale: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: TrajectoryId::new(),
            run_id,
            agent_name: agent_name.into(),
            parent_ids,
            generation,
            operator_used,
            code_artifact,
            rationale: rationale.into(),
            status: TrajectoryStatus::Proposed,
            cmp_score: None,
            benchmark_score: None,
            judge_score: None,
            sandbox_result: None,
            failure_reason: None,
            safety_reports: Vec::new(),
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// Check that lineage matches the operator.
    pub fn check_lineage(&self) -> Result<()> {
        let expected = self.operator_used.parent_count();
        if self.parent_ids.len() != expected {
            return Err(IntegrityError::ParentArity {
                id: self.id,
                operator: self.operator_used.to_string(),
                expected,
                actual: self.parent_ids.len(),
            });
        }
        Ok(())
    }

    /// Move to `next` and merge result fields.
    ///
    /// Fields left `None` in `fields` keep their current value.
    pub fn transition(&mut self, next: TrajectoryStatus, fields: ResultFields) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(IntegrityError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        fields.merge_into(self);
        self.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Whether the record is excluded from default queries.
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// The most recent safety review, if any.
    pub fn latest_safety_report(&self) -> Option<&SafetyReport> {
        self.safety_reports.last()
    }
}

/// Result fields attached to a status update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFields {
    /// Composite judge score
    pub cmp_score: Option<f64>,
    /// Raw benchmark score
    pub benchmark_score: Option<f64>,
    /// Full judge output
    pub judge_score: Option<JudgeScore>,
    /// Sandbox run
    pub sandbox_result: Option<SandboxResult>,
    /// Failure description
    pub failure_reason: Option<String>,
}

impl ResultFields {
    /// No field changes.
    pub fn none() -> Self {
        Self::default()
    }

    /// Only a failure reason.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Only a sandbox result.
    pub fn sandbox(result: SandboxResult) -> Self {
        Self {
            sandbox_result: Some(result),
            ..Self::default()
        }
    }

    /// Judge and benchmark scores.
    pub fn scores(judge: JudgeScore, benchmark_score: Option<f64>) -> Self {
        Self {
            cmp_score: Some(judge.cmp),
            benchmark_score,
            judge_score: Some(judge),
            ..Self::default()
        }
    }

    fn merge_into(self, t: &mut Trajectory) {
        if let Some(v) = self.cmp_score {
            t.cmp_score = Some(v);
        }
        if let Some(v) = self.benchmark_score {
            t.benchmark_score = Some(v);
        }
        if let Some(v) = self.judge_score {
            t.judge_score = Some(v);
        }
        if let Some(v) = self.sandbox_result {
            t.sandbox_result = Some(v);
        }
        if let Some(v) = self.failure_reason {
            t.failure_reason = Some(v);
        }
    }
}

/// Filter for querying the trajectory pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectoryFilter {
    /// Restrict to one run
    pub run_id: Option<RunId>,
    /// Restrict to one agent
    pub agent_name: Option<String>,
    /// Restrict to one generation
    pub generation: Option<u32>,
    /// Restrict to one operator
    pub operator: Option<OperatorKind>,
    /// Restrict to these statuses
    pub status: Option<Vec<TrajectoryStatus>>,
    /// Minimum CMP score (unscored trajectories never match)
    pub min_cmp: Option<f64>,
    /// Include archived records
    pub include_archived: bool,
}

impl TrajectoryFilter {
    /// Whether `t` passes every set criterion.
    pub fn matches(&self, t: &Trajectory) -> bool {
        if !self.include_archived && t.is_archived() {
            return false;
        }
        if let Some(run) = self.run_id {
            if t.run_id != run {
                return false;
            }
        }
        if let Some(agent) = &self.agent_name {
            if &t.agent_name != agent {
                return false;
            }
        }
        if let Some(generation) = self.generation {
            if t.generation != generation {
                return false;
            }
        }
        if let Some(op) = self.operator {
            if t.operator_used != op {
                return false;
            }
        }
        if let Some(statuses) = &self.status {
            if !statuses.contains(&t.status) {
                return false;
            }
        }
        if let Some(min) = self.min_cmp {
            match t.cmp_score {
                Some(score) if score >= min => {}
                _ => return false,
            }
        }
        true
    }
}
