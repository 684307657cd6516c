//! Run outcome and per-iteration report.

use evoloop_core::{Checkpoint, RunId, Trajectory, TrajectoryStatus};
use evoloop_evolution::PlannedOperation;
use evoloop_storage::OperatorStats;
use serde::Serialize;

/// How the control loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Best score plateaued
    Converged,
    /// Wall-clock or cost budget ran out
    BudgetExhausted,
    /// Iteration cap reached
    MaxIterations,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Converged => "CONVERGED",
            RunStatus::BudgetExhausted => "BUDGET_EXHAUSTED",
            RunStatus::MaxIterations => "MAX_ITERATIONS",
        })
    }
}

/// What the run produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Promotion {
    /// The best approved trajectory was written as a checkpoint
    Promoted(Checkpoint),
    /// Nothing was approved; the best candidate is advisory only
    NoSafeCandidate {
        /// Best scored trajectory, if any scored
        advisory: Option<Trajectory>,
    },
    /// The best approved code is the code the run started from
    NoImprovement,
}

impl Promotion {
    /// The checkpoint, when one was written.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            Promotion::Promoted(c) => Some(c),
            _ => None,
        }
    }
}

/// Trajectory counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// JUDGED, not reviewed
    pub judged: usize,
    /// Held for review
    pub held: usize,
    /// APPROVED
    pub approved: usize,
    /// REJECTED
    pub rejected: usize,
    /// FAILED
    pub failed: usize,
    /// TIMED_OUT
    pub timed_out: usize,
    /// Anything else (not yet settled)
    pub other: usize,
}

impl StatusCounts {
    /// Count `trajectories` by status.
    pub fn tally<'a>(trajectories: impl IntoIterator<Item = &'a Trajectory>) -> Self {
        let mut c = Self::default();
        for t in trajectories {
            match t.status {
                TrajectoryStatus::Judged => c.judged += 1,
                TrajectoryStatus::SafetyReview => c.held += 1,
                TrajectoryStatus::Approved => c.approved += 1,
                TrajectoryStatus::Rejected => c.rejected += 1,
                TrajectoryStatus::Failed => c.failed += 1,
                TrajectoryStatus::TimedOut => c.timed_out += 1,
                _ => c.other += 1,
            }
        }
        c
    }
}

/// Summary of one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationSummary {
    /// 1-based iteration number
    pub iteration: u32,
    /// Generation executed in this iteration
    pub generation: u32,
    /// Best CMP within this generation
    pub best_cmp: Option<f64>,
    /// Best CMP of the run so far
    pub best_cmp_so_far: Option<f64>,
    /// Outcome counts for this generation
    pub counts: StatusCounts,
    /// Operators planned for the next generation (empty on the last iteration)
    pub plan: Vec<PlannedOperation>,
}

/// Result of [`crate::EvolutionEngine::run`].
#[derive(Debug, Clone, Serialize)]
pub struct EvolutionOutcome {
    /// Run identifier
    pub run_id: RunId,
    /// Agent evolved
    pub agent_name: String,
    /// Terminal status of the control loop
    pub status: RunStatus,
    /// Promotion result
    pub promotion: Promotion,
    /// Best trajectory seen across every iteration
    pub best: Option<Trajectory>,
    /// Iterations run
    pub iterations: u32,
    /// Per-iteration summaries
    pub history: Vec<IterationSummary>,
    /// Operator outcomes over the whole run
    pub operator_stats: OperatorStats,
    /// Checkpoint version the run started from, if warm-started
    pub warm_start_version: Option<u32>,
}
