//! Operator outcome statistics derived from pool contents.

use evoloop_core::{OperatorKind, Trajectory, TrajectoryStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome counts for one operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorOutcomes {
    /// Trajectories produced
    pub attempts: usize,
    /// Approved by the safety layer
    pub approved: usize,
    /// Rejected by the safety layer
    pub rejected: usize,
    /// Execution or scoring failures
    pub failed: usize,
    /// Sandbox timeouts
    pub timed_out: usize,
    /// Mean CMP over scored trajectories
    pub mean_cmp: Option<f64>,
}

impl OperatorOutcomes {
    /// Fraction of attempts that failed or timed out.
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        (self.failed + self.timed_out) as f64 / self.attempts as f64
    }
}

/// Per-operator statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorStats {
    /// Outcomes keyed by operator
    pub by_operator: BTreeMap<OperatorKind, OperatorOutcomes>,
}

impl OperatorStats {
    /// Tally a set of trajectories.
    pub fn from_trajectories(trajectories: &[Trajectory]) -> Self {
        let mut by_operator: BTreeMap<OperatorKind, OperatorOutcomes> = BTreeMap::new();
        let mut cmp_sums: BTreeMap<OperatorKind, (f64, usize)> = BTreeMap::new();

        for t in trajectories {
            let entry = by_operator.entry(t.operator_used).or_default();
            entry.attempts += 1;
            match t.status {
                TrajectoryStatus::Approved => entry.approved += 1,
                TrajectoryStatus::Rejected => entry.rejected += 1,
                TrajectoryStatus::Failed => entry.failed += 1,
                TrajectoryStatus::TimedOut => entry.timed_out += 1,
                _ => {}
            }
            if let Some(cmp) = t.cmp_score {
                let sum = cmp_sums.entry(t.operator_used).or_insert((0.0, 0));
                sum.0 += cmp;
                sum.1 += 1;
            }
        }

        for (op, (sum, n)) in cmp_sums {
            if let Some(entry) = by_operator.get_mut(&op) {
                entry.mean_cmp = Some(sum / n as f64);
            }
        }

        Self { by_operator }
    }

    /// Outcomes for one operator (zeroes if never used).
    pub fn get(&self, op: OperatorKind) -> OperatorOutcomes {
        self.by_operator.get(&op).cloned().unwrap_or_default()
    }
}
