//! Score-banded operator selection.

use evoloop_core::{ranking, OperatorKind, OperatorThresholds, Trajectory, TrajectoryId};
use serde::Serialize;

/// Errors planning the next generation.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    /// A trajectory of the generation is still in flight
    #[error("trajectory {id} is not settled ({status})")]
    Unsettled {
        /// Trajectory
        id: TrajectoryId,
        /// Its status
        status: evoloop_core::TrajectoryStatus,
    },

    /// Nothing to plan from
    #[error("cannot plan from an empty generation")]
    EmptyGeneration,
}

/// One slot of the next iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedOperation {
    /// Operator to apply
    pub operator: OperatorKind,
    /// Parents, in operator order
    pub parents: Vec<TrajectoryId>,
}

/// Picks operators from parent scores.
#[derive(Debug, Clone, Copy)]
pub struct OperatorSelector {
    thresholds: OperatorThresholds,
}

impl OperatorSelector {
    /// Create a selector with `thresholds`.
    pub fn new(thresholds: OperatorThresholds) -> Self {
        Self { thresholds }
    }

    /// Selection score: CMP, with unscored (failed, timed out) counting as zero.
    pub fn score_of(t: &Trajectory) -> f64 {
        t.cmp_score.unwrap_or(0.0)
    }

    /// Operator for a parent scoring `cmp`, given how many parents in the
    /// generation qualify for recombination.
    pub fn select(&self, cmp: f64, qualifying_parents: usize) -> OperatorKind {
        if cmp < self.thresholds.low_threshold {
            OperatorKind::Revision
        } else if cmp >= self.thresholds.high_threshold && qualifying_parents >= 2 {
            OperatorKind::Recombination
        } else {
            OperatorKind::Refinement
        }
    }

    /// Plan `slots` operations from a fully settled generation.
    ///
    /// Parents are taken best-first, cycling when there are more slots than
    /// trajectories. A recombination pairs the parent with the best other
    /// qualifying trajectory.
    pub fn plan(&self, generation: &[Trajectory], slots: usize) -> Result<Vec<PlannedOperation>, SelectionError> {
        if let Some(t) = generation.iter().find(|t| !t.status.is_settled()) {
            return Err(SelectionError::Unsettled {
                id: t.id,
                status: t.status,
            });
        }
        if generation.is_empty() {
            return Err(SelectionError::EmptyGeneration);
        }

        let mut ranked = generation.to_vec();
        ranking::sort_best_first(&mut ranked);

        let qualifying: Vec<&Trajectory> = ranked
            .iter()
            .filter(|t| t.cmp_score.is_some() && Self::score_of(t) >= self.thresholds.high_threshold)
            .collect();

        let mut plan = Vec::with_capacity(slots);
        for slot in 0..slots {
            let parent = &ranked[slot % ranked.len()];
            let operator = self.select(Self::score_of(parent), qualifying.len());
            let parents = match operator {
                OperatorKind::Recombination => {
                    let partner = qualifying.iter().find(|q| q.id != parent.id);
                    match partner {
                        Some(p) => vec![parent.id, p.id],
                        None => {
                            plan.push(PlannedOperation {
                                operator: OperatorKind::Refinement,
                                parents: vec![parent.id],
                            });
                            continue;
                        }
                    }
                }
                _ => vec![parent.id],
            };
            plan.push(PlannedOperation { operator, parents });
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoloop_core::{CodeArtifact, RunId, TrajectoryStatus};

    fn settled(cmp: Option<f64>, status: TrajectoryStatus) -> Trajectory {
        let mut t = Trajectory::propose(RunId::new(), "agent", 1, OperatorKind::Seed, vec![], CodeArtifact::new("x"), "seed");
        t.cmp_score = cmp;
        t.status = status;
        t
    }

    fn selector() -> OperatorSelector {
        OperatorSelector::new(OperatorThresholds::default())
    }

    #[test]
    fn test_two_high_parents_recombine() {
        let generation = vec![
            settled(Some(0.92), TrajectoryStatus::Judged),
            settled(Some(0.88), TrajectoryStatus::Judged),
        ];
        let plan = selector().plan(&generation, 1).unwrap();
        assert_eq!(plan[0].operator, OperatorKind::Recombination);
        assert_eq!(plan[0].parents, vec![generation[0].id, generation[1].id]);
    }

    #[test]
    fn test_low_parent_revised() {
        let generation = vec![settled(Some(0.3), TrajectoryStatus::Judged)];
        let plan = selector().plan(&generation, 1).unwrap();
        assert_eq!(plan[0].operator, OperatorKind::Revision);
    }

    #[test]
    fn test_single_high_parent_falls_back_to_refinement() {
        let generation = vec![
            settled(Some(0.9), TrajectoryStatus::Judged),
            settled(Some(0.6), TrajectoryStatus::Judged),
        ];
        let plan = selector().plan(&generation, 2).unwrap();
        assert_eq!(plan[0].operator, OperatorKind::Refinement);
        assert_eq!(plan[1].operator, OperatorKind::Refinement);
    }

    #[test]
    fn test_failures_count_as_zero() {
        let generation = vec![
            settled(None, TrajectoryStatus::TimedOut),
            settled(None, TrajectoryStatus::Failed),
        ];
        let plan = selector().plan(&generation, 3).unwrap();
        assert!(plan.iter().all(|p| p.operator == OperatorKind::Revision));
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_unsettled_generation_refused() {
        let generation = vec![
            settled(Some(0.9), TrajectoryStatus::Judged),
            settled(None, TrajectoryStatus::Executing),
        ];
        assert!(matches!(selector().plan(&generation, 1), Err(SelectionError::Unsettled { .. })));
        assert!(matches!(selector().plan(&[], 1), Err(SelectionError::EmptyGeneration)));
    }

    #[test]
    fn test_select_bands() {
        let s = selector();
        assert_eq!(s.select(0.39, 5), OperatorKind::Revision);
        assert_eq!(s.select(0.4, 5), OperatorKind::Refinement);
        assert_eq!(s.select(0.8, 2), OperatorKind::Recombination);
        assert_eq!(s.select(0.8, 1), OperatorKind::Refinement);
    }
}
