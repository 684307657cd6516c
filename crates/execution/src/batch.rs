//! Bounded-parallelism batch of evaluations.

use crate::budget::{BudgetTracker, Exhaustion};
use crate::pipeline::{Pipeline, Verdict};
use evoloop_core::{Trajectory, TrajectoryId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Result of one batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Finished evaluations, in completion order
    pub completed: Vec<(TrajectoryId, Verdict)>,
    /// Evaluations cancelled because the budget ran out
    pub cancelled: Vec<TrajectoryId>,
    /// Set when the budget ran out during the batch
    pub exhaustion: Option<Exhaustion>,
}

/// Evaluate `candidates` with at most `parallelism` running at once.
///
/// Returns when every task has finished. A sandbox timeout only affects its
/// own task. When the budget runs out every outstanding task is aborted and
/// listed in [`BatchReport::cancelled`].
pub async fn run_batch(
    pipeline: &Pipeline,
    candidates: Vec<Trajectory>,
    parallelism: usize,
    budget: &mut BudgetTracker,
) -> BatchReport {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut pending: BTreeSet<TrajectoryId> = candidates.iter().map(|t| t.id).collect();
    let mut tasks = JoinSet::new();

    for candidate in candidates {
        let pipeline = pipeline.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            pipeline.evaluate(candidate).await
        });
    }
    debug!(tasks = pending.len(), parallelism, "Batch started");

    let mut report = BatchReport::default();
    let deadline = budget.deadline();
    loop {
        let joined = match deadline {
            Some(at) => tokio::select! {
                joined = tasks.join_next() => joined,
                _ = tokio::time::sleep_until(at) => {
                    report.exhaustion = Some(Exhaustion::WallClock);
                    break;
                }
            },
            None => tasks.join_next().await,
        };
        let Some(joined) = joined else { break };

        match joined {
            Ok((id, verdict)) => {
                pending.remove(&id);
                budget.charge_sandbox(verdict.sandbox_time());
                report.completed.push((id, verdict));
                if let Some(exhaustion) = budget.exhausted() {
                    report.exhaustion = Some(exhaustion);
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Evaluation task ended abnormally"),
        }
    }

    if report.exhaustion.is_some() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        report.cancelled = pending.into_iter().collect();
        warn!(cancelled = report.cancelled.len(), "Batch cancelled: budget exhausted");
    } else {
        // Tasks that panicked never reported back.
        for id in pending {
            report.completed.push((
                id,
                Verdict::ExecutionFailed {
                    reason: "evaluation task panicked".to_string(),
                    sandbox: None,
                },
            ));
        }
    }
    report
}
