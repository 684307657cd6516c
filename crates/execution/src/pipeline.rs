//! Per-trajectory evaluation: sandbox, benchmark, judge.
//!
//! A task works on an owned snapshot of its trajectory and never touches the
//! pool. It reports a [`Verdict`] that the engine turns into transitions.

use evoloop_core::{BenchmarkResult, ExecutionLimits, JudgeScore, RetryPolicy, SandboxResult, SandboxStatus, Trajectory, TrajectoryId};
use evoloop_quality::{Benchmark, Judge, JudgeContext};
use evoloop_sandbox::SandboxExecutor;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one trajectory in a batch.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// The sandbox could not run it, or killed it
    ExecutionFailed {
        /// Error text
        reason: String,
        /// Sandbox run, when there was one
        sandbox: Option<SandboxResult>,
    },
    /// Exceeded its wall-clock limit
    TimedOut {
        /// Sandbox run
        sandbox: SandboxResult,
    },
    /// Ran, but scoring failed
    ScoringFailed {
        /// Sandbox run
        sandbox: SandboxResult,
        /// Error text
        reason: String,
    },
    /// Ran and scored
    Judged {
        /// Sandbox run
        sandbox: SandboxResult,
        /// Judge output
        judge: JudgeScore,
        /// Benchmark output, when benchmarking is enabled
        benchmark: Option<BenchmarkResult>,
    },
}

impl Verdict {
    /// Sandbox time to charge against the budget.
    pub fn sandbox_time(&self) -> std::time::Duration {
        match self {
            Verdict::ExecutionFailed { sandbox, .. } => sandbox.as_ref().map(|s| s.execution_time).unwrap_or_default(),
            Verdict::TimedOut { sandbox } | Verdict::ScoringFailed { sandbox, .. } | Verdict::Judged { sandbox, .. } => {
                sandbox.execution_time
            }
        }
    }
}

/// Collaborators one evaluation needs. Cheap to clone into tasks.
#[derive(Clone)]
pub struct Pipeline {
    /// Sandbox executor
    pub sandbox: Arc<SandboxExecutor>,
    /// Benchmark runner and the suite to run, when enabled
    pub benchmark: Option<(Arc<dyn Benchmark>, String)>,
    /// Judge
    pub judge: Arc<dyn Judge>,
    /// Limits for the main sandbox run
    pub limits: ExecutionLimits,
    /// Retry policy for sandbox infrastructure errors
    pub retry: RetryPolicy,
}

impl Pipeline {
    /// Evaluate one trajectory snapshot.
    pub async fn evaluate(&self, candidate: Trajectory) -> (TrajectoryId, Verdict) {
        let id = candidate.id;
        (id, self.evaluate_inner(candidate).await)
    }

    async fn evaluate_inner(&self, mut candidate: Trajectory) -> Verdict {
        let run = match self.execute_with_retry(&candidate).await {
            Ok(run) => run,
            Err(reason) => return Verdict::ExecutionFailed { reason, sandbox: None },
        };

        match run.status {
            SandboxStatus::Timeout => return Verdict::TimedOut { sandbox: run },
            SandboxStatus::Killed => {
                return Verdict::ExecutionFailed {
                    reason: "killed by signal (resource limit or external kill)".to_string(),
                    sandbox: Some(run),
                }
            }
            SandboxStatus::Completed | SandboxStatus::Failed => {}
        }

        let benchmark = match &self.benchmark {
            Some((runner, suite_id)) => match runner.run(&candidate.code_artifact, suite_id).await {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(trajectory = %candidate.id, error = %e, "Benchmark failed");
                    return Verdict::ScoringFailed {
                        sandbox: run,
                        reason: format!("benchmark failed: {}", e),
                    };
                }
            },
            None => None,
        };

        candidate.sandbox_result = Some(run.clone());
        let context = JudgeContext {
            sandbox: Some(&run),
            benchmark: benchmark.as_ref(),
            limits: &self.limits,
        };
        match self.judge.score(&candidate, &context).await {
            Ok(judge) => {
                debug!(trajectory = %candidate.id, cmp = judge.cmp, "Candidate judged");
                Verdict::Judged { sandbox: run, judge, benchmark }
            }
            Err(e) => {
                warn!(trajectory = %candidate.id, error = %e, "Judge failed");
                Verdict::ScoringFailed {
                    sandbox: run,
                    reason: format!("judge failed: {}", e),
                }
            }
        }
    }

    async fn execute_with_retry(&self, candidate: &Trajectory) -> Result<SandboxResult, String> {
        let mut attempt = 0;
        loop {
            match self.sandbox.execute(candidate.code_artifact.as_str(), &self.limits).await {
                Ok(run) => return Ok(run),
                Err(e) if attempt < self.retry.sandbox_retries => {
                    attempt += 1;
                    warn!(trajectory = %candidate.id, attempt, error = %e, "Sandbox error, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(e) => {
                    warn!(trajectory = %candidate.id, error = %e, "Sandbox error");
                    return Err(e.to_string());
                }
            }
        }
    }
}
