//! The evolution engine - runs the control loop.

use crate::batch::run_batch;
use crate::budget::{Budget, BudgetTracker, Exhaustion};
use crate::convergence::PlateauDetector;
use crate::error::{EngineError, Result};
use crate::outcome::{EvolutionOutcome, IterationSummary, Promotion, RunStatus, StatusCounts};
use crate::pipeline::{Pipeline, Verdict};
use evoloop_core::{
    ranking, BenchmarkResult, Checkpoint, CheckpointMetrics, CodeArtifact, EvolutionPolicy,
    OperatorKind, ResultFields, RunId, SafetyDecision, Trajectory, TrajectoryFilter, TrajectoryId,
    TrajectoryStatus,
};
use evoloop_evolution::{
    CalibrationRecord, CalibrationStore, CheckpointStore, CodeSynthesizer, OperatorSelector,
    OperatorSet, PlannedOperation,
};
use evoloop_quality::{Benchmark, HeuristicJudge, Judge, PromotionApproval, RuleBasedSafetyLayer, SafetyLayer};
use evoloop_sandbox::SandboxExecutor;
use evoloop_storage::{KeyValueStore, TrajectoryPool};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Collaborators injected into the engine.
pub struct Collaborators {
    /// Sandbox executor
    pub sandbox: Arc<SandboxExecutor>,
    /// Judge
    pub judge: Arc<dyn Judge>,
    /// Safety layer
    pub safety: Arc<dyn SafetyLayer>,
    /// Code-synthesis collaborator
    pub synthesizer: Arc<dyn CodeSynthesizer>,
    /// Persistence for checkpoints and calibration
    pub store: Arc<dyn KeyValueStore>,
    /// Benchmark runner, used when the benchmark capability is on
    pub benchmark: Option<Arc<dyn Benchmark>>,
}

/// What to evolve.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Agent whose code is evolved
    pub agent_name: String,
    /// Problem statement handed to the synthesizer
    pub problem_description: String,
    /// Initial candidate, used when no checkpoint qualifies
    pub seed_code: CodeArtifact,
    /// Benchmark suite to score against
    pub suite_id: Option<String>,
}

impl RunRequest {
    /// Create a request without a benchmark suite.
    pub fn new(agent_name: impl Into<String>, problem_description: impl Into<String>, seed_code: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            problem_description: problem_description.into(),
            seed_code: CodeArtifact::new(seed_code),
            suite_id: None,
        }
    }

    /// Score against `suite_id`.
    pub fn with_suite(mut self, suite_id: impl Into<String>) -> Self {
        self.suite_id = Some(suite_id.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.agent_name.is_empty() || self.agent_name.contains('/') {
            return Err(EngineError::InvalidRequest(format!("invalid agent name: {:?}", self.agent_name)));
        }
        Ok(())
    }
}

/// Trajectories of one generation.
struct Generation {
    number: u32,
    ids: Vec<TrajectoryId>,
    exhausted: Option<Exhaustion>,
}

/// Bookkeeping for one run.
struct RunState {
    run_id: RunId,
    agent_name: String,
    approvals: HashMap<TrajectoryId, PromotionApproval>,
    benchmarks: HashMap<TrajectoryId, BenchmarkResult>,
    best: Option<Trajectory>,
}

impl RunState {
    fn new(run_id: RunId, agent_name: &str) -> Self {
        Self {
            run_id,
            agent_name: agent_name.to_string(),
            approvals: HashMap::new(),
            benchmarks: HashMap::new(),
            best: None,
        }
    }

    /// Fold a settled generation into the run's best.
    fn observe(&mut self, records: &[Trajectory]) -> Option<f64> {
        let generation_best = ranking::best(records.iter().filter(|t| t.cmp_score.is_some()));
        if let Some(candidate) = generation_best {
            let better = match &self.best {
                Some(current) => ranking::compare(candidate, current).is_lt(),
                None => true,
            };
            if better {
                self.best = Some(candidate.clone());
            }
        }
        generation_best.and_then(|t| t.cmp_score)
    }

    fn best_cmp(&self) -> Option<f64> {
        self.best.as_ref().and_then(|t| t.cmp_score)
    }
}

/// The evolution engine.
///
/// Runs the control loop:
/// ```text
/// INIT → GENERATE → EXECUTE → SCORE → SELECT_OPERATOR → MUTATE → (EXECUTE ...)
///   → CONVERGED | BUDGET_EXHAUSTED | MAX_ITERATIONS
/// ```
///
/// The engine owns the pool and is its only writer. Batch tasks work on
/// snapshots and hand their results back by value.
pub struct EvolutionEngine<P: TrajectoryPool> {
    pool: P,
    policy: EvolutionPolicy,
    sandbox: Arc<SandboxExecutor>,
    judge: Arc<dyn Judge>,
    safety: Arc<dyn SafetyLayer>,
    synthesizer: Arc<dyn CodeSynthesizer>,
    benchmark: Option<Arc<dyn Benchmark>>,
    syntax_precheck: bool,
    warm_start: bool,
    selector: OperatorSelector,
    checkpoints: CheckpointStore,
    calibration: CalibrationStore,
}

impl<P: TrajectoryPool> EvolutionEngine<P> {
    /// Create an engine. Capability flags are resolved here, once.
    pub fn new(pool: P, policy: EvolutionPolicy, collaborators: Collaborators) -> Result<Self> {
        policy.validate()?;
        let caps = policy.capabilities;

        let benchmark = match (caps.benchmark, collaborators.benchmark) {
            (true, Some(runner)) => Some(runner),
            (true, None) => {
                warn!("Benchmark capability enabled without a runner; benchmarking disabled");
                None
            }
            (false, _) => None,
        };
        info!(
            benchmark = benchmark.is_some(),
            syntax_precheck = caps.syntax_precheck,
            warm_start = caps.warm_start,
            static_safety_scan = caps.static_safety_scan,
            sandbox = collaborators.sandbox.backend_name(),
            "Capabilities resolved"
        );

        Ok(Self {
            pool,
            selector: OperatorSelector::new(policy.operators),
            sandbox: collaborators.sandbox,
            judge: collaborators.judge,
            safety: collaborators.safety,
            synthesizer: collaborators.synthesizer,
            benchmark,
            syntax_precheck: caps.syntax_precheck,
            warm_start: caps.warm_start,
            checkpoints: CheckpointStore::new(collaborators.store.clone()),
            calibration: CalibrationStore::new(collaborators.store),
            policy,
        })
    }

    /// Create an engine with the built-in judge and safety layer.
    pub fn with_defaults(
        pool: P,
        policy: EvolutionPolicy,
        sandbox: Arc<SandboxExecutor>,
        synthesizer: Arc<dyn CodeSynthesizer>,
        store: Arc<dyn KeyValueStore>,
        benchmark: Option<Arc<dyn Benchmark>>,
    ) -> Result<Self> {
        let judge = HeuristicJudge::from_policy(&policy.judge).map_err(|e| EngineError::Setup(e.to_string()))?;
        let safety = RuleBasedSafetyLayer::new(policy.safety, policy.capabilities.static_safety_scan);
        Self::new(
            pool,
            policy,
            Collaborators {
                sandbox,
                judge: Arc::new(judge),
                safety: Arc::new(safety),
                synthesizer,
                store,
                benchmark,
            },
        )
    }

    /// The trajectory pool.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Consume the engine, returning the pool.
    pub fn into_pool(self) -> P {
        self.pool
    }

    /// Policy in force.
    pub fn policy(&self) -> &EvolutionPolicy {
        &self.policy
    }

    /// Checkpoint store.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Calibration store.
    pub fn calibration(&self) -> &CalibrationStore {
        &self.calibration
    }

    /// Run one evolution.
    ///
    /// Trajectory-level failures are recorded and the run goes on. An `Err`
    /// means the run itself failed; integrity errors always end up here.
    pub async fn run(&mut self, request: RunRequest) -> Result<EvolutionOutcome> {
        request.validate()?;
        let run_id = RunId::new();
        let result = self.run_inner(run_id, &request).await;
        if let Err(e) = &result {
            if e.is_integrity() {
                error!(run = %run_id, error = %e, "Run halted by integrity error");
            } else {
                error!(run = %run_id, error = %e, "Run failed");
            }
        }
        result
    }

    async fn run_inner(&mut self, run_id: RunId, request: &RunRequest) -> Result<EvolutionOutcome> {
        let orchestration = self.policy.orchestration;
        let mut budget = BudgetTracker::start(Budget::from(&self.policy.budget));
        let mut state = RunState::new(run_id, &request.agent_name);
        let operators = OperatorSet::new(self.synthesizer.clone(), request.problem_description.clone());
        let pipeline = Pipeline {
            sandbox: self.sandbox.clone(),
            benchmark: match (&self.benchmark, &request.suite_id) {
                (Some(runner), Some(suite)) => Some((runner.clone(), suite.clone())),
                _ => None,
            },
            judge: self.judge.clone(),
            limits: self.policy.sandbox.clone(),
            retry: self.policy.retry,
        };
        info!(run = %run_id, agent = %request.agent_name, suite = ?request.suite_id, "Evolution run started");

        // INIT
        let warm = self.warm_start_checkpoint(&request.agent_name).await;
        let (seed_code, seed_rationale) = match &warm {
            Some(cp) => (cp.code_artifact.clone(), format!("warm start from checkpoint v{}", cp.version)),
            None => (request.seed_code.clone(), "initial candidate".to_string()),
        };
        let baseline_cmp = warm.as_ref().map(|cp| cp.metrics.cmp_score);

        // GENERATE
        let mut current = self
            .generate_seed(&mut state, &operators, seed_code, seed_rationale, &mut budget)
            .await?;
        let seed_id = current.ids.first().copied();

        let mut plateau = PlateauDetector::new(orchestration.plateau_epsilon, orchestration.plateau_window);
        let mut history: Vec<IterationSummary> = Vec::new();
        let mut status = RunStatus::MaxIterations;
        let mut iterations = 0;

        for iteration in 1..=orchestration.max_iterations {
            iterations = iteration;

            // EXECUTE + SCORE
            let exhausted = match current.exhausted {
                Some(e) => {
                    self.cancel_proposed(&current.ids).await?;
                    Some(e)
                }
                None => self.execute_generation(&mut state, &pipeline, &current.ids, &mut budget).await?,
            };
            if exhausted.is_none() {
                self.review_generation(&mut state, &current.ids, baseline_cmp).await?;
            }

            let records = self.records(&current.ids).await?;
            let generation_best = state.observe(&records);
            let counts = StatusCounts::tally(&records);
            info!(
                run = %run_id,
                iteration,
                generation = current.number,
                best_cmp = ?generation_best,
                best_so_far = ?state.best_cmp(),
                approved = counts.approved,
                failed = counts.failed,
                timed_out = counts.timed_out,
                "Iteration complete"
            );
            history.push(IterationSummary {
                iteration,
                generation: current.number,
                best_cmp: generation_best,
                best_cmp_so_far: state.best_cmp(),
                counts,
                plan: Vec::new(),
            });

            if let Some(e) = exhausted {
                warn!(run = %run_id, reason = %e, "Budget exhausted");
                status = RunStatus::BudgetExhausted;
                break;
            }
            if plateau.observe(state.best_cmp()) {
                status = RunStatus::Converged;
                break;
            }
            if iteration == orchestration.max_iterations {
                break;
            }
            if let Some(e) = budget.exhausted() {
                warn!(run = %run_id, reason = %e, "Budget exhausted");
                status = RunStatus::BudgetExhausted;
                break;
            }

            // SELECT_OPERATOR
            let mut parents = records;
            if let Some(best) = &state.best {
                if !parents.iter().any(|t| t.id == best.id) {
                    parents.push(best.clone());
                }
            }
            let plan = self.selector.plan(&parents, orchestration.trajectories_per_iteration)?;
            if let Some(summary) = history.last_mut() {
                summary.plan = plan.clone();
            }
            if current.number > 0 {
                let archived = self.pool.archive_generation(run_id, current.number - 1).await?;
                debug!(generation = current.number - 1, archived, "Generation archived");
            }

            // MUTATE
            current = self
                .mutate(&mut state, &operators, &parents, &plan, current.number + 1, &mut budget)
                .await?;
        }

        let promotion = self.promote(&state, warm.as_ref(), iterations).await?;

        if let Some(cp) = &warm {
            let seed_cmp = match seed_id {
                Some(id) => self.pool.get(id).await?.and_then(|t| t.cmp_score),
                None => None,
            };
            let record = CalibrationRecord::new(
                run_id,
                &request.agent_name,
                Some(cp.quality_tier),
                seed_cmp,
                iterations,
                orchestration.max_iterations,
            );
            if let Err(e) = self.calibration.record(&record).await {
                warn!(run = %run_id, error = %e, "Calibration record not saved");
            }
        }

        let operator_stats = self
            .pool
            .operator_stats(&TrajectoryFilter {
                run_id: Some(run_id),
                include_archived: true,
                ..Default::default()
            })
            .await?;

        info!(
            run = %run_id,
            %status,
            iterations,
            best_cmp = ?state.best_cmp(),
            promoted = ?promotion.checkpoint().map(|c| c.version),
            spent = budget.spent(),
            "Evolution run finished"
        );

        Ok(EvolutionOutcome {
            run_id,
            agent_name: request.agent_name.clone(),
            status,
            promotion,
            best: state.best,
            iterations,
            history,
            operator_stats,
            warm_start_version: warm.map(|cp| cp.version),
        })
    }

    async fn warm_start_checkpoint(&self, agent_name: &str) -> Option<Checkpoint> {
        if !self.warm_start {
            return None;
        }
        let min_tier = self.policy.warm_start.min_quality_tier;
        match self.checkpoints.best_checkpoint(agent_name, min_tier).await {
            Ok(Some(cp)) => {
                info!(agent = agent_name, version = cp.version, tier = %cp.quality_tier, "Warm start");
                Some(cp)
            }
            Ok(None) => {
                debug!(agent = agent_name, %min_tier, "No qualifying checkpoint, cold start");
                None
            }
            Err(e) => {
                warn!(agent = agent_name, error = %e, "Checkpoint lookup failed, cold start");
                None
            }
        }
    }

    async fn generate_seed(
        &mut self,
        state: &mut RunState,
        operators: &OperatorSet,
        seed_code: CodeArtifact,
        seed_rationale: String,
        budget: &mut BudgetTracker,
    ) -> Result<Generation> {
        let mut generation = Generation {
            number: 0,
            ids: Vec::new(),
            exhausted: None,
        };
        let seed = Trajectory::propose(
            state.run_id,
            &state.agent_name,
            0,
            OperatorKind::Seed,
            Vec::new(),
            seed_code.clone(),
            seed_rationale,
        );
        generation.ids.push(self.insert(seed).await?);

        for variant in 1..self.policy.orchestration.trajectories_per_iteration {
            if let Some(e) = budget.exhausted() {
                generation.exhausted = Some(e);
                break;
            }
            budget.charge_synthesis();
            let result = match within_deadline(budget.deadline(), operators.seed(&seed_code, variant)).await {
                Some(result) => result,
                None => {
                    generation.exhausted = Some(Exhaustion::WallClock);
                    break;
                }
            };
            let id = match result {
                Ok(r) => {
                    let t = Trajectory::propose(state.run_id, &state.agent_name, 0, r.operator, r.parent_ids, r.code_artifact, r.rationale);
                    self.insert(t).await?
                }
                Err(e) => {
                    self.record_failed_synthesis(state, 0, OperatorKind::Seed, Vec::new(), e.to_string())
                        .await?
                }
            };
            generation.ids.push(id);
        }
        Ok(generation)
    }

    async fn mutate(
        &mut self,
        state: &mut RunState,
        operators: &OperatorSet,
        parents: &[Trajectory],
        plan: &[PlannedOperation],
        number: u32,
        budget: &mut BudgetTracker,
    ) -> Result<Generation> {
        let mut generation = Generation {
            number,
            ids: Vec::with_capacity(plan.len()),
            exhausted: None,
        };
        for slot in plan {
            if let Some(e) = budget.exhausted() {
                generation.exhausted = Some(e);
                break;
            }
            let slot_parents: Vec<&Trajectory> = slot
                .parents
                .iter()
                .filter_map(|id| parents.iter().find(|p| p.id == *id))
                .collect();

            budget.charge_synthesis();
            let result = match within_deadline(budget.deadline(), operators.apply(slot.operator, &slot_parents)).await {
                Some(result) => result,
                None => {
                    generation.exhausted = Some(Exhaustion::WallClock);
                    break;
                }
            };
            let id = match result {
                Ok(r) => {
                    let t = Trajectory::propose(state.run_id, &state.agent_name, number, r.operator, r.parent_ids, r.code_artifact, r.rationale);
                    self.insert(t).await?
                }
                Err(e) => {
                    self.record_failed_synthesis(state, number, slot.operator, slot.parents.clone(), e.to_string())
                        .await?
                }
            };
            generation.ids.push(id);
        }
        Ok(generation)
    }

    /// Keep a synthesis failure in the pool as a negative example.
    async fn record_failed_synthesis(
        &mut self,
        state: &RunState,
        generation: u32,
        operator: OperatorKind,
        parents: Vec<TrajectoryId>,
        reason: String,
    ) -> Result<TrajectoryId> {
        warn!(run = %state.run_id, generation, %operator, error = %reason, "Synthesis failed");
        let t = Trajectory::propose(
            state.run_id,
            &state.agent_name,
            generation,
            operator,
            parents,
            CodeArtifact::new(""),
            format!("{} produced no candidate", operator),
        );
        let id = self.insert(t).await?;
        self.transition(id, TrajectoryStatus::Failed, ResultFields::failure(format!("synthesis failed: {}", reason)))
            .await?;
        Ok(id)
    }

    async fn execute_generation(
        &mut self,
        state: &mut RunState,
        pipeline: &Pipeline,
        ids: &[TrajectoryId],
        budget: &mut BudgetTracker,
    ) -> Result<Option<Exhaustion>> {
        let mut candidates: Vec<Trajectory> = self
            .records(ids)
            .await?
            .into_iter()
            .filter(|t| t.status == TrajectoryStatus::Proposed)
            .collect();

        if self.syntax_precheck {
            let sandbox = self.sandbox.clone();
            let checks = join_all(candidates.iter().map(|t| sandbox.validate_syntax(t.code_artifact.as_str()))).await;
            let mut runnable = Vec::with_capacity(candidates.len());
            for (t, (valid, message)) in candidates.into_iter().zip(checks) {
                if valid {
                    runnable.push(t);
                } else {
                    let reason = format!("syntax check failed: {}", message.unwrap_or_default());
                    warn!(trajectory = %t.id, %reason, "Candidate rejected before execution");
                    self.transition(t.id, TrajectoryStatus::Failed, ResultFields::failure(reason)).await?;
                }
            }
            candidates = runnable;
        }

        let mut snapshots = Vec::with_capacity(candidates.len());
        for t in candidates {
            snapshots.push(self.transition(t.id, TrajectoryStatus::Executing, ResultFields::none()).await?);
        }

        let report = run_batch(pipeline, snapshots, self.policy.batch_parallelism(), budget).await;
        for (id, verdict) in report.completed {
            self.apply_verdict(state, id, verdict).await?;
        }
        for id in &report.cancelled {
            self.transition(*id, TrajectoryStatus::Failed, ResultFields::failure("cancelled: budget exhausted"))
                .await?;
        }
        Ok(report.exhaustion)
    }

    async fn apply_verdict(&mut self, state: &mut RunState, id: TrajectoryId, verdict: Verdict) -> Result<()> {
        match verdict {
            Verdict::ExecutionFailed { reason, sandbox } => {
                warn!(trajectory = %id, %reason, "Execution failed");
                let fields = ResultFields {
                    sandbox_result: sandbox,
                    failure_reason: Some(reason),
                    ..ResultFields::default()
                };
                self.transition(id, TrajectoryStatus::Failed, fields).await?;
            }
            Verdict::TimedOut { sandbox } => {
                let reason = format!("timed out after {:?}", self.policy.sandbox.timeout);
                let fields = ResultFields {
                    sandbox_result: Some(sandbox),
                    failure_reason: Some(reason),
                    ..ResultFields::default()
                };
                self.transition(id, TrajectoryStatus::TimedOut, fields).await?;
            }
            Verdict::ScoringFailed { sandbox, reason } => {
                self.transition(id, TrajectoryStatus::Executed, ResultFields::sandbox(sandbox)).await?;
                self.transition(id, TrajectoryStatus::Failed, ResultFields::failure(reason)).await?;
            }
            Verdict::Judged { sandbox, judge, benchmark } => {
                self.transition(id, TrajectoryStatus::Executed, ResultFields::sandbox(sandbox)).await?;
                let bench_score = benchmark.as_ref().map(|b| b.total_score);
                self.transition(id, TrajectoryStatus::Judged, ResultFields::scores(judge, bench_score)).await?;
                if let Some(b) = benchmark {
                    state.benchmarks.insert(id, b);
                }
            }
        }
        Ok(())
    }

    /// Send every JUDGED trajectory at or above the release threshold to review.
    async fn review_generation(&mut self, state: &mut RunState, ids: &[TrajectoryId], baseline_cmp: Option<f64>) -> Result<()> {
        let threshold = self.policy.safety.min_release_cmp;
        for t in self.records(ids).await? {
            if t.status != TrajectoryStatus::Judged {
                continue;
            }
            let Some(judge_score) = t.judge_score.clone() else { continue };
            if judge_score.cmp < threshold {
                debug!(trajectory = %t.id, cmp = judge_score.cmp, threshold, "Below release threshold, not reviewed");
                continue;
            }

            let t = self.transition(t.id, TrajectoryStatus::SafetyReview, ResultFields::none()).await?;
            let outcome = self
                .safety
                .review(&t, &judge_score, state.benchmarks.get(&t.id), baseline_cmp)
                .await;
            let decision = outcome.report.decision;
            self.pool.record_safety_report(t.id, outcome.report).await?;

            match (decision, outcome.approval) {
                (SafetyDecision::Approve, Some(approval)) => {
                    self.transition(t.id, TrajectoryStatus::Approved, ResultFields::none()).await?;
                    state.approvals.insert(t.id, approval);
                }
                (SafetyDecision::Approve, None) => {
                    warn!(trajectory = %t.id, "Approval did not qualify for promotion, held");
                }
                (SafetyDecision::Reject, _) => {
                    self.transition(t.id, TrajectoryStatus::Rejected, ResultFields::none()).await?;
                }
                (SafetyDecision::HoldForReview, _) => {
                    info!(trajectory = %t.id, "Held for human review");
                }
            }
        }
        Ok(())
    }

    async fn promote(&self, state: &RunState, warm: Option<&Checkpoint>, iterations: u32) -> Result<Promotion> {
        let mut approved = Vec::with_capacity(state.approvals.len());
        for id in state.approvals.keys() {
            if let Some(t) = self.pool.get(*id).await? {
                approved.push(t);
            }
        }

        let best = ranking::best(approved.iter().filter(|t| t.status == TrajectoryStatus::Approved));
        let (Some(best), Some(approval)) = (best, best.and_then(|t| state.approvals.get(&t.id))) else {
            info!(run = %state.run_id, "No approved candidate, nothing promoted");
            return Ok(Promotion::NoSafeCandidate {
                advisory: state.best.clone(),
            });
        };

        if warm.is_some_and(|cp| cp.code_artifact == best.code_artifact) {
            info!(run = %state.run_id, "Best approved candidate is the warm-start code, nothing promoted");
            return Ok(Promotion::NoImprovement);
        }

        let success_rate = state
            .benchmarks
            .get(&best.id)
            .map(|b| b.pass_rate())
            .or(best.cmp_score)
            .unwrap_or(0.0);
        let metrics = CheckpointMetrics {
            success_rate,
            cmp_score: approval.cmp(),
            benchmark_score: best.benchmark_score,
            iterations,
        };
        let checkpoint = self.checkpoints.save(approval, best, metrics).await?;
        Ok(Promotion::Promoted(checkpoint))
    }

    async fn cancel_proposed(&mut self, ids: &[TrajectoryId]) -> Result<()> {
        for t in self.records(ids).await? {
            if t.status == TrajectoryStatus::Proposed {
                self.transition(t.id, TrajectoryStatus::Failed, ResultFields::failure("cancelled: budget exhausted"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn records(&self, ids: &[TrajectoryId]) -> Result<Vec<Trajectory>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.pool.get(*id).await? {
                Some(t) => out.push(t),
                None => return Err(evoloop_core::IntegrityError::UnknownTrajectory(*id).into()),
            }
        }
        Ok(out)
    }

    async fn insert(&mut self, trajectory: Trajectory) -> Result<TrajectoryId> {
        let id = trajectory.id;
        debug!(
            trajectory = %id,
            generation = trajectory.generation,
            operator = %trajectory.operator_used,
            parents = trajectory.parent_ids.len(),
            "Trajectory proposed"
        );
        self.pool.insert(trajectory).await?;
        Ok(id)
    }

    async fn transition(&mut self, id: TrajectoryId, status: TrajectoryStatus, fields: ResultFields) -> Result<Trajectory> {
        let updated = self.pool.update_status(id, status, fields).await?;
        debug!(trajectory = %id, %status, "Transition");
        Ok(updated)
    }
}

/// Run `fut`, giving up at `deadline`.
async fn within_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use evoloop_core::{Aggregation, JudgeScore, QualityTier, RiskLevel};
    use evoloop_evolution::SynthesisError;
    use evoloop_quality::{JudgeContext, JudgeError};
    use evoloop_sandbox::{ProcessBackend, RuntimeSpec};
    use evoloop_storage::{InMemoryKvStore, InMemoryPool, JsonTrajectoryPool};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Reads `# cmp=<x>` and `# delay=<ms>` markers from the code.
    struct MarkerJudge {
        log: Arc<Mutex<Vec<String>>>,
    }

    fn marker(code: &str, key: &str) -> Option<f64> {
        code.lines()
            .find_map(|l| l.trim().strip_prefix(&format!("# {}=", key)))
            .and_then(|v| v.trim().parse().ok())
    }

    #[async_trait]
    impl Judge for MarkerJudge {
        async fn score(&self, candidate: &Trajectory, _ctx: &JudgeContext<'_>) -> std::result::Result<JudgeScore, JudgeError> {
            let code = candidate.code_artifact.as_str();
            if let Some(ms) = marker(code, "delay") {
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            }
            let cmp = marker(code, "cmp").unwrap_or(0.1);
            self.log.lock().unwrap().push("judged".to_string());
            let mut dimensions = BTreeMap::new();
            dimensions.insert("marker".to_string(), cmp);
            Ok(JudgeScore {
                dimensions,
                cmp,
                aggregation: Aggregation::WeightedMean,
            })
        }
    }

    /// Hands out scripted code, then a fallback.
    struct ScriptedSynth {
        queue: Mutex<VecDeque<String>>,
        fallback: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CodeSynthesizer for ScriptedSynth {
        async fn synthesize(&self, _problem: &str, _context: &str) -> std::result::Result<String, SynthesisError> {
            self.log.lock().unwrap().push("synth".to_string());
            Ok(self.queue.lock().unwrap().pop_front().unwrap_or_else(|| self.fallback.clone()))
        }
    }

    struct FailingSynth;

    #[async_trait]
    impl CodeSynthesizer for FailingSynth {
        async fn synthesize(&self, _problem: &str, _context: &str) -> std::result::Result<String, SynthesisError> {
            Err(SynthesisError::Unavailable("offline".into()))
        }
    }

    struct Harness {
        log: Arc<Mutex<Vec<String>>>,
        store: Arc<InMemoryKvStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                store: Arc::new(InMemoryKvStore::new()),
            }
        }

        fn synth(&self, script: &[&str], fallback: &str) -> Arc<dyn CodeSynthesizer> {
            Arc::new(ScriptedSynth {
                queue: Mutex::new(script.iter().map(|s| s.to_string()).collect()),
                fallback: fallback.to_string(),
                log: self.log.clone(),
            })
        }

        fn engine(&self, policy: EvolutionPolicy, synthesizer: Arc<dyn CodeSynthesizer>) -> EvolutionEngine<InMemoryPool> {
            self.engine_with(InMemoryPool::new(), policy, synthesizer)
        }

        fn engine_with<P: TrajectoryPool>(
            &self,
            pool: P,
            policy: EvolutionPolicy,
            synthesizer: Arc<dyn CodeSynthesizer>,
        ) -> EvolutionEngine<P> {
            let sandbox = SandboxExecutor::new(Arc::new(ProcessBackend::new()))
                .with_runtime(RuntimeSpec::shell())
                .allow_unisolated_network(true);
            let collaborators = Collaborators {
                sandbox: Arc::new(sandbox),
                judge: Arc::new(MarkerJudge { log: self.log.clone() }),
                safety: Arc::new(RuleBasedSafetyLayer::new(policy.safety, true)),
                synthesizer,
                store: self.store.clone(),
                benchmark: None,
            };
            EvolutionEngine::new(pool, policy, collaborators).unwrap()
        }
    }

    fn policy(max_iterations: u32, per_iteration: usize) -> EvolutionPolicy {
        let mut p = EvolutionPolicy::default();
        p.orchestration.max_iterations = max_iterations;
        p.orchestration.trajectories_per_iteration = per_iteration;
        p.orchestration.max_parallel = 5;
        p.orchestration.plateau_window = 10;
        p.sandbox.timeout = Duration::from_secs(10);
        p.capabilities.benchmark = false;
        p
    }

    fn all(run_id: RunId) -> TrajectoryFilter {
        TrajectoryFilter {
            run_id: Some(run_id),
            include_archived: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_max_iterations_reports_best_across_run() {
        let h = Harness::new();
        let synth = h.synth(
            &[
                "# cmp=0.6\necho a\n",
                "# cmp=0.85\necho b\n",
                "# cmp=0.4\necho c\n",
                "# cmp=0.7\necho d\n",
                "# cmp=0.3\necho e\n",
            ],
            "# cmp=0.2\necho f\n",
        );
        let mut engine = h.engine(policy(3, 2), synth);

        let outcome = engine
            .run(RunRequest::new("solver", "print a greeting", "# cmp=0.5\necho seed\n"))
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::MaxIterations);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.history.len(), 3);
        let best = outcome.best.as_ref().unwrap();
        assert_eq!(best.cmp_score, Some(0.85));
        assert_eq!(best.generation, 1);

        let checkpoint = outcome.promotion.checkpoint().unwrap();
        assert_eq!(checkpoint.code_reference, best.id);
        assert_eq!(checkpoint.version, 1);
        assert_eq!(checkpoint.quality_tier, QualityTier::Good);

        // every approval was backed by a report at or above the threshold
        let approved = engine
            .pool()
            .query(&TrajectoryFilter {
                status: Some(vec![TrajectoryStatus::Approved]),
                ..all(outcome.run_id)
            })
            .await
            .unwrap();
        assert!(!approved.is_empty());
        for t in approved {
            let report = t.latest_safety_report().unwrap();
            assert_eq!(report.decision, SafetyDecision::Approve);
            assert!(report.cmp_seen.unwrap() >= report.release_threshold);
            assert_ne!(report.risk_level, RiskLevel::Critical);
        }
    }

    #[tokio::test]
    async fn test_flat_scores_converge_before_max_iterations() {
        let h = Harness::new();
        let mut p = policy(10, 2);
        p.orchestration.plateau_window = 2;
        let mut engine = h.engine(p, h.synth(&[], "# cmp=0.75\necho same\n"));

        let outcome = engine
            .run(RunRequest::new("solver", "print a greeting", "# cmp=0.75\necho seed\n"))
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Converged);
        assert_eq!(outcome.iterations, 3);
        assert!(outcome.iterations < 10);
        assert_eq!(outcome.history.len(), 3);
        assert!(outcome.history.iter().all(|s| s.best_cmp_so_far == Some(0.75)));
        assert_eq!(outcome.best.as_ref().unwrap().cmp_score, Some(0.75));

        let checkpoint = outcome.promotion.checkpoint().unwrap();
        assert_eq!(checkpoint.quality_tier, QualityTier::Good);

        // three generations of two
        let records = engine.pool().query(&all(outcome.run_id)).await.unwrap();
        assert_eq!(records.len(), 6);
    }

    #[tokio::test]
    async fn test_critical_candidate_rejected_despite_high_score() {
        let h = Harness::new();
        let mut engine = h.engine(policy(1, 1), h.synth(&[], "echo unused\n"));

        let outcome = engine
            .run(RunRequest::new("solver", "cleanup", "# cmp=0.95\necho 'rm -rf /'\n"))
            .await
            .unwrap();

        let seed = outcome.best.clone().unwrap();
        let stored = engine.pool().get(seed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TrajectoryStatus::Rejected);
        assert_eq!(stored.latest_safety_report().unwrap().risk_level, RiskLevel::Critical);
        match outcome.promotion {
            Promotion::NoSafeCandidate { advisory } => assert_eq!(advisory.unwrap().cmp_score, Some(0.95)),
            other => panic!("unexpected promotion: {:?}", other),
        }
        assert!(engine.checkpoints().list("solver").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_selection_waits_for_whole_batch() {
        let h = Harness::new();
        let script: Vec<String> = (1..=4).map(|i| format!("# delay={}\n# cmp=0.5\necho {}\n", 200 - i * 40, i)).collect();
        let script: Vec<&str> = script.iter().map(String::as_str).collect();
        let mut engine = h.engine(policy(2, 5), h.synth(&script, "# cmp=0.5\necho next\n"));

        let outcome = engine
            .run(RunRequest::new("solver", "p", "# delay=250\n# cmp=0.5\necho seed\n"))
            .await
            .unwrap();
        assert_eq!(outcome.iterations, 2);

        let log = h.log.lock().unwrap().clone();
        // four seed variants, then all five judgements, then mutation
        assert!(log[..4].iter().all(|e| e == "synth"));
        assert!(log[4..9].iter().all(|e| e == "judged"), "{:?}", log);
        assert_eq!(log[9], "synth");

        let first = engine
            .pool()
            .query(&TrajectoryFilter {
                generation: Some(0),
                ..all(outcome.run_id)
            })
            .await
            .unwrap();
        assert_eq!(first.len(), 5);
        assert!(first.iter().all(|t| t.status.is_settled()));
        assert_eq!(outcome.history[0].plan.len(), 5);
    }

    #[tokio::test]
    async fn test_warm_start_from_checkpoint_records_calibration() {
        let h = Harness::new();
        let mut first = h.engine(policy(1, 1), h.synth(&[], "echo unused\n"));
        let seeded = first
            .run(RunRequest::new("solver", "p", "# cmp=0.9\necho good\n"))
            .await
            .unwrap();
        let checkpoint = seeded.promotion.checkpoint().unwrap().clone();
        assert_eq!(checkpoint.quality_tier, QualityTier::Excellent);

        let mut second = h.engine(policy(2, 2), h.synth(&[], "# cmp=0.2\necho worse\n"));
        let outcome = second
            .run(RunRequest::new("solver", "p", "echo ignored\n"))
            .await
            .unwrap();

        assert_eq!(outcome.warm_start_version, Some(checkpoint.version));
        let seed = second
            .pool()
            .query(&TrajectoryFilter {
                generation: Some(0),
                operator: Some(OperatorKind::Seed),
                ..all(outcome.run_id)
            })
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.code_artifact == checkpoint.code_artifact);
        assert!(seed.is_some());
        assert!(matches!(outcome.promotion, Promotion::NoImprovement));

        let history = second.calibration().history("solver").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].checkpoint_tier, Some(QualityTier::Excellent));
        assert_eq!(history[0].seed_cmp, Some(0.9));
    }

    #[tokio::test]
    async fn test_wall_clock_budget_ends_run() {
        let h = Harness::new();
        let mut p = policy(5, 1);
        p.budget.max_wall_clock = Some(Duration::from_millis(300));
        let mut engine = h.engine(p, h.synth(&[], "echo unused\n"));

        let outcome = engine
            .run(RunRequest::new("solver", "p", "sleep 5\n"))
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::BudgetExhausted);
        assert_eq!(outcome.iterations, 1);
        let records = engine.pool().query(&all(outcome.run_id)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TrajectoryStatus::Failed);
        assert!(records[0].failure_reason.as_deref().unwrap().contains("budget"));
    }

    #[tokio::test]
    async fn test_synthesis_failures_are_recorded_not_fatal() {
        let h = Harness::new();
        let mut engine = h.engine(policy(2, 2), Arc::new(FailingSynth));

        let outcome = engine
            .run(RunRequest::new("solver", "p", "# cmp=0.1\necho seed\n"))
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::MaxIterations);
        assert_eq!(outcome.operator_stats.get(OperatorKind::Seed).failed, 1);
        assert_eq!(outcome.operator_stats.get(OperatorKind::Revision).failed, 2);
        assert!(matches!(outcome.promotion, Promotion::NoSafeCandidate { .. }));
    }

    #[tokio::test]
    async fn test_invalid_syntax_fails_before_execution() {
        let h = Harness::new();
        let mut engine = h.engine(policy(1, 1), h.synth(&[], "echo unused\n"));

        let outcome = engine
            .run(RunRequest::new("solver", "p", "if then (\n"))
            .await
            .unwrap();

        let records = engine.pool().query(&all(outcome.run_id)).await.unwrap();
        assert_eq!(records[0].status, TrajectoryStatus::Failed);
        assert!(records[0].sandbox_result.is_none());
        assert!(records[0].failure_reason.as_deref().unwrap().starts_with("syntax check failed"));
    }

    #[tokio::test]
    async fn test_run_survives_pool_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new();
        let pool = JsonTrajectoryPool::open(dir.path()).await.unwrap();
        let mut engine = h.engine_with(pool, policy(3, 2), h.synth(&[], "# cmp=0.75\necho next\n"));

        let outcome = engine
            .run(RunRequest::new("solver", "p", "# cmp=0.5\necho seed\n"))
            .await
            .unwrap();
        drop(engine);

        let reopened = JsonTrajectoryPool::open(dir.path()).await.unwrap();
        let records = reopened.query(&all(outcome.run_id)).await.unwrap();
        assert_eq!(records.len(), 6);
        assert!(records.iter().filter(|t| t.generation == 0).all(|t| t.is_archived()));
        let successful = reopened.get_successful(0.7).await.unwrap();
        assert_eq!(successful[0].id, outcome.best.unwrap().id);
    }

    #[tokio::test]
    async fn test_invalid_agent_name_rejected() {
        let h = Harness::new();
        let mut engine = h.engine(policy(1, 1), h.synth(&[], "echo\n"));
        let err = engine.run(RunRequest::new("a/b", "p", "echo\n")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }
}
