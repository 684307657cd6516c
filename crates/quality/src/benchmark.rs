//! Benchmark suites and the runner that executes them in the sandbox.

use async_trait::async_trait;
use evoloop_core::{BenchmarkResult, CodeArtifact, ExecutionLimits, SandboxResult, SandboxStatus, TaskOutcome};
use evoloop_sandbox::{SandboxError, SandboxExecutor};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Errors raised by suites and the runner.
#[derive(Debug, thiserror::Error)]
pub enum BenchmarkError {
    /// No suite registered under this id
    #[error("unknown benchmark suite: {0}")]
    UnknownSuite(String),

    /// Suite content changed after a run referenced it
    #[error("benchmark suite {id} v{version} is frozen")]
    SuiteFrozen {
        /// Suite id
        id: String,
        /// Suite version
        version: u32,
    },

    /// Suite definition is inconsistent
    #[error("invalid benchmark suite: {0}")]
    InvalidSuite(String),

    /// Sandbox infrastructure failure
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How task outcomes collapse into the suite total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteAggregation {
    /// Mean task value
    #[default]
    PassRate,
    /// Mean task value weighted by task weight (difficulty)
    Weighted,
}

/// How a task decides pass/fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskCheck {
    /// Completed run whose trimmed stdout equals `expected`
    ExpectedStdout {
        /// Expected output
        expected: String,
    },
    /// Completed run passes; a `SCORE=<float>` stdout line becomes a numeric score
    ExitStatus {
        /// Parse `SCORE=` lines
        #[serde(default)]
        parse_score: bool,
    },
}

/// One task of a suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkTask {
    /// Task id, unique within the suite
    pub id: String,
    /// Harness appended to the candidate
    #[serde(default)]
    pub harness: String,
    /// Pass criterion
    pub check: TaskCheck,
    /// Weight under [`SuiteAggregation::Weighted`]
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

fn default_repeat() -> u32 {
    1
}

/// A versioned, ordered list of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSuite {
    /// Suite id
    pub id: String,
    /// Suite version
    pub version: u32,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Aggregation rule
    #[serde(default)]
    pub aggregation: SuiteAggregation,
    /// Runs per task; disagreeing runs are flagged
    #[serde(default = "default_repeat")]
    pub repeat_runs: u32,
    /// Per-task sandbox limits (run limits when absent)
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
    /// Ordered tasks
    pub tasks: Vec<BenchmarkTask>,
}

impl BenchmarkSuite {
    /// Load a suite definition from JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BenchmarkError> {
        let text = std::fs::read_to_string(path)?;
        let suite: Self = serde_json::from_str(&text)?;
        suite.validate()?;
        Ok(suite)
    }

    /// Reject empty suites, duplicate task ids and bad weights.
    pub fn validate(&self) -> Result<(), BenchmarkError> {
        if self.tasks.is_empty() {
            return Err(BenchmarkError::InvalidSuite(format!("suite '{}' has no tasks", self.id)));
        }
        if self.repeat_runs == 0 {
            return Err(BenchmarkError::InvalidSuite("repeat_runs must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(BenchmarkError::InvalidSuite(format!("duplicate task id '{}'", task.id)));
            }
            if !task.weight.is_finite() || task.weight <= 0.0 {
                return Err(BenchmarkError::InvalidSuite(format!("task '{}' has non-positive weight", task.id)));
            }
        }
        Ok(())
    }

    /// Collapse task outcomes under the declared rule.
    pub fn aggregate(&self, outcomes: &BTreeMap<String, TaskOutcome>) -> f64 {
        let mut total = 0.0;
        let mut weight_sum = 0.0;
        for task in &self.tasks {
            let Some(outcome) = outcomes.get(&task.id) else { continue };
            let w = match self.aggregation {
                SuiteAggregation::PassRate => 1.0,
                SuiteAggregation::Weighted => task.weight,
            };
            total += w * outcome.value();
            weight_sum += w;
        }
        if weight_sum > 0.0 {
            total / weight_sum
        } else {
            0.0
        }
    }
}

/// Suites by `(id, version)`. Referenced suites are frozen.
#[derive(Debug, Default)]
pub struct SuiteRegistry {
    suites: HashMap<(String, u32), Arc<BenchmarkSuite>>,
    frozen: HashSet<(String, u32)>,
}

impl SuiteRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suite. Re-registering a frozen suite with different content fails.
    pub fn register(&mut self, suite: BenchmarkSuite) -> Result<(), BenchmarkError> {
        suite.validate()?;
        let key = (suite.id.clone(), suite.version);
        if self.frozen.contains(&key) {
            match self.suites.get(&key) {
                Some(existing) if **existing == suite => return Ok(()),
                _ => {
                    return Err(BenchmarkError::SuiteFrozen {
                        id: suite.id,
                        version: suite.version,
                    })
                }
            }
        }
        self.suites.insert(key, Arc::new(suite));
        Ok(())
    }

    /// Latest version of `id`, frozen from now on.
    pub fn resolve(&mut self, id: &str) -> Result<Arc<BenchmarkSuite>, BenchmarkError> {
        let suite = self
            .suites
            .iter()
            .filter(|((sid, _), _)| sid == id)
            .max_by_key(|((_, version), _)| *version)
            .map(|(_, suite)| suite.clone())
            .ok_or_else(|| BenchmarkError::UnknownSuite(id.to_string()))?;
        self.frozen.insert((suite.id.clone(), suite.version));
        Ok(suite)
    }

    /// Whether `(id, version)` has been referenced.
    pub fn is_frozen(&self, id: &str, version: u32) -> bool {
        self.frozen.contains(&(id.to_string(), version))
    }
}

/// Runs benchmark suites against candidates.
#[async_trait]
pub trait Benchmark: Send + Sync {
    /// Run suite `suite_id` against `candidate`.
    async fn run(&self, candidate: &CodeArtifact, suite_id: &str) -> Result<BenchmarkResult, BenchmarkError>;
}

/// Sandbox-backed benchmark runner.
pub struct BenchmarkRunner {
    sandbox: Arc<SandboxExecutor>,
    registry: RwLock<SuiteRegistry>,
    default_limits: ExecutionLimits,
}

impl BenchmarkRunner {
    /// Create a runner over `sandbox`.
    pub fn new(sandbox: Arc<SandboxExecutor>, default_limits: ExecutionLimits) -> Self {
        Self {
            sandbox,
            registry: RwLock::new(SuiteRegistry::new()),
            default_limits,
        }
    }

    /// Register a suite.
    pub async fn register(&self, suite: BenchmarkSuite) -> Result<(), BenchmarkError> {
        info!(suite = %suite.id, version = suite.version, tasks = suite.tasks.len(), "Registered benchmark suite");
        self.registry.write().await.register(suite)
    }

    async fn run_task(&self, code: &str, task: &BenchmarkTask, limits: &ExecutionLimits) -> Result<TaskOutcome, BenchmarkError> {
        let result = if task.harness.is_empty() {
            self.sandbox.execute(code, limits).await?
        } else {
            self.sandbox.execute_tests(code, &task.harness, limits).await?
        };
        Ok(judge_task(&task.check, &result))
    }
}

#[async_trait]
impl Benchmark for BenchmarkRunner {
    async fn run(&self, candidate: &CodeArtifact, suite_id: &str) -> Result<BenchmarkResult, BenchmarkError> {
        let suite = self.registry.write().await.resolve(suite_id)?;
        let limits = suite.limits.clone().unwrap_or_else(|| self.default_limits.clone());

        let mut task_scores = BTreeMap::new();
        let mut non_reproducible = Vec::new();
        for task in &suite.tasks {
            let first = self.run_task(candidate.as_str(), task, &limits).await?;
            for _ in 1..suite.repeat_runs {
                let again = self.run_task(candidate.as_str(), task, &limits).await?;
                if again != first {
                    warn!(suite = %suite.id, task = %task.id, ?first, ?again, "Non-reproducible benchmark task");
                    non_reproducible.push(task.id.clone());
                    break;
                }
            }
            debug!(suite = %suite.id, task = %task.id, outcome = ?first, "Benchmark task finished");
            task_scores.insert(task.id.clone(), first);
        }

        let total_score = suite.aggregate(&task_scores);
        Ok(BenchmarkResult {
            suite_id: suite.id.clone(),
            suite_version: suite.version,
            task_scores,
            total_score,
            non_reproducible,
        })
    }
}

fn score_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^SCORE=([0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)\s*$").ok())
        .as_ref()
}

/// Last `SCORE=<float>` line of `stdout`.
pub fn parse_score(stdout: &str) -> Option<f64> {
    score_line()?
        .captures_iter(stdout)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Decide one task from its sandbox run.
pub fn judge_task(check: &TaskCheck, result: &SandboxResult) -> TaskOutcome {
    if result.status != SandboxStatus::Completed {
        return TaskOutcome::Fail;
    }
    match check {
        TaskCheck::ExpectedStdout { expected } => {
            if result.stdout.trim() == expected.trim() {
                TaskOutcome::Pass
            } else {
                TaskOutcome::Fail
            }
        }
        TaskCheck::ExitStatus { parse_score: true } => match parse_score(&result.stdout) {
            Some(v) => TaskOutcome::Numeric(v.clamp(0.0, 1.0)),
            None => TaskOutcome::Pass,
        },
        TaskCheck::ExitStatus { parse_score: false } => TaskOutcome::Pass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoloop_core::ResourceUsage;
    use evoloop_sandbox::{ProcessBackend, RuntimeSpec};
    use std::time::Duration;

    fn suite(tasks: Vec<BenchmarkTask>) -> BenchmarkSuite {
        BenchmarkSuite {
            id: "arith".into(),
            version: 1,
            description: String::new(),
            aggregation: SuiteAggregation::PassRate,
            repeat_runs: 1,
            limits: None,
            tasks,
        }
    }

    fn task(id: &str, harness: &str, check: TaskCheck) -> BenchmarkTask {
        BenchmarkTask {
            id: id.into(),
            harness: harness.into(),
            check,
            weight: 1.0,
        }
    }

    fn completed(stdout: &str) -> SandboxResult {
        SandboxResult {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            execution_time: Duration::ZERO,
            resource_usage: ResourceUsage::default(),
            status: SandboxStatus::Completed,
        }
    }

    fn runner() -> BenchmarkRunner {
        let sandbox = SandboxExecutor::new(Arc::new(ProcessBackend::new()))
            .with_runtime(RuntimeSpec::shell())
            .allow_unisolated_network(true);
        let limits = ExecutionLimits {
            timeout: Duration::from_secs(10),
            ..Default::default()
        };
        BenchmarkRunner::new(Arc::new(sandbox), limits)
    }

    #[test]
    fn test_parse_score_takes_last_line() {
        assert_eq!(parse_score("SCORE=0.25\nnoise\nSCORE=0.75\n"), Some(0.75));
        assert_eq!(parse_score("score: 1"), None);
        assert_eq!(parse_score("SCORE=1e-1"), Some(0.1));
    }

    #[test]
    fn test_judge_task() {
        let expected = TaskCheck::ExpectedStdout { expected: "5".into() };
        assert_eq!(judge_task(&expected, &completed("5\n")), TaskOutcome::Pass);
        assert_eq!(judge_task(&expected, &completed("6\n")), TaskOutcome::Fail);

        let scored = TaskCheck::ExitStatus { parse_score: true };
        assert_eq!(judge_task(&scored, &completed("SCORE=0.4\n")), TaskOutcome::Numeric(0.4));

        let mut timed_out = completed("5");
        timed_out.status = SandboxStatus::Timeout;
        assert_eq!(judge_task(&expected, &timed_out), TaskOutcome::Fail);
    }

    #[test]
    fn test_weighted_aggregation() {
        let mut s = suite(vec![
            task("easy", "", TaskCheck::ExitStatus { parse_score: false }),
            task("hard", "", TaskCheck::ExitStatus { parse_score: false }),
        ]);
        s.aggregation = SuiteAggregation::Weighted;
        s.tasks[1].weight = 3.0;
        let mut outcomes = BTreeMap::new();
        outcomes.insert("easy".to_string(), TaskOutcome::Pass);
        outcomes.insert("hard".to_string(), TaskOutcome::Fail);
        assert_eq!(s.aggregate(&outcomes), 0.25);
    }

    #[test]
    fn test_registry_freezes_referenced_suites() {
        let mut registry = SuiteRegistry::new();
        let s = suite(vec![task("t", "", TaskCheck::ExitStatus { parse_score: false })]);
        registry.register(s.clone()).unwrap();
        registry.resolve("arith").unwrap();
        assert!(registry.is_frozen("arith", 1));

        // Identical content is accepted, changed content is not.
        registry.register(s.clone()).unwrap();
        let mut changed = s.clone();
        changed.tasks[0].weight = 2.0;
        assert!(matches!(registry.register(changed.clone()), Err(BenchmarkError::SuiteFrozen { .. })));

        // A new version is a new suite.
        changed.version = 2;
        registry.register(changed).unwrap();
        assert_eq!(registry.resolve("arith").unwrap().version, 2);
    }

    #[test]
    fn test_suite_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.json");
        std::fs::write(
            &path,
            r#"{
                "id": "greet",
                "version": 2,
                "tasks": [
                    {"id": "hello", "harness": "greet", "check": {"kind": "expected_stdout", "expected": "hi"}},
                    {"id": "perf", "check": {"kind": "exit_status", "parse_score": true}, "weight": 2.0}
                ]
            }"#,
        )
        .unwrap();

        let loaded = BenchmarkSuite::from_json_file(&path).unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.repeat_runs, 1);
        assert_eq!(loaded.aggregation, SuiteAggregation::default());
        assert_eq!(loaded.tasks[1].check, TaskCheck::ExitStatus { parse_score: true });

        std::fs::write(&path, r#"{"id": "empty", "version": 1, "tasks": []}"#).unwrap();
        assert!(matches!(BenchmarkSuite::from_json_file(&path), Err(BenchmarkError::InvalidSuite(_))));
    }

    #[test]
    fn test_invalid_suites_rejected() {
        assert!(suite(vec![]).validate().is_err());
        let dup = suite(vec![
            task("t", "", TaskCheck::ExitStatus { parse_score: false }),
            task("t", "", TaskCheck::ExitStatus { parse_score: false }),
        ]);
        assert!(dup.validate().is_err());
    }

    #[tokio::test]
    async fn test_runner_scores_suite() {
        let runner = runner();
        runner
            .register(suite(vec![
                task("sum", "add 2 3", TaskCheck::ExpectedStdout { expected: "5".into() }),
                task("neg", "add -1 1", TaskCheck::ExpectedStdout { expected: "0".into() }),
                task("wrong", "add 1 1", TaskCheck::ExpectedStdout { expected: "3".into() }),
                task("partial", "echo SCORE=0.5", TaskCheck::ExitStatus { parse_score: true }),
            ]))
            .await
            .unwrap();

        let code = CodeArtifact::new("add() { echo $(($1 + $2)); }");
        let result = runner.run(&code, "arith").await.unwrap();
        assert_eq!(result.task_scores["sum"], TaskOutcome::Pass);
        assert_eq!(result.task_scores["wrong"], TaskOutcome::Fail);
        assert_eq!(result.task_scores["partial"], TaskOutcome::Numeric(0.5));
        assert!((result.total_score - 0.625).abs() < 1e-9);
        assert!(result.is_reproducible());
    }

    #[tokio::test]
    async fn test_repeat_runs_flag_nondeterminism() {
        let runner = runner();
        let mut s = suite(vec![task(
            "flaky",
            "",
            TaskCheck::ExpectedStdout { expected: "even".into() },
        )]);
        s.repeat_runs = 6;
        runner.register(s).await.unwrap();

        // Every run gets a fresh pid, so its parity varies.
        let code = CodeArtifact::new("if [ $(($$ % 2)) -eq 0 ]; then echo even; else echo odd; fi");
        let result = runner.run(&code, "arith").await.unwrap();
        // Either every run agreed or the task is flagged; never averaged.
        assert!(matches!(result.task_scores["flaky"], TaskOutcome::Pass | TaskOutcome::Fail));
        if !result.is_reproducible() {
            assert_eq!(result.non_reproducible, vec!["flaky".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_unknown_suite() {
        let err = runner().run(&CodeArtifact::new("true"), "missing").await.unwrap_err();
        assert!(matches!(err, BenchmarkError::UnknownSuite(_)));
    }
}
