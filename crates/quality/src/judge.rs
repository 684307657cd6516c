//! Multi-dimensional judge producing the composite (CMP) score.

use async_trait::async_trait;
use evoloop_core::{
    Aggregation, BenchmarkResult, ExecutionLimits, JudgePolicy, JudgeScore, RiskLevel,
    SandboxResult, Trajectory,
};
use std::collections::BTreeMap;
use tracing::debug;
use crate::patterns::RiskPatterns;

/// Errors raised while scoring.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    /// A scorer needs evidence the candidate does not have
    #[error("missing evidence for '{dimension}': {what}")]
    MissingEvidence {
        /// Dimension name
        dimension: String,
        /// What was missing
        what: String,
    },

    /// A scorer produced a value outside [0, 1]
    #[error("dimension '{dimension}' produced invalid score {value}")]
    InvalidScore {
        /// Dimension name
        dimension: String,
        /// Offending value
        value: f64,
    },

    /// No scored dimension carries weight
    #[error("no weighted dimension produced a score")]
    NoWeightedDimensions,

    /// Scorer setup failed
    #[error("judge unavailable: {0}")]
    Unavailable(String),
}

/// Evidence available to the judge.
#[derive(Debug, Clone, Copy)]
pub struct JudgeContext<'a> {
    /// Sandbox run of the candidate
    pub sandbox: Option<&'a SandboxResult>,
    /// Benchmark result, when benchmarking is enabled
    pub benchmark: Option<&'a BenchmarkResult>,
    /// Limits the sandbox run was held to
    pub limits: &'a ExecutionLimits,
}

/// Scores candidates.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Score `candidate` along every configured dimension.
    async fn score(
        &self,
        candidate: &Trajectory,
        context: &JudgeContext<'_>,
    ) -> Result<JudgeScore, JudgeError>;
}

/// One scoring dimension.
pub trait DimensionScorer: Send + Sync {
    /// Dimension name, matched against the policy weights.
    fn name(&self) -> &str;

    /// Score in [0, 1].
    fn score(&self, candidate: &Trajectory, context: &JudgeContext<'_>) -> Result<f64, JudgeError>;
}

/// Benchmark total when available, else whether the sandbox run completed.
pub struct CorrectnessScorer;

impl DimensionScorer for CorrectnessScorer {
    fn name(&self) -> &str {
        "correctness"
    }

    fn score(&self, _candidate: &Trajectory, context: &JudgeContext<'_>) -> Result<f64, JudgeError> {
        if let Some(bench) = context.benchmark {
            return Ok(bench.total_score);
        }
        match context.sandbox {
            Some(run) if run.succeeded() => Ok(1.0),
            Some(_) => Ok(0.0),
            None => Err(JudgeError::MissingEvidence {
                dimension: self.name().to_string(),
                what: "sandbox result".to_string(),
            }),
        }
    }
}

/// Headroom left under the time and memory limits.
pub struct EfficiencyScorer;

impl DimensionScorer for EfficiencyScorer {
    fn name(&self) -> &str {
        "efficiency"
    }

    fn score(&self, _candidate: &Trajectory, context: &JudgeContext<'_>) -> Result<f64, JudgeError> {
        let run = context.sandbox.ok_or_else(|| JudgeError::MissingEvidence {
            dimension: self.name().to_string(),
            what: "sandbox result".to_string(),
        })?;

        let timeout = context.limits.timeout.as_secs_f64();
        let time_score = if timeout > 0.0 {
            1.0 - (run.execution_time.as_secs_f64() / timeout).min(1.0)
        } else {
            0.0
        };

        let memory_score = run.resource_usage.peak_memory_bytes.map(|peak| {
            let limit = context.limits.memory_limit_bytes.max(1) as f64;
            1.0 - (peak as f64 / limit).min(1.0)
        });

        Ok(match memory_score {
            Some(mem) => (time_score + mem) / 2.0,
            None => time_score,
        })
    }
}

/// Static shape of the code: line length, size, comments.
pub struct MaintainabilityScorer {
    /// Lines longer than this count against the score
    pub max_line_len: usize,
    /// Size beyond which the score starts dropping
    pub soft_max_lines: usize,
}

impl Default for MaintainabilityScorer {
    fn default() -> Self {
        Self {
            max_line_len: 100,
            soft_max_lines: 400,
        }
    }
}

impl DimensionScorer for MaintainabilityScorer {
    fn name(&self) -> &str {
        "maintainability"
    }

    fn score(&self, candidate: &Trajectory, _context: &JudgeContext<'_>) -> Result<f64, JudgeError> {
        let code = candidate.code_artifact.as_str();
        let lines: Vec<&str> = code.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return Ok(0.0);
        }

        let long = lines.iter().filter(|l| l.chars().count() > self.max_line_len).count();
        let long_penalty = 0.5 * long as f64 / lines.len() as f64;

        let size_penalty = if lines.len() > self.soft_max_lines {
            let over = (lines.len() - self.soft_max_lines) as f64 / self.soft_max_lines as f64;
            (0.3 * over).min(0.3)
        } else {
            0.0
        };

        let has_comments = lines.iter().any(|l| {
            let t = l.trim_start();
            t.starts_with('#') || t.starts_with("//") || t.starts_with("\"\"\"")
        });
        let comment_penalty = if has_comments || lines.len() < 10 { 0.0 } else { 0.1 };

        Ok((1.0 - long_penalty - size_penalty - comment_penalty).clamp(0.0, 1.0))
    }
}

/// Static scan for risky constructs.
pub struct SafetyScorer {
    patterns: RiskPatterns,
}

impl SafetyScorer {
    /// Build with the built-in rule table.
    pub fn new() -> Result<Self, JudgeError> {
        let patterns = RiskPatterns::builtin().map_err(|e| JudgeError::Unavailable(e.to_string()))?;
        Ok(Self { patterns })
    }
}

impl DimensionScorer for SafetyScorer {
    fn name(&self) -> &str {
        "safety"
    }

    fn score(&self, candidate: &Trajectory, _context: &JudgeContext<'_>) -> Result<f64, JudgeError> {
        Ok(match self.patterns.worst(candidate.code_artifact.as_str()) {
            None => 1.0,
            Some(RiskLevel::Low) => 0.9,
            Some(RiskLevel::Medium) => 0.7,
            Some(RiskLevel::High) => 0.3,
            Some(RiskLevel::Critical) => 0.0,
        })
    }
}

/// Judge built from pluggable dimension scorers.
pub struct HeuristicJudge {
    scorers: Vec<Box<dyn DimensionScorer>>,
    weights: BTreeMap<String, f64>,
    aggregation: Aggregation,
}

impl HeuristicJudge {
    /// The four built-in dimensions under `policy`.
    pub fn from_policy(policy: &JudgePolicy) -> Result<Self, JudgeError> {
        Ok(Self::new(policy.clone())
            .with_scorer(Box::new(CorrectnessScorer))
            .with_scorer(Box::new(EfficiencyScorer))
            .with_scorer(Box::new(MaintainabilityScorer::default()))
            .with_scorer(Box::new(SafetyScorer::new()?)))
    }

    /// A judge with no scorers yet.
    pub fn new(policy: JudgePolicy) -> Self {
        Self {
            scorers: Vec::new(),
            weights: policy.weights,
            aggregation: policy.aggregation,
        }
    }

    /// Add a dimension.
    pub fn with_scorer(mut self, scorer: Box<dyn DimensionScorer>) -> Self {
        self.scorers.push(scorer);
        self
    }

    /// Names of the configured dimensions.
    pub fn dimensions(&self) -> Vec<&str> {
        self.scorers.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl Judge for HeuristicJudge {
    async fn score(
        &self,
        candidate: &Trajectory,
        context: &JudgeContext<'_>,
    ) -> Result<JudgeScore, JudgeError> {
        let mut dimensions = BTreeMap::new();
        for scorer in &self.scorers {
            let value = scorer.score(candidate, context)?;
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(JudgeError::InvalidScore {
                    dimension: scorer.name().to_string(),
                    value,
                });
            }
            dimensions.insert(scorer.name().to_string(), value);
        }

        let cmp = self
            .aggregation
            .aggregate(&dimensions, &self.weights)
            .ok_or(JudgeError::NoWeightedDimensions)?;

        debug!(trajectory = %candidate.id, cmp, ?dimensions, "Judged candidate");
        Ok(JudgeScore {
            dimensions,
            cmp,
            aggregation: self.aggregation,
        })
    }
}
