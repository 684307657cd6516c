//! Evolution policy - every threshold and weight in one place.
//!
//! Loaded from JSON; missing sections fall back to defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use crate::checkpoint::QualityTier;
use crate::execution::{duration_secs, ExecutionLimits};
use crate::score::Aggregation;

/// Upper bound on concurrent tasks per batch.
pub const MAX_PARALLEL: usize = 5;

/// Errors loading or validating a policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inconsistent values
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// The complete, declared evolution policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionPolicy {
    /// Judge dimension weights and aggregation
    pub judge: JudgePolicy,
    /// Operator selection thresholds
    pub operators: OperatorThresholds,
    /// Safety gate thresholds
    pub safety: SafetyPolicy,
    /// Control-loop limits
    pub orchestration: OrchestrationPolicy,
    /// Per-run sandbox limits
    pub sandbox: ExecutionLimits,
    /// Global budget
    pub budget: BudgetPolicy,
    /// Explicit retry policy
    pub retry: RetryPolicy,
    /// Optional collaborators
    pub capabilities: Capabilities,
    /// Warm-start selection
    pub warm_start: WarmStartPolicy,
}

/// Judge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgePolicy {
    /// Weight per dimension name
    pub weights: BTreeMap<String, f64>,
    /// Aggregation rule
    pub aggregation: Aggregation,
}

impl Default for JudgePolicy {
    fn default() -> Self {
        let weights = [
            ("correctness", 0.4),
            ("efficiency", 0.2),
            ("maintainability", 0.2),
            ("safety", 0.2),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            weights,
            aggregation: Aggregation::WeightedMean,
        }
    }
}

/// Score bands that pick the next operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorThresholds {
    /// Below this, Revision
    pub low_threshold: f64,
    /// At or above this (with a second qualifying parent), Recombination
    pub high_threshold: f64,
}

impl Default for OperatorThresholds {
    fn default() -> Self {
        Self {
            low_threshold: 0.4,
            high_threshold: 0.8,
        }
    }
}

/// Safety gate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    /// Minimum CMP for release
    pub min_release_cmp: f64,
    /// Width of the borderline band above `min_release_cmp`
    pub borderline_margin: f64,
    /// Largest tolerated CMP drop against the baseline before flagging a regression
    pub max_regression: f64,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            min_release_cmp: 0.7,
            borderline_margin: 0.1,
            max_regression: 0.05,
        }
    }
}

/// Control-loop limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationPolicy {
    /// Hard iteration cap
    pub max_iterations: u32,
    /// Candidates produced per iteration
    pub trajectories_per_iteration: usize,
    /// Concurrent tasks per batch
    pub max_parallel: usize,
    /// Minimum improvement that counts as progress
    pub plateau_epsilon: f64,
    /// Iterations without progress before declaring convergence
    pub plateau_window: u32,
}

impl Default for OrchestrationPolicy {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            trajectories_per_iteration: 4,
            max_parallel: 5,
            plateau_epsilon: 0.01,
            plateau_window: 3,
        }
    }
}

/// Global budget. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetPolicy {
    /// Wall-clock budget for the whole run
    #[serde(with = "opt_duration_secs")]
    pub max_wall_clock: Option<Duration>,
    /// Cost budget in abstract units
    pub max_cost_units: Option<f64>,
    /// Cost of one synthesis call
    pub synthesis_cost: f64,
    /// Cost of one sandbox second
    pub sandbox_cost_per_sec: f64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            max_wall_clock: None,
            max_cost_units: None,
            synthesis_cost: 1.0,
            sandbox_cost_per_sec: 0.1,
        }
    }
}

/// Retries for sandbox infrastructure errors. Zero means never retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after a sandbox infrastructure error
    pub sandbox_retries: u32,
    /// Delay between attempts
    #[serde(with = "duration_secs")]
    pub backoff: Duration,
}

/// Optional collaborators, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Run the benchmark suite
    pub benchmark: bool,
    /// Syntax-check candidates before paying for a sandbox run
    pub syntax_precheck: bool,
    /// Seed from the best checkpoint
    pub warm_start: bool,
    /// Static pattern scan in the safety layer
    pub static_safety_scan: bool,
    /// Allow `network_disabled` on backends that cannot isolate the network
    pub allow_unisolated_network: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            benchmark: true,
            syntax_precheck: true,
            warm_start: true,
            static_safety_scan: true,
            allow_unisolated_network: false,
        }
    }
}

/// Warm-start selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmStartPolicy {
    /// Lowest tier accepted as a seed
    pub min_quality_tier: QualityTier,
}

impl Default for WarmStartPolicy {
    fn default() -> Self {
        Self {
            min_quality_tier: QualityTier::Good,
        }
    }
}

impl EvolutionPolicy {
    /// Load and validate a policy file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        let policy: Self = serde_json::from_str(&text)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Reject inconsistent values.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |msg: String| Err(PolicyError::Invalid(msg));

        if self.judge.weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return invalid("judge weights must be finite and non-negative".into());
        }
        if self.judge.weights.values().all(|w| *w == 0.0) {
            return invalid("at least one judge weight must be positive".into());
        }

        let unit = |name: &str, v: f64| -> Result<(), PolicyError> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(PolicyError::Invalid(format!("{name} must be in [0, 1], got {v}")))
            }
        };
        unit("low_threshold", self.operators.low_threshold)?;
        unit("high_threshold", self.operators.high_threshold)?;
        unit("min_release_cmp", self.safety.min_release_cmp)?;
        unit("borderline_margin", self.safety.borderline_margin)?;
        if self.operators.low_threshold > self.operators.high_threshold {
            return invalid(format!(
                "low_threshold ({}) exceeds high_threshold ({})",
                self.operators.low_threshold, self.operators.high_threshold
            ));
        }

        let o = &self.orchestration;
        if o.max_iterations == 0 {
            return invalid("max_iterations must be at least 1".into());
        }
        if o.trajectories_per_iteration == 0 || o.max_parallel == 0 {
            return invalid("trajectories_per_iteration and max_parallel must be at least 1".into());
        }
        if o.max_parallel > MAX_PARALLEL {
            return invalid(format!("max_parallel must be at most {MAX_PARALLEL}, got {}", o.max_parallel));
        }
        if o.plateau_window == 0 {
            return invalid("plateau_window must be at least 1".into());
        }

        let non_negative = |name: &str, v: f64| -> Result<(), PolicyError> {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(PolicyError::Invalid(format!("{name} must be finite and non-negative, got {v}")))
            }
        };
        non_negative("plateau_epsilon", o.plateau_epsilon)?;
        non_negative("max_regression", self.safety.max_regression)?;
        non_negative("synthesis_cost", self.budget.synthesis_cost)?;
        non_negative("sandbox_cost_per_sec", self.budget.sandbox_cost_per_sec)?;
        if let Some(units) = self.budget.max_cost_units {
            non_negative("max_cost_units", units)?;
        }

        if self.sandbox.timeout.is_zero() || self.sandbox.memory_limit_bytes == 0 {
            return invalid("sandbox timeout and memory limit must be positive".into());
        }
        if !(self.sandbox.cpu_quota > 0.0) {
            return invalid("sandbox cpu_quota must be positive".into());
        }
        Ok(())
    }

    /// Effective parallelism for one batch.
    pub fn batch_parallelism(&self) -> usize {
        self.orchestration
            .max_parallel
            .min(self.orchestration.trajectories_per_iteration)
            .clamp(1, MAX_PARALLEL)
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_secs_f64()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            None => Ok(None),
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid duration {secs}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = EvolutionPolicy::default();
        policy.validate().unwrap();
        assert_eq!(policy.operators.low_threshold, 0.4);
        assert_eq!(policy.operators.high_threshold, 0.8);
        assert_eq!(policy.batch_parallelism(), 4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let policy: EvolutionPolicy =
            serde_json::from_str(r#"{"orchestration": {"max_iterations": 3}}"#).unwrap();
        assert_eq!(policy.orchestration.max_iterations, 3);
        assert_eq!(policy.orchestration.plateau_window, 3);
        assert_eq!(policy.safety.min_release_cmp, 0.7);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut policy = EvolutionPolicy::default();
        policy.operators.low_threshold = 0.9;
        assert!(matches!(policy.validate(), Err(PolicyError::Invalid(_))));
    }

    #[test]
    fn test_zero_weights_rejected() {
        let mut policy = EvolutionPolicy::default();
        for w in policy.judge.weights.values_mut() {
            *w = 0.0;
        }
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{"budget": {"max_wall_clock": 60.0}}"#).unwrap();
        let policy = EvolutionPolicy::from_json_file(&path).unwrap();
        assert_eq!(policy.budget.max_wall_clock, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_out_of_range_durations_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        for body in [
            r#"{"sandbox": {"timeout": 1e30}}"#,
            r#"{"budget": {"max_wall_clock": 1e300}}"#,
            r#"{"retry": {"backoff": -1.0}}"#,
        ] {
            std::fs::write(&path, body).unwrap();
            let result = std::panic::catch_unwind(|| EvolutionPolicy::from_json_file(&path));
            assert!(matches!(result, Ok(Err(PolicyError::Json(_)))), "{body}");
        }
    }

    #[test]
    fn test_non_finite_values_rejected() {
        let cases: [fn(&mut EvolutionPolicy); 5] = [
            |p| p.orchestration.plateau_epsilon = f64::NAN,
            |p| p.safety.max_regression = f64::NAN,
            |p| p.budget.synthesis_cost = f64::INFINITY,
            |p| p.budget.sandbox_cost_per_sec = -0.5,
            |p| p.budget.max_cost_units = Some(f64::NAN),
        ];
        for set in cases {
            let mut policy = EvolutionPolicy::default();
            set(&mut policy);
            assert!(matches!(policy.validate(), Err(PolicyError::Invalid(_))), "{:?}", policy);
        }
    }

    #[test]
    fn test_parallelism_capped() {
        let mut policy = EvolutionPolicy::default();
        policy.orchestration.max_parallel = MAX_PARALLEL + 1;
        assert!(matches!(policy.validate(), Err(PolicyError::Invalid(_))));

        policy.orchestration.max_parallel = MAX_PARALLEL;
        policy.orchestration.trajectories_per_iteration = 8;
        policy.validate().unwrap();
        assert_eq!(policy.batch_parallelism(), MAX_PARALLEL);
    }
}
