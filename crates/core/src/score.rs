//! Judge and benchmark scores.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rule for collapsing dimension scores into one composite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Sum of weight * score over sum of weights
    #[default]
    WeightedMean,
    /// Weakest dimension (weights only select which dimensions count)
    Minimum,
    /// exp(sum(w * ln(score)) / sum(w)); any zero dimension yields zero
    WeightedGeometricMean,
}

impl Aggregation {
    /// Aggregate `dimensions` under `weights`.
    ///
    /// Dimensions with no weight entry or a zero weight are ignored. Returns
    /// `None` when no dimension carries weight or a score is not finite.
    pub fn aggregate(
        self,
        dimensions: &BTreeMap<String, f64>,
        weights: &BTreeMap<String, f64>,
    ) -> Option<f64> {
        let weighted: Vec<(f64, f64)> = dimensions
            .iter()
            .filter_map(|(name, score)| {
                let w = *weights.get(name)?;
                (w > 0.0).then_some((w, *score))
            })
            .collect();

        if weighted.is_empty() || weighted.iter().any(|(_, s)| !s.is_finite()) {
            return None;
        }

        let total_weight: f64 = weighted.iter().map(|(w, _)| w).sum();
        let value = match self {
            Aggregation::WeightedMean => {
                weighted.iter().map(|(w, s)| w * s).sum::<f64>() / total_weight
            }
            Aggregation::Minimum => weighted
                .iter()
                .map(|(_, s)| *s)
                .fold(f64::INFINITY, f64::min),
            Aggregation::WeightedGeometricMean => {
                if weighted.iter().any(|(_, s)| *s <= 0.0) {
                    0.0
                } else {
                    (weighted.iter().map(|(w, s)| w * s.ln()).sum::<f64>() / total_weight).exp()
                }
            }
        };
        Some(value.clamp(0.0, 1.0))
    }
}

/// Multi-dimensional judge output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeScore {
    /// Named dimension scores in [0, 1]
    pub dimensions: BTreeMap<String, f64>,
    /// Composite (CMP) score in [0, 1]
    pub cmp: f64,
    /// Rule that produced `cmp`
    pub aggregation: Aggregation,
}

impl JudgeScore {
    /// The lowest-scoring dimension, if any.
    pub fn weakest_dimension(&self) -> Option<(&str, f64)> {
        self.dimensions
            .iter()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(name, score)| (name.as_str(), *score))
    }
}

/// Result of one benchmark task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Task passed
    Pass,
    /// Task failed
    Fail,
    /// Task produced a numeric score in [0, 1]
    Numeric(f64),
}

impl TaskOutcome {
    /// Numeric value in [0, 1].
    pub fn value(self) -> f64 {
        match self {
            TaskOutcome::Pass => 1.0,
            TaskOutcome::Fail => 0.0,
            TaskOutcome::Numeric(v) => v.clamp(0.0, 1.0),
        }
    }

    /// Whether the task counts as passed (numeric scores pass at >= 0.5).
    pub fn passed(self) -> bool {
        self.value() >= 0.5
    }
}

/// Result of running a benchmark suite against one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Suite that was run
    pub suite_id: String,
    /// Suite version
    pub suite_version: u32,
    /// Per-task outcome, keyed by task id
    pub task_scores: BTreeMap<String, TaskOutcome>,
    /// Aggregated score in [0, 1]
    pub total_score: f64,
    /// Tasks whose repeated runs disagreed
    pub non_reproducible: Vec<String>,
}

impl BenchmarkResult {
    /// Whether every repeated task agreed with itself.
    pub fn is_reproducible(&self) -> bool {
        self.non_reproducible.is_empty()
    }

    /// Fraction of tasks that passed.
    pub fn pass_rate(&self) -> f64 {
        if self.task_scores.is_empty() {
            return 0.0;
        }
        let passed = self.task_scores.values().filter(|o| o.passed()).count();
        passed as f64 / self.task_scores.len() as f64
    }
}
