//! Checkpoints - promoted versions used for warm starts.

use serde::{Deserialize, Serialize};
use crate::id::{CheckpointId, RunId, TrajectoryId};
use crate::trajectory::CodeArtifact;
use crate::Time;

/// Quality tier derived from a checkpoint's success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// success rate < 0.5
    Poor,
    /// success rate >= 0.5
    Fair,
    /// success rate >= 0.7
    Good,
    /// success rate >= 0.9
    Excellent,
}

impl QualityTier {
    /// Tier for a success rate in [0, 1].
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= 0.9 {
            QualityTier::Excellent
        } else if rate >= 0.7 {
            QualityTier::Good
        } else if rate >= 0.5 {
            QualityTier::Fair
        } else {
            QualityTier::Poor
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            QualityTier::Poor => "poor",
            QualityTier::Fair => "fair",
            QualityTier::Good => "good",
            QualityTier::Excellent => "excellent",
        })
    }
}

impl std::str::FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "poor" => Ok(QualityTier::Poor),
            "fair" => Ok(QualityTier::Fair),
            "good" => Ok(QualityTier::Good),
            "excellent" => Ok(QualityTier::Excellent),
            other => Err(format!("unknown quality tier: {other}")),
        }
    }
}

/// Metrics captured when a checkpoint is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    /// Benchmark pass rate (drives the quality tier)
    pub success_rate: f64,
    /// CMP score of the promoted trajectory
    pub cmp_score: f64,
    /// Benchmark total score, if benchmarked
    pub benchmark_score: Option<f64>,
    /// Iterations the producing run took
    pub iterations: u32,
}

/// A promoted, approved version of an agent's code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier
    pub id: CheckpointId,
    /// Agent the code belongs to
    pub agent_name: String,
    /// Monotonic per-agent version
    pub version: u32,
    /// Approved trajectory backing this checkpoint
    pub code_reference: TrajectoryId,
    /// Run that produced it
    pub run_id: RunId,
    /// The promoted code
    pub code_artifact: CodeArtifact,
    /// Captured metrics
    pub metrics: CheckpointMetrics,
    /// Tier derived from `metrics.success_rate`
    pub quality_tier: QualityTier,
    /// Creation time
    pub created_at: Time,
}
