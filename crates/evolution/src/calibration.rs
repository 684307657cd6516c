//! Warm-start calibration records.
//!
//! A warm start from a higher tier is expected to converge sooner. Every
//! warm-started run stores the expected and the observed improvement so the
//! estimate can be checked later.

use evoloop_core::{QualityTier, RunId, Time};
use evoloop_storage::{KeyValueStore, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const NAMESPACE: &str = "calibration";

/// Expected and observed effect of one warm start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Run that was warm-started
    pub run_id: RunId,
    /// Agent evolved
    pub agent_name: String,
    /// Tier of the seeding checkpoint, `None` for a cold start
    pub checkpoint_tier: Option<QualityTier>,
    /// CMP of the seed when first scored
    pub seed_cmp: Option<f64>,
    /// Predicted fraction of the iteration cap saved
    pub expected_improvement: f64,
    /// Observed fraction of the iteration cap saved
    pub actual_improvement: f64,
    /// Iterations the run took
    pub iterations: u32,
    /// When the record was written
    pub created_at: Time,
}

impl CalibrationRecord {
    /// Build a record for a finished run.
    pub fn new(
        run_id: RunId,
        agent_name: impl Into<String>,
        checkpoint_tier: Option<QualityTier>,
        seed_cmp: Option<f64>,
        iterations: u32,
        max_iterations: u32,
    ) -> Self {
        Self {
            run_id,
            agent_name: agent_name.into(),
            checkpoint_tier,
            seed_cmp,
            expected_improvement: expected_improvement(checkpoint_tier),
            actual_improvement: actual_improvement(iterations, max_iterations),
            iterations,
            created_at: chrono::Utc::now(),
        }
    }

    /// Observed minus expected.
    pub fn error(&self) -> f64 {
        self.actual_improvement - self.expected_improvement
    }
}

/// Predicted fraction of the iteration cap a warm start saves.
pub fn expected_improvement(tier: Option<QualityTier>) -> f64 {
    match tier {
        Some(QualityTier::Excellent) => 0.5,
        Some(QualityTier::Good) => 0.3,
        Some(QualityTier::Fair) => 0.15,
        Some(QualityTier::Poor) | None => 0.0,
    }
}

/// Fraction of the iteration cap left unused.
pub fn actual_improvement(iterations: u32, max_iterations: u32) -> f64 {
    if max_iterations == 0 {
        return 0.0;
    }
    (1.0 - iterations as f64 / max_iterations as f64).clamp(0.0, 1.0)
}

/// Calibration records, persisted through a [`KeyValueStore`].
pub struct CalibrationStore {
    kv: Arc<dyn KeyValueStore>,
}

impl CalibrationStore {
    /// Create a store over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Persist `record`.
    pub async fn record(&self, record: &CalibrationRecord) -> Result<(), StorageError> {
        let key = format!("{}/{}", record.agent_name, record.run_id);
        self.kv.put(NAMESPACE, &key, serde_json::to_value(record)?).await?;
        info!(
            agent = %record.agent_name,
            run = %record.run_id,
            expected = record.expected_improvement,
            actual = record.actual_improvement,
            "Calibration recorded"
        );
        Ok(())
    }

    /// Every record of `agent_name`, ordered by run id.
    pub async fn history(&self, agent_name: &str) -> Result<Vec<CalibrationRecord>, StorageError> {
        let entries = self.kv.search(NAMESPACE, &format!("{}/", agent_name)).await?;
        entries
            .into_iter()
            .map(|(_, v)| serde_json::from_value(v).map_err(StorageError::from))
            .collect()
    }
}
