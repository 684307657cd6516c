//! Checkpoint persistence and warm-start selection.

use evoloop_core::{Checkpoint, CheckpointId, CheckpointMetrics, QualityTier, Trajectory, TrajectoryStatus};
use evoloop_quality::PromotionApproval;
use evoloop_storage::{KeyValueStore, StorageError};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use crate::cache::ArtifactCache;

const NAMESPACE: &str = "checkpoints";
const CACHE_CAPACITY: usize = 16;

/// Errors reading or writing checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Persistence collaborator failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Stored value could not be decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The approval was issued for another trajectory
    #[error("approval for {approved} cannot promote {given}")]
    ApprovalMismatch {
        /// Trajectory the approval covers
        approved: evoloop_core::TrajectoryId,
        /// Trajectory offered for promotion
        given: evoloop_core::TrajectoryId,
    },

    /// The trajectory has not reached APPROVED
    #[error("trajectory {id} is {status}, not APPROVED")]
    NotApproved {
        /// Trajectory
        id: evoloop_core::TrajectoryId,
        /// Its status
        status: TrajectoryStatus,
    },

    /// Agent names are used as key prefixes
    #[error("invalid agent name: {0:?}")]
    InvalidAgentName(String),
}

/// Result alias for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Checkpoints of every agent, persisted through a [`KeyValueStore`].
pub struct CheckpointStore {
    kv: Arc<dyn KeyValueStore>,
    cache: Mutex<ArtifactCache<Vec<Checkpoint>>>,
}

impl CheckpointStore {
    /// Create a store over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            kv,
            cache: Mutex::new(ArtifactCache::new(capacity)),
        }
    }

    /// Promote an approved trajectory.
    ///
    /// The approval token is the only way in: it must have been issued for
    /// this trajectory, which must already be APPROVED in the pool.
    pub async fn save(
        &self,
        approval: &PromotionApproval,
        trajectory: &Trajectory,
        metrics: CheckpointMetrics,
    ) -> Result<Checkpoint> {
        if approval.trajectory_id() != trajectory.id {
            return Err(CheckpointError::ApprovalMismatch {
                approved: approval.trajectory_id(),
                given: trajectory.id,
            });
        }
        if trajectory.status != TrajectoryStatus::Approved {
            return Err(CheckpointError::NotApproved {
                id: trajectory.id,
                status: trajectory.status,
            });
        }
        check_agent_name(&trajectory.agent_name)?;

        // Held across the read-modify-write so versions stay monotonic.
        let mut cache = self.cache.lock().await;
        let existing = self.load(&trajectory.agent_name).await?;
        let version = existing.last().map(|c| c.version + 1).unwrap_or(1);

        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            agent_name: trajectory.agent_name.clone(),
            version,
            code_reference: trajectory.id,
            run_id: trajectory.run_id,
            code_artifact: trajectory.code_artifact.clone(),
            quality_tier: QualityTier::from_success_rate(metrics.success_rate),
            metrics,
            created_at: chrono::Utc::now(),
        };

        self.kv
            .put(NAMESPACE, &key(&checkpoint.agent_name, version), serde_json::to_value(&checkpoint)?)
            .await?;
        cache.remove(&checkpoint.agent_name);

        info!(
            agent = %checkpoint.agent_name,
            version,
            tier = %checkpoint.quality_tier,
            trajectory = %trajectory.id,
            "Checkpoint written"
        );
        Ok(checkpoint)
    }

    /// Every checkpoint of `agent_name`, oldest version first.
    pub async fn list(&self, agent_name: &str) -> Result<Vec<Checkpoint>> {
        check_agent_name(agent_name)?;
        let mut cache = self.cache.lock().await;
        if let Some(hit) = cache.get(agent_name) {
            return Ok(hit.as_ref().clone());
        }
        let loaded = self.load(agent_name).await?;
        cache.insert(agent_name, loaded.clone());
        Ok(loaded)
    }

    /// Highest success rate among checkpoints at or above `min_tier`.
    /// Ties go to the most recent.
    pub async fn best_checkpoint(&self, agent_name: &str, min_tier: QualityTier) -> Result<Option<Checkpoint>> {
        let all = self.list(agent_name).await?;
        let best = all
            .into_iter()
            .filter(|c| c.quality_tier >= min_tier)
            .max_by(|a, b| {
                a.metrics
                    .success_rate
                    .total_cmp(&b.metrics.success_rate)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.version.cmp(&b.version))
            });
        debug!(agent = agent_name, %min_tier, found = best.is_some(), "Warm-start lookup");
        Ok(best)
    }

    async fn load(&self, agent_name: &str) -> Result<Vec<Checkpoint>> {
        let entries = self.kv.search(NAMESPACE, &format!("{}/", agent_name)).await?;
        let mut checkpoints = entries
            .into_iter()
            .map(|(_, v)| serde_json::from_value::<Checkpoint>(v))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        checkpoints.sort_by_key(|c| c.version);
        Ok(checkpoints)
    }
}

fn key(agent_name: &str, version: u32) -> String {
    format!("{}/{:08}", agent_name, version)
}

fn check_agent_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(CheckpointError::InvalidAgentName(name.to_string()));
    }
    Ok(())
}
