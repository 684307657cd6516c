//! Storage trait abstractions.

use async_trait::async_trait;
use evoloop_core::{
    IntegrityError, ResultFields, RunId, SafetyReport, Trajectory, TrajectoryFilter,
    TrajectoryId, TrajectoryStatus,
};
use crate::stats::OperatorStats;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A pool invariant was violated (programming error)
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// The integrity violation, if this is one.
    pub fn as_integrity(&self) -> Option<&IntegrityError> {
        match self {
            StorageError::Integrity(e) => Some(e),
            _ => None,
        }
    }
}

/// The durable record of every evolution attempt.
///
/// Mutating methods take `&mut self`: whoever owns the pool value is its
/// single writer. Readers borrow it immutably and never mutate records.
/// Records are never deleted; archiving only sets `archived_at`.
#[async_trait]
pub trait TrajectoryPool: Send + Sync {
    /// Insert a new trajectory.
    ///
    /// Fails with an integrity error on a duplicate id, a missing parent, or
    /// a parent count that does not match the operator.
    async fn insert(&mut self, trajectory: Trajectory) -> Result<()>;

    /// Move a trajectory to `status`, merging `fields`. Returns the updated record.
    async fn update_status(
        &mut self,
        id: TrajectoryId,
        status: TrajectoryStatus,
        fields: ResultFields,
    ) -> Result<Trajectory>;

    /// Append a safety report to a trajectory under review.
    async fn record_safety_report(&mut self, id: TrajectoryId, report: SafetyReport) -> Result<()>;

    /// Archive every record of one generation of a run. Returns how many changed.
    async fn archive_generation(&mut self, run_id: RunId, generation: u32) -> Result<usize>;

    /// Load a trajectory by ID (archived or not).
    async fn get(&self, id: TrajectoryId) -> Result<Option<Trajectory>>;

    /// List trajectories matching the filter, oldest first.
    async fn query(&self, filter: &TrajectoryFilter) -> Result<Vec<Trajectory>>;

    /// Historical successes: scored at or above `min_score` and not failed,
    /// timed out or rejected. Includes archived records. Best first.
    async fn get_successful(&self, min_score: f64) -> Result<Vec<Trajectory>> {
        let filter = TrajectoryFilter {
            min_cmp: Some(min_score),
            include_archived: true,
            ..Default::default()
        };
        let mut found: Vec<Trajectory> = self
            .query(&filter)
            .await?
            .into_iter()
            .filter(|t| {
                !matches!(
                    t.status,
                    TrajectoryStatus::Failed | TrajectoryStatus::TimedOut | TrajectoryStatus::Rejected
                )
            })
            .collect();
        evoloop_core::ranking::sort_best_first(&mut found);
        Ok(found)
    }

    /// Per-operator outcome statistics over the records matching `filter`.
    async fn operator_stats(&self, filter: &TrajectoryFilter) -> Result<OperatorStats> {
        let records = self.query(filter).await?;
        Ok(OperatorStats::from_trajectories(&records))
    }
}

/// Key/value persistence collaborator.
///
/// The engine keeps checkpoints and cross-run knowledge here and never
/// assumes a particular storage engine behind it.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `namespace/key`, replacing any previous value.
    async fn put(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// Load the value under `namespace/key`.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Entries of `namespace` whose key starts with `query`, ordered by key.
    async fn search(&self, namespace: &str, query: &str) -> Result<Vec<(String, serde_json::Value)>>;
}
