//! In-memory storage backends.

use async_trait::async_trait;
use evoloop_core::{
    IntegrityError, ResultFields, RunId, SafetyReport, Trajectory, TrajectoryFilter,
    TrajectoryId, TrajectoryStatus,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use crate::{KeyValueStore, Result, TrajectoryPool};

/// Indexed trajectory records with the pool's integrity rules.
///
/// Shared by every pool backend. Mutations are staged against `&self` first;
/// persistent backends write the staged record and only then `commit` it.
#[derive(Debug, Default, Clone)]
pub(crate) struct PoolIndex {
    records: HashMap<TrajectoryId, Trajectory>,
    order: Vec<TrajectoryId>,
}

impl PoolIndex {
    pub(crate) fn insert(&mut self, trajectory: Trajectory) -> Result<()> {
        self.stage_insert(&trajectory)?;
        self.commit(trajectory);
        Ok(())
    }

    pub(crate) fn stage_insert(&self, trajectory: &Trajectory) -> Result<()> {
        if self.records.contains_key(&trajectory.id) {
            return Err(IntegrityError::DuplicateId(trajectory.id).into());
        }
        trajectory.check_lineage()?;
        for parent in &trajectory.parent_ids {
            if !self.records.contains_key(parent) {
                return Err(IntegrityError::MissingParent {
                    child: trajectory.id,
                    parent: *parent,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Store a record as-is, appending it to creation order if new.
    ///
    /// Also loads records without integrity checks when a persistent
    /// backend opens.
    pub(crate) fn commit(&mut self, trajectory: Trajectory) {
        if self.records.insert(trajectory.id, trajectory.clone()).is_none() {
            self.order.push(trajectory.id);
        }
    }

    /// Re-establish creation order after loading.
    pub(crate) fn sort_by_creation(&mut self) {
        let records = &self.records;
        self.order
            .sort_by(|a, b| records[a].created_at.cmp(&records[b].created_at).then(a.cmp(b)));
    }

    pub(crate) fn update_status(
        &mut self,
        id: TrajectoryId,
        status: TrajectoryStatus,
        fields: ResultFields,
    ) -> Result<Trajectory> {
        let updated = self.stage_update_status(id, status, fields)?;
        self.commit(updated.clone());
        Ok(updated)
    }

    pub(crate) fn stage_update_status(
        &self,
        id: TrajectoryId,
        status: TrajectoryStatus,
        fields: ResultFields,
    ) -> Result<Trajectory> {
        let mut record = self
            .records
            .get(&id)
            .cloned()
            .ok_or(IntegrityError::UnknownTrajectory(id))?;
        record.transition(status, fields)?;
        Ok(record)
    }

    pub(crate) fn record_safety_report(
        &mut self,
        id: TrajectoryId,
        report: SafetyReport,
    ) -> Result<Trajectory> {
        let updated = self.stage_safety_report(id, report)?;
        self.commit(updated.clone());
        Ok(updated)
    }

    pub(crate) fn stage_safety_report(
        &self,
        id: TrajectoryId,
        report: SafetyReport,
    ) -> Result<Trajectory> {
        let mut record = self
            .records
            .get(&id)
            .cloned()
            .ok_or(IntegrityError::UnknownTrajectory(id))?;
        if record.status != TrajectoryStatus::SafetyReview || report.trajectory_id != id {
            return Err(IntegrityError::InvalidTransition {
                id,
                from: record.status,
                to: TrajectoryStatus::SafetyReview,
            }
            .into());
        }
        record.safety_reports.push(report);
        record.updated_at = chrono::Utc::now();
        Ok(record)
    }

    pub(crate) fn archive_generation(&mut self, run_id: RunId, generation: u32) -> Vec<Trajectory> {
        let changed = self.stage_archive(run_id, generation);
        for t in &changed {
            self.commit(t.clone());
        }
        changed
    }

    /// Archived copies of the generation's live records, in creation order.
    pub(crate) fn stage_archive(&self, run_id: RunId, generation: u32) -> Vec<Trajectory> {
        let now = chrono::Utc::now();
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|t| t.run_id == run_id && t.generation == generation && t.archived_at.is_none())
            .map(|t| {
                let mut archived = t.clone();
                archived.archived_at = Some(now);
                archived
            })
            .collect()
    }

    pub(crate) fn get(&self, id: TrajectoryId) -> Option<Trajectory> {
        self.records.get(&id).cloned()
    }

    pub(crate) fn query(&self, filter: &TrajectoryFilter) -> Vec<Trajectory> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

/// Trajectory pool held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryPool {
    index: PoolIndex,
}

impl InMemoryPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records (archived included).
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the pool holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TrajectoryPool for InMemoryPool {
    async fn insert(&mut self, trajectory: Trajectory) -> Result<()> {
        self.index.insert(trajectory)
    }

    async fn update_status(
        &mut self,
        id: TrajectoryId,
        status: TrajectoryStatus,
        fields: ResultFields,
    ) -> Result<Trajectory> {
        self.index.update_status(id, status, fields)
    }

    async fn record_safety_report(&mut self, id: TrajectoryId, report: SafetyReport) -> Result<()> {
        self.index.record_safety_report(id, report).map(|_| ())
    }

    async fn archive_generation(&mut self, run_id: RunId, generation: u32) -> Result<usize> {
        Ok(self.index.archive_generation(run_id, generation).len())
    }

    async fn get(&self, id: TrajectoryId) -> Result<Option<Trajectory>> {
        Ok(self.index.get(id))
    }

    async fn query(&self, filter: &TrajectoryFilter) -> Result<Vec<Trajectory>> {
        Ok(self.index.query(filter))
    }
}

/// Key/value store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: RwLock<BTreeMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl InMemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn put(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .entries
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn search(&self, namespace: &str, query: &str) -> Result<Vec<(String, serde_json::Value)>> {
        Ok(self
            .entries
            .read()
            .await
            .get(namespace)
            .map(|ns| {
                ns.iter()
                    .filter(|(k, _)| k.starts_with(query))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoloop_core::{CodeArtifact, OperatorKind, RiskLevel, SafetyDecision, SafetyReportId};

    fn seed(run: RunId) -> Trajectory {
        Trajectory::propose(run, "agent", 0, OperatorKind::Seed, vec![], CodeArtifact::new("x"), "seed")
    }

    fn child(run: RunId, parent: TrajectoryId) -> Trajectory {
        Trajectory::propose(
            run,
            "agent",
            1,
            OperatorKind::Refinement,
            vec![parent],
            CodeArtifact::new("y"),
            "refine",
        )
    }

    #[tokio::test]
    async fn test_insert_then_get_roundtrip() {
        let mut pool = InMemoryPool::new();
        let t = seed(RunId::new());
        pool.insert(t.clone()).await.unwrap();
        assert_eq!(pool.get(t.id).await.unwrap(), Some(t.clone()));

        let updated = pool
            .update_status(t.id, TrajectoryStatus::Executing, ResultFields::none())
            .await
            .unwrap();
        assert_eq!(pool.get(t.id).await.unwrap(), Some(updated.clone()));
        // Reads are idempotent.
        assert_eq!(pool.get(t.id).await.unwrap(), pool.get(t.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_parent_rejected() {
        let mut pool = InMemoryPool::new();
        let run = RunId::new();
        let err = pool.insert(child(run, TrajectoryId::new())).await.unwrap_err();
        assert!(matches!(err.as_integrity(), Some(IntegrityError::MissingParent { .. })));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let mut pool = InMemoryPool::new();
        let t = seed(RunId::new());
        pool.insert(t.clone()).await.unwrap();
        let err = pool.insert(t).await.unwrap_err();
        assert!(matches!(err.as_integrity(), Some(IntegrityError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn test_backward_transition_rejected() {
        let mut pool = InMemoryPool::new();
        let t = seed(RunId::new());
        pool.insert(t.clone()).await.unwrap();
        pool.update_status(t.id, TrajectoryStatus::Executing, ResultFields::none()).await.unwrap();
        pool.update_status(t.id, TrajectoryStatus::TimedOut, ResultFields::none()).await.unwrap();
        let err = pool
            .update_status(t.id, TrajectoryStatus::Executing, ResultFields::none())
            .await
            .unwrap_err();
        assert!(matches!(err.as_integrity(), Some(IntegrityError::InvalidTransition { .. })));
        assert_eq!(pool.get(t.id).await.unwrap().unwrap().status, TrajectoryStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_archive_excludes_from_default_query() {
        let mut pool = InMemoryPool::new();
        let run = RunId::new();
        let parent = seed(run);
        pool.insert(parent.clone()).await.unwrap();
        pool.insert(child(run, parent.id)).await.unwrap();

        assert_eq!(pool.archive_generation(run, 0).await.unwrap(), 1);
        assert_eq!(pool.archive_generation(run, 0).await.unwrap(), 0);

        let visible = pool.query(&TrajectoryFilter::default()).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].generation, 1);

        let all = pool
            .query(&TrajectoryFilter { include_archived: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_get_successful_best_first() {
        let mut pool = InMemoryPool::new();
        let run = RunId::new();
        let mut ids = Vec::new();
        for (cmp, fail) in [(0.6, false), (0.9, false), (0.95, true), (0.2, false)] {
            let t = seed(run);
            ids.push(t.id);
            pool.insert(t.clone()).await.unwrap();
            pool.update_status(t.id, TrajectoryStatus::Executing, ResultFields::none()).await.unwrap();
            if fail {
                pool.update_status(t.id, TrajectoryStatus::Failed, ResultFields::failure("x"))
                    .await
                    .unwrap();
                continue;
            }
            pool.update_status(t.id, TrajectoryStatus::Executed, ResultFields::none()).await.unwrap();
            pool.update_status(
                t.id,
                TrajectoryStatus::Judged,
                ResultFields { cmp_score: Some(cmp), ..Default::default() },
            )
            .await
            .unwrap();
        }
        let found = pool.get_successful(0.5).await.unwrap();
        let scores: Vec<_> = found.iter().map(|t| t.cmp_score.unwrap()).collect();
        assert_eq!(scores, vec![0.9, 0.6]);
    }

    #[tokio::test]
    async fn test_safety_reports_accumulate() {
        let mut pool = InMemoryPool::new();
        let t = seed(RunId::new());
        pool.insert(t.clone()).await.unwrap();

        let report = |decision| SafetyReport {
            id: SafetyReportId::new(),
            trajectory_id: t.id,
            risk_level: RiskLevel::Medium,
            decision,
            reasons: vec![],
            cmp_seen: Some(0.75),
            release_threshold: 0.7,
            created_at: chrono::Utc::now(),
        };

        // Not under review yet.
        assert!(pool.record_safety_report(t.id, report(SafetyDecision::Approve)).await.is_err());

        for s in [
            TrajectoryStatus::Executing,
            TrajectoryStatus::Executed,
            TrajectoryStatus::Judged,
            TrajectoryStatus::SafetyReview,
        ] {
            pool.update_status(t.id, s, ResultFields::none()).await.unwrap();
        }
        pool.record_safety_report(t.id, report(SafetyDecision::HoldForReview)).await.unwrap();
        pool.update_status(t.id, TrajectoryStatus::SafetyReview, ResultFields::none()).await.unwrap();
        pool.record_safety_report(t.id, report(SafetyDecision::Approve)).await.unwrap();

        let stored = pool.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.safety_reports.len(), 2);
        assert_eq!(stored.latest_safety_report().unwrap().decision, SafetyDecision::Approve);
    }

    #[tokio::test]
    async fn test_operator_stats() {
        let mut pool = InMemoryPool::new();
        let run = RunId::new();
        let parent = seed(run);
        pool.insert(parent.clone()).await.unwrap();
        let c = child(run, parent.id);
        pool.insert(c.clone()).await.unwrap();
        pool.update_status(c.id, TrajectoryStatus::Executing, ResultFields::none()).await.unwrap();
        pool.update_status(c.id, TrajectoryStatus::TimedOut, ResultFields::none()).await.unwrap();

        let stats = pool.operator_stats(&TrajectoryFilter::default()).await.unwrap();
        let refinement = stats.get(OperatorKind::Refinement);
        assert_eq!(refinement.attempts, 1);
        assert_eq!(refinement.timed_out, 1);
        assert_eq!(refinement.failure_rate(), 1.0);
        assert_eq!(stats.get(OperatorKind::Revision).attempts, 0);
    }

    #[tokio::test]
    async fn test_kv_prefix_search() {
        let store = InMemoryKvStore::new();
        store.put("ck", "alpha/1", serde_json::json!(1)).await.unwrap();
        store.put("ck", "alpha/2", serde_json::json!(2)).await.unwrap();
        store.put("ck", "beta/1", serde_json::json!(3)).await.unwrap();
        let found = store.search("ck", "alpha/").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(store.get("ck", "beta/1").await.unwrap(), Some(serde_json::json!(3)));
        assert!(store.get("other", "beta/1").await.unwrap().is_none());
    }
}
