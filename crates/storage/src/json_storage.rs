//! JSON file storage implementation.
//!
//! Stores one JSON file per trajectory under `trajectories/` and keeps small
//! per-object meta markers (version + updated_at) under `meta/`. The key/value
//! store keeps one file per key under `kv/<namespace>/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evoloop_core::{
    ResultFields, RunId, SafetyReport, Trajectory, TrajectoryFilter, TrajectoryId,
    TrajectoryStatus,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use crate::memory::PoolIndex;
use crate::{KeyValueStore, Result, TrajectoryPool};

/// Per-record version marker stored next to each trajectory file.
#[derive(Debug, Serialize, Deserialize)]
struct RecordMeta {
    version: u64,
    updated_at: DateTime<Utc>,
}

/// File-backed trajectory pool.
///
/// The whole pool is indexed in memory on open. Every mutation is written to
/// disk first and reaches the index only once the write succeeded, so a
/// failed write leaves the pool as it was.
pub struct JsonTrajectoryPool {
    root: PathBuf,
    index: PoolIndex,
    versions: HashMap<TrajectoryId, u64>,
}

impl JsonTrajectoryPool {
    /// Open (or create) a pool rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("trajectories")).await?;
        fs::create_dir_all(root.join("meta").join("trajectories")).await?;

        let mut pool = Self {
            root,
            index: PoolIndex::default(),
            versions: HashMap::new(),
        };
        let stored: Vec<Trajectory> = list_dir(&pool.root.join("trajectories")).await?;
        let count = stored.len();
        for t in stored {
            let meta: Option<RecordMeta> = match read_json(&pool.meta_path(t.id)).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(id = %t.id, error = %e, "Unreadable version marker");
                    None
                }
            };
            match meta {
                Some(meta) => {
                    if meta.updated_at < t.updated_at {
                        warn!(id = %t.id, version = meta.version, "Version marker older than record");
                    }
                    pool.versions.insert(t.id, meta.version);
                }
                None => warn!(id = %t.id, "Record has no version marker"),
            }
            pool.index.commit(t);
        }
        pool.index.sort_by_creation();
        debug!(root = %pool.root.display(), records = count, "Opened trajectory pool");

        Ok(pool)
    }

    fn trajectory_path(&self, id: TrajectoryId) -> PathBuf {
        self.root.join("trajectories").join(format!("{}.json", id))
    }

    fn meta_path(&self, id: TrajectoryId) -> PathBuf {
        self.root
            .join("meta")
            .join("trajectories")
            .join(format!("{}.meta.json", id))
    }

    /// Persist a staged record, then commit it to the index.
    async fn persist(&mut self, trajectory: Trajectory) -> Result<()> {
        let json = serde_json::to_string_pretty(&trajectory)?;
        write_atomic(&self.trajectory_path(trajectory.id), json.as_bytes()).await?;

        let version = self.version(trajectory.id) + 1;
        let meta = RecordMeta {
            version,
            updated_at: trajectory.updated_at,
        };
        // The record itself is durable at this point.
        let marker = serde_json::to_string_pretty(&meta)?;
        if let Err(e) = write_atomic(&self.meta_path(trajectory.id), marker.as_bytes()).await {
            warn!(id = %trajectory.id, error = %e, "Failed to write version marker");
        }
        self.versions.insert(trajectory.id, version);
        self.index.commit(trajectory);
        Ok(())
    }

    /// Number of writes a record has seen (0 if never written).
    ///
    /// Survives reopening through the `meta/` markers.
    pub fn version(&self, id: TrajectoryId) -> u64 {
        self.versions.get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TrajectoryPool for JsonTrajectoryPool {
    async fn insert(&mut self, trajectory: Trajectory) -> Result<()> {
        self.index.stage_insert(&trajectory)?;
        self.persist(trajectory).await
    }

    async fn update_status(
        &mut self,
        id: TrajectoryId,
        status: TrajectoryStatus,
        fields: ResultFields,
    ) -> Result<Trajectory> {
        let updated = self.index.stage_update_status(id, status, fields)?;
        self.persist(updated.clone()).await?;
        Ok(updated)
    }

    async fn record_safety_report(&mut self, id: TrajectoryId, report: SafetyReport) -> Result<()> {
        let updated = self.index.stage_safety_report(id, report)?;
        self.persist(updated).await
    }

    async fn archive_generation(&mut self, run_id: RunId, generation: u32) -> Result<usize> {
        let changed = self.index.stage_archive(run_id, generation);
        let count = changed.len();
        // Records already written stay committed if a later write fails.
        for t in changed {
            self.persist(t).await?;
        }
        Ok(count)
    }

    async fn get(&self, id: TrajectoryId) -> Result<Option<Trajectory>> {
        Ok(self.index.get(id))
    }

    async fn query(&self, filter: &TrajectoryFilter) -> Result<Vec<Trajectory>> {
        Ok(self.index.query(filter))
    }
}

/// One stored key/value entry.
#[derive(Debug, Serialize, Deserialize)]
struct KvEntry {
    key: String,
    value: serde_json::Value,
}

/// File-backed key/value store.
pub struct JsonKvStore {
    root: PathBuf,
    // Serializes writers so a put never interleaves with another put.
    write_lock: Mutex<()>,
}

impl JsonKvStore {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("kv")).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("kv").join(encode_component(namespace))
    }

    fn entry_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.json", encode_component(key)))
    }
}

#[async_trait]
impl KeyValueStore for JsonKvStore {
    async fn put(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(self.namespace_dir(namespace)).await?;
        let entry = KvEntry {
            key: key.to_string(),
            value,
        };
        let json = serde_json::to_string_pretty(&entry)?;
        write_atomic(&self.entry_path(namespace, key), json.as_bytes()).await?;
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let entry: Option<KvEntry> = read_json(&self.entry_path(namespace, key)).await?;
        Ok(entry.map(|e| e.value))
    }

    async fn search(&self, namespace: &str, query: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let dir = self.namespace_dir(namespace);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let entries: Vec<KvEntry> = list_dir(&dir).await?;
        let mut found: Vec<(String, serde_json::Value)> = entries
            .into_iter()
            .filter(|e| e.key.starts_with(query))
            .map(|e| (e.key, e.value))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

/// Percent-encode anything outside `[A-Za-z0-9._-]` so keys map to flat file names.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    if out.is_empty() || out.starts_with('.') {
        out.insert_str(0, "%");
    }
    out
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&entry.path()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "Skipping unreadable record"),
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoloop_core::{CodeArtifact, IntegrityError, OperatorKind};

    fn seed(run: RunId) -> Trajectory {
        Trajectory::propose(run, "agent", 0, OperatorKind::Seed, vec![], CodeArtifact::new("x"), "seed")
    }

    #[tokio::test]
    async fn test_pool_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunId::new();
        let t = seed(run);
        {
            let mut pool = JsonTrajectoryPool::open(dir.path()).await.unwrap();
            pool.insert(t.clone()).await.unwrap();
            pool.update_status(t.id, TrajectoryStatus::Executing, ResultFields::none())
                .await
                .unwrap();
            assert_eq!(pool.version(t.id), 2);
        }

        let pool = JsonTrajectoryPool::open(dir.path()).await.unwrap();
        let loaded = pool.get(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TrajectoryStatus::Executing);
        assert_eq!(loaded.code_artifact, t.code_artifact);
        assert_eq!(pool.version(t.id), 2);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_pool_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunId::new();
        let parent = seed(run);
        let child = Trajectory::propose(
            run,
            "agent",
            1,
            OperatorKind::Revision,
            vec![parent.id],
            CodeArtifact::new("y"),
            "child",
        );
        let mut pool = JsonTrajectoryPool::open(dir.path()).await.unwrap();
        pool.insert(parent.clone()).await.unwrap();

        // A plain file where the records directory should be fails every write.
        let records = dir.path().join("trajectories");
        let moved = dir.path().join("trajectories.bak");
        std::fs::rename(&records, &moved).unwrap();
        std::fs::write(&records, b"").unwrap();

        assert!(pool.insert(child.clone()).await.is_err());
        assert!(pool
            .update_status(parent.id, TrajectoryStatus::Executing, ResultFields::none())
            .await
            .is_err());
        assert!(pool.archive_generation(run, 0).await.is_err());

        assert!(pool.get(child.id).await.unwrap().is_none());
        let kept = pool.get(parent.id).await.unwrap().unwrap();
        assert_eq!(kept.status, TrajectoryStatus::Proposed);
        assert!(kept.archived_at.is_none());
        assert_eq!(pool.version(parent.id), 1);

        std::fs::remove_file(&records).unwrap();
        std::fs::rename(&moved, &records).unwrap();

        let reopened = JsonTrajectoryPool::open(dir.path()).await.unwrap();
        assert_eq!(reopened.query(&TrajectoryFilter::default()).await.unwrap().len(), 1);
        assert_eq!(reopened.get(parent.id).await.unwrap().unwrap().status, TrajectoryStatus::Proposed);

        // The original handle was not poisoned by the failures.
        pool.insert(child.clone()).await.unwrap();
        pool.update_status(parent.id, TrajectoryStatus::Executing, ResultFields::none())
            .await
            .unwrap();
        assert_eq!(pool.version(parent.id), 2);
    }

    #[tokio::test]
    async fn test_integrity_error_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = JsonTrajectoryPool::open(dir.path()).await.unwrap();
        let t = seed(RunId::new());
        pool.insert(t.clone()).await.unwrap();
        let err = pool
            .update_status(t.id, TrajectoryStatus::Approved, ResultFields::none())
            .await
            .unwrap_err();
        assert!(matches!(err.as_integrity(), Some(IntegrityError::InvalidTransition { .. })));
        assert_eq!(pool.version(t.id), 1);
    }

    #[tokio::test]
    async fn test_kv_roundtrip_with_awkward_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonKvStore::open(dir.path()).await.unwrap();
        store.put("checkpoints", "agent a/00000001", serde_json::json!({"v": 1})).await.unwrap();
        store.put("checkpoints", "agent a/00000002", serde_json::json!({"v": 2})).await.unwrap();
        store.put("checkpoints", "agent b/00000001", serde_json::json!({"v": 3})).await.unwrap();

        let found = store.search("checkpoints", "agent a/").await.unwrap();
        let keys: Vec<_> = found.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["agent a/00000001", "agent a/00000002"]);
        assert_eq!(
            store.get("checkpoints", "agent b/00000001").await.unwrap(),
            Some(serde_json::json!({"v": 3}))
        );
        assert!(store.search("missing", "").await.unwrap().is_empty());
    }

    #[test]
    fn test_encode_component() {
        assert_eq!(encode_component("a/b c"), "a%2Fb%20c");
        assert_eq!(encode_component("plain-key_1.x"), "plain-key_1.x");
        assert_eq!(encode_component(".."), "%..");
    }
}
