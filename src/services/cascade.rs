//! Cascading soft delete
//!
//! A [`CascadeChain`] is an ordered list of levels: a root collection, then
//! collections whose documents reference the previous level by id. Archiving
//! a root walks the chain depth-first, parent before children:
//!
//! ```text
//! users/u1            archived first
//!   runs/r1           archived, then its trials discovered
//!     trials/t1..t3
//!   runs/r2
//!     trials/t4..t6
//! ```
//!
//! so an observer never sees an archived descendant under a live ancestor.
//! Each level's writes are chunked to the batch limit and committed one
//! batch at a time. Batches are not transactional with each other: a failed
//! batch aborts the cascade, and re-running it is safe because archiving is
//! idempotent.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::events::{EventBus, HierarchyEvent};
use crate::config::{validate_chain, Config, LevelDescriptor};
use crate::entities::{decode, DescendantEntity};
use crate::error::{OrgSyncError, Result};
use crate::store::{chunk_ops, DocPath, DocumentStore, FieldPath, WriteBatch, WriteOp};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainLevel {
    collection: String,
    parent_field: Option<FieldPath>,
}

/// Validated, ordered level list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeChain {
    name: String,
    levels: Vec<ChainLevel>,
}

impl CascadeChain {
    pub fn new(name: &str, descriptors: &[LevelDescriptor]) -> Result<Self> {
        validate_chain(name, descriptors)?;
        Ok(Self {
            name: name.to_string(),
            levels: descriptors
                .iter()
                .map(|d| ChainLevel {
                    collection: d.collection.clone(),
                    parent_field: d.parent_field.as_deref().map(FieldPath::from),
                })
                .collect(),
        })
    }

    /// Look up a named chain in the configuration
    pub fn from_config(config: &Config, name: &str) -> Result<Self> {
        Self::new(name, config.chain(name)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_collection(&self) -> &str {
        &self.levels[0].collection
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().map(|l| l.collection.as_str())
    }

    /// Collection and parent field of the level at `depth`; `None` for the root
    /// and past the last level
    pub fn child_level(&self, depth: usize) -> Option<(&str, &FieldPath)> {
        let level = self.levels.get(depth)?;
        Some((level.collection.as_str(), level.parent_field.as_ref()?))
    }
}

/// Documents archived at one level
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelCount {
    pub collection: String,
    pub archived: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeResult {
    pub chain: String,
    pub root: DocPath,
    /// False when the root no longer existed
    pub root_archived: bool,
    /// Descendants archived, one entry per non-root level
    pub archived_per_level: Vec<LevelCount>,
    pub batches_committed: usize,
}

impl CascadeResult {
    /// Root plus every descendant archived
    pub fn total_archived(&self) -> usize {
        usize::from(self.root_archived)
            + self
                .archived_per_level
                .iter()
                .map(|l| l.archived)
                .sum::<usize>()
    }
}

/// Marks a root document and its chain descendants archived
pub struct CascadeSoftDeleteService {
    store: Arc<dyn DocumentStore>,
    config: Arc<Config>,
    events: Arc<EventBus>,
}

impl CascadeSoftDeleteService {
    pub fn new(store: Arc<dyn DocumentStore>, config: Arc<Config>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Effective batch size: the configured limit capped by the provider's
    pub fn batch_limit(&self) -> usize {
        self.config.batch_limit.min(self.store.max_batch_ops())
    }

    /// Archive `root_id` in the chain's root collection and everything below it
    pub async fn cascade_archive(&self, chain: &CascadeChain, root_id: &str) -> Result<CascadeResult> {
        if root_id.trim().is_empty() {
            return Err(OrgSyncError::Validation("cascade root id must not be blank".into()));
        }

        let limit = self.batch_limit();
        if limit == 0 {
            return Err(OrgSyncError::Validation("batch limit must be at least 1".into()));
        }
        let archived_field = self.config.archived_field();
        let root = DocPath::new(chain.root_collection(), root_id);

        let mut batches_committed = 0;
        let root_archived = if self.store.get(&root).await?.is_some() {
            let mut batch = WriteBatch::new(limit);
            batch.push(archive_op(&root, &archived_field))?;
            batch.commit(self.store.as_ref()).await?;
            batches_committed += 1;
            debug!(path = %root, "Cascade root archived");
            true
        } else {
            warn!(path = %root, "Cascade root absent; archiving descendants only");
            false
        };

        let mut archived_per_level: Vec<LevelCount> = chain
            .levels
            .iter()
            .skip(1)
            .map(|l| LevelCount {
                collection: l.collection.clone(),
                archived: 0,
            })
            .collect();

        // Depth-first, parent before children
        let mut pending: Vec<(usize, String)> = vec![(1, root_id.to_string())];
        while let Some((depth, parent_id)) = pending.pop() {
            let Some((collection, parent_field)) = chain.child_level(depth) else {
                continue;
            };

            let children = self
                .store
                .query(collection, parent_field, &Value::String(parent_id.clone()))
                .await?;
            if children.is_empty() {
                continue;
            }

            for child in &children {
                decode::<DescendantEntity>(&child.path, &child.data)?;
            }
            let ops = children
                .iter()
                .map(|child| archive_op(&child.path, &archived_field))
                .collect();
            for (chunk, batch) in chunk_ops(ops, limit)?.into_iter().enumerate() {
                let size = batch.len();
                if let Err(e) = batch.commit(self.store.as_ref()).await {
                    error!(
                        chain = %chain.name,
                        collection = %collection,
                        parent_id = %parent_id,
                        chunk,
                        error = %e,
                        "Cascade batch failed; cascade must be re-run"
                    );
                    return Err(e);
                }
                batches_committed += 1;
                debug!(collection = %collection, parent_id = %parent_id, chunk, size, "Cascade batch committed");
            }
            archived_per_level[depth - 1].archived += children.len();

            if depth + 1 < chain.depth() {
                for child in children.iter().rev() {
                    pending.push((depth + 1, child.path.id().to_string()));
                }
            }
        }

        let result = CascadeResult {
            chain: chain.name.clone(),
            root,
            root_archived,
            archived_per_level,
            batches_committed,
        };

        info!(
            chain = %result.chain,
            root = %result.root,
            archived = result.total_archived(),
            batches = result.batches_committed,
            "Cascade completed"
        );
        self.events.emit(HierarchyEvent::CascadeCompleted {
            chain: result.chain.clone(),
            root: result.root.clone(),
            archived: result.total_archived(),
        });
        Ok(result)
    }

    /// Cascade through the chain named in the configuration
    pub async fn cascade_archive_named(&self, chain_name: &str, root_id: &str) -> Result<CascadeResult> {
        let chain = CascadeChain::from_config(&self.config, chain_name)?;
        self.cascade_archive(&chain, root_id).await
    }
}

fn archive_op(path: &DocPath, archived_field: &FieldPath) -> WriteOp {
    WriteOp::update_field(path.clone(), archived_field.clone(), Value::Bool(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CommitOutcome, MemoryStore, ReadStamp, StoredDocument};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn service(memory: Arc<MemoryStore>, batch_limit: usize) -> CascadeSoftDeleteService {
        let store: Arc<dyn DocumentStore> = memory;
        let config = Config {
            batch_limit,
            ..Default::default()
        };
        CascadeSoftDeleteService::new(store, Arc::new(config), Arc::new(EventBus::new()))
    }

    async fn seed(memory: &MemoryStore, collection: &str, id: &str, value: Value) {
        memory
            .insert(DocPath::new(collection, id), value.as_object().cloned().unwrap())
            .await
            .unwrap();
    }

    async fn archived(memory: &MemoryStore, collection: &str, id: &str) -> bool {
        memory
            .get(&DocPath::new(collection, id))
            .await
            .unwrap()
            .and_then(|d| d.data.get("archived").and_then(Value::as_bool))
            .unwrap_or(false)
    }

    /// Fails the `fail_on`-th batch write (1-based), then behaves normally
    struct FlakyBatchStore {
        inner: Arc<MemoryStore>,
        fail_on: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for FlakyBatchStore {
        async fn get(&self, path: &DocPath) -> Result<Option<StoredDocument>> {
            self.inner.get(path).await
        }

        async fn query(
            &self,
            collection: &str,
            field: &FieldPath,
            value: &Value,
        ) -> Result<Vec<StoredDocument>> {
            self.inner.query(collection, field, value).await
        }

        async fn list(
            &self,
            collection: &str,
            start_after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<StoredDocument>> {
            self.inner.list(collection, start_after, limit).await
        }

        async fn commit(&self, reads: &[ReadStamp], writes: Vec<WriteOp>) -> Result<CommitOutcome> {
            self.inner.commit(reads, writes).await
        }

        async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on {
                return Err(OrgSyncError::Store("injected batch failure".into()));
            }
            self.inner.batch_write(ops).await
        }

        fn max_batch_ops(&self) -> usize {
            self.inner.max_batch_ops()
        }
    }

    /// Records the path of every batched write in commit order
    struct RecordingBatchStore {
        inner: Arc<MemoryStore>,
        written: Mutex<Vec<DocPath>>,
    }

    #[async_trait]
    impl DocumentStore for RecordingBatchStore {
        async fn get(&self, path: &DocPath) -> Result<Option<StoredDocument>> {
            self.inner.get(path).await
        }

        async fn query(
            &self,
            collection: &str,
            field: &FieldPath,
            value: &Value,
        ) -> Result<Vec<StoredDocument>> {
            self.inner.query(collection, field, value).await
        }

        async fn list(
            &self,
            collection: &str,
            start_after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<StoredDocument>> {
            self.inner.list(collection, start_after, limit).await
        }

        async fn commit(&self, reads: &[ReadStamp], writes: Vec<WriteOp>) -> Result<CommitOutcome> {
            self.inner.commit(reads, writes).await
        }

        async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<()> {
            self.written
                .lock()
                .await
                .extend(ops.iter().map(|op| op.path().clone()));
            self.inner.batch_write(ops).await
        }

        fn max_batch_ops(&self) -> usize {
            self.inner.max_batch_ops()
        }
    }

    async fn seed_user_tree(memory: &MemoryStore) {
        seed(memory, "users", "u1", json!({ "archived": false })).await;
        for run in ["r1", "r2"] {
            seed(memory, "runs", run, json!({ "parentUserId": "u1" })).await;
            for n in 1..=3 {
                let trial = format!("{}-t{}", run, n);
                seed(memory, "trials", &trial, json!({ "parentRunId": run })).await;
            }
        }
    }

    async fn all_archived(memory: &MemoryStore) -> bool {
        let mut checks = vec![archived(memory, "users", "u1").await];
        for run in ["r1", "r2"] {
            checks.push(archived(memory, "runs", run).await);
            for n in 1..=3 {
                checks.push(archived(memory, "trials", &format!("{}-t{}", run, n)).await);
            }
        }
        checks.into_iter().all(|a| a)
    }

    #[tokio::test]
    async fn test_user_runs_trials_chunked() {
        let memory = Arc::new(MemoryStore::new());
        seed_user_tree(&memory).await;
        let svc = service(memory.clone(), 2);
        let chain = CascadeChain::from_config(&Config::default(), "users").unwrap();

        let result = svc.cascade_archive(&chain, "u1").await.unwrap();

        assert!(all_archived(&memory).await);
        assert!(result.root_archived);
        assert_eq!(
            result.archived_per_level,
            vec![
                LevelCount { collection: "runs".into(), archived: 2 },
                LevelCount { collection: "trials".into(), archived: 6 },
            ]
        );
        assert_eq!(result.total_archived(), 9);
        // root + one runs batch + two batches per run's trials
        assert_eq!(result.batches_committed, 6);
    }

    #[tokio::test]
    async fn test_rerun_leaves_state_unchanged() {
        let memory = Arc::new(MemoryStore::new());
        seed_user_tree(&memory).await;
        let svc = service(memory.clone(), 2);

        svc.cascade_archive_named("users", "u1").await.unwrap();
        let before = memory.snapshot().await;
        let again = svc.cascade_archive_named("users", "u1").await.unwrap();

        assert_eq!(memory.snapshot().await, before);
        assert_eq!(again.total_archived(), 9);
    }

    #[tokio::test]
    async fn test_failed_batch_aborts_and_rerun_completes() {
        let memory = Arc::new(MemoryStore::new());
        seed_user_tree(&memory).await;
        let flaky: Arc<dyn DocumentStore> = Arc::new(FlakyBatchStore {
            inner: memory.clone(),
            fail_on: 3,
            calls: AtomicUsize::new(0),
        });
        let config = Arc::new(Config {
            batch_limit: 2,
            ..Default::default()
        });
        let svc = CascadeSoftDeleteService::new(flaky, config, Arc::new(EventBus::new()));

        let err = svc.cascade_archive_named("users", "u1").await.unwrap_err();
        assert!(matches!(err, OrgSyncError::Store(_)));
        assert!(archived(&memory, "runs", "r1").await);
        assert!(!all_archived(&memory).await);

        svc.cascade_archive_named("users", "u1").await.unwrap();
        assert!(all_archived(&memory).await);
    }

    /// Every document is archived after the document it hangs off
    #[tokio::test]
    async fn test_parents_written_before_children() {
        let memory = Arc::new(MemoryStore::new());
        seed_user_tree(&memory).await;
        let recording = Arc::new(RecordingBatchStore {
            inner: memory.clone(),
            written: Mutex::new(Vec::new()),
        });
        let store: Arc<dyn DocumentStore> = recording.clone();
        let config = Arc::new(Config {
            batch_limit: 1,
            ..Default::default()
        });
        let svc = CascadeSoftDeleteService::new(store, config, Arc::new(EventBus::new()));

        let result = svc.cascade_archive_named("users", "u1").await.unwrap();
        assert_eq!(result.batches_committed, 9);

        let order = recording.written.lock().await.clone();
        assert_eq!(order.len(), 9);
        assert_eq!(order[0], DocPath::new("users", "u1"));

        let position = |path: &DocPath| order.iter().position(|p| p == path);
        for (index, path) in order.iter().enumerate() {
            let doc = memory.get(path).await.unwrap().unwrap();
            let parent = match path.collection() {
                "runs" => doc.data["parentUserId"].as_str().map(|id| DocPath::new("users", id)),
                "trials" => doc.data["parentRunId"].as_str().map(|id| DocPath::new("runs", id)),
                _ => None,
            };
            if let Some(parent) = parent {
                let parent_index = position(&parent).unwrap();
                assert!(
                    parent_index < index,
                    "{} written before its parent {}",
                    path,
                    parent
                );
            }
        }
    }

    #[tokio::test]
    async fn test_completion_event_emitted() {
        let memory = Arc::new(MemoryStore::new());
        seed_user_tree(&memory).await;
        let store: Arc<dyn DocumentStore> = memory;
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let svc = CascadeSoftDeleteService::new(store, Arc::new(Config::default()), events);

        svc.cascade_archive_named("users", "u1").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            HierarchyEvent::CascadeCompleted {
                chain: "users".into(),
                root: DocPath::new("users", "u1"),
                archived: 9,
            }
        );
    }

    #[test]
    fn test_chain_from_config() {
        let chain = CascadeChain::from_config(&Config::default(), "users").unwrap();
        assert_eq!(chain.root_collection(), "users");
        assert_eq!(chain.collections().collect::<Vec<_>>(), vec!["users", "runs", "trials"]);
        assert!(chain.child_level(0).is_none());
        assert_eq!(
            chain.child_level(2).map(|(c, f)| (c, f.to_string())),
            Some(("trials", "parentRunId".to_string()))
        );
        assert!(chain.child_level(3).is_none());
        assert!(CascadeChain::from_config(&Config::default(), "nope").is_err());
    }

    #[tokio::test]
    async fn test_effective_batch_limit_capped_by_provider() {
        let memory = Arc::new(MemoryStore::with_batch_limit(3));
        assert_eq!(service(memory.clone(), 500).batch_limit(), 3);
        assert_eq!(service(memory, 2).batch_limit(), 2);
    }

    #[tokio::test]
    async fn test_single_level_chain_archives_root_only() {
        let memory = Arc::new(MemoryStore::new());
        seed(&memory, "users", "u1", json!({ "archived": false })).await;
        let svc = service(memory.clone(), 10);
        let chain = CascadeChain::new("solo", &[LevelDescriptor::root("users")]).unwrap();

        let result = svc.cascade_archive(&chain, "u1").await.unwrap();
        assert!(result.root_archived);
        assert!(result.archived_per_level.is_empty());
        assert_eq!(result.total_archived(), 1);
        assert!(archived(&memory, "users", "u1").await);
    }

    #[tokio::test]
    async fn test_absent_root_still_archives_descendants() {
        let memory = Arc::new(MemoryStore::new());
        seed(&memory, "runs", "r1", json!({ "parentUserId": "u1" })).await;
        let svc = service(memory.clone(), 10);
        let chain = CascadeChain::from_config(&Config::default(), "users").unwrap();

        let result = svc.cascade_archive(&chain, "u1").await.unwrap();
        assert!(!result.root_archived);
        assert_eq!(result.archived_per_level[0].archived, 1);
        assert!(archived(&memory, "runs", "r1").await);
        assert!(memory.get(&DocPath::new("users", "u1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unrelated_documents_untouched() {
        let memory = Arc::new(MemoryStore::new());
        seed(&memory, "users", "u1", json!({})).await;
        seed(&memory, "users", "u2", json!({})).await;
        seed(&memory, "runs", "r1", json!({ "parentUserId": "u1" })).await;
        seed(&memory, "runs", "r2", json!({ "parentUserId": "u2" })).await;
        seed(&memory, "trials", "t2", json!({ "parentRunId": "r2" })).await;
        let svc = service(memory.clone(), 10);

        svc.cascade_archive_named("users", "u1").await.unwrap();
        assert!(archived(&memory, "runs", "r1").await);
        assert!(!archived(&memory, "users", "u2").await);
        assert!(!archived(&memory, "runs", "r2").await);
        assert!(!archived(&memory, "trials", "t2").await);
    }

    #[tokio::test]
    async fn test_custom_archived_field() {
        let memory = Arc::new(MemoryStore::new());
        seed(&memory, "users", "u1", json!({})).await;
        let store: Arc<dyn DocumentStore> = memory.clone();
        let config = Config {
            archived_field: "status.archived".into(),
            ..Default::default()
        };
        let svc = CascadeSoftDeleteService::new(store, Arc::new(config), Arc::new(EventBus::new()));

        svc.cascade_archive_named("users", "u1").await.unwrap();
        let doc = memory.get(&DocPath::new("users", "u1")).await.unwrap().unwrap();
        assert_eq!(doc.data, json!({ "status": { "archived": true } }).as_object().cloned().unwrap());
    }

    #[tokio::test]
    async fn test_malformed_descendant_fails_validation() {
        let memory = Arc::new(MemoryStore::new());
        seed(&memory, "runs", "r1", json!({ "parentUserId": "u1", "archived": "no" })).await;
        let svc = service(memory.clone(), 10);

        let err = svc.cascade_archive_named("users", "u1").await.unwrap_err();
        assert!(matches!(err, OrgSyncError::Validation(ref m) if m.contains("runs/r1")));
    }

    #[tokio::test]
    async fn test_blank_root_rejected() {
        let svc = service(Arc::new(MemoryStore::new()), 10);
        assert!(matches!(
            svc.cascade_archive_named("users", "").await,
            Err(OrgSyncError::Validation(_))
        ));
    }
}
