//! In-memory document store
//!
//! Behaves like the hosted store the services are written against:
//! store-wide version stamps, optimistic read-set validation on commit,
//! a hard per-batch operation limit, and `Update` on a missing document
//! failing the whole write set. Snapshots serialize as
//! `{ "<collection>": { "<id>": { ...document } } }`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    CommitOutcome, DocPath, Document, DocumentExt, DocumentStore, FieldPath, ReadStamp,
    StoredDocument, WriteOp,
};
use crate::error::{OrgSyncError, Result};

/// Default provider batch limit (matches the hosted store)
pub const DEFAULT_MAX_BATCH_OPS: usize = 500;

#[derive(Debug, Clone)]
struct Versioned {
    data: Document,
    version: u64,
}

#[derive(Debug, Default)]
struct State {
    collections: BTreeMap<String, BTreeMap<String, Versioned>>,
    next_version: u64,
}

impl State {
    fn lookup(&self, path: &DocPath) -> Option<&Versioned> {
        self.collections.get(path.collection())?.get(path.id())
    }

    fn stamp(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Apply `writes` all-or-nothing
    fn apply(&mut self, writes: Vec<WriteOp>) -> Result<()> {
        // Stage touched documents so a failing op leaves state untouched.
        let mut staged: HashMap<DocPath, Option<Document>> = HashMap::new();
        let mut order: Vec<DocPath> = Vec::new();

        for op in writes {
            let path = op.path().clone();
            if !staged.contains_key(&path) {
                let current = self.lookup(&path).map(|v| v.data.clone());
                staged.insert(path.clone(), current);
                order.push(path.clone());
            }
            let slot = staged
                .get_mut(&path)
                .ok_or_else(|| OrgSyncError::Store(format!("staging lost {}", path)))?;

            match op {
                WriteOp::Set { data, .. } => *slot = Some(data),
                WriteOp::Update { fields, .. } => {
                    let doc = slot
                        .as_mut()
                        .ok_or_else(|| OrgSyncError::NotFound(path.to_string()))?;
                    for (field, value) in fields {
                        doc.set_field(&field, value)?;
                    }
                }
                WriteOp::Delete { .. } => *slot = None,
            }
        }

        for path in order {
            match staged.remove(&path).flatten() {
                Some(data) => {
                    let version = self.stamp();
                    self.collections
                        .entry(path.collection().to_string())
                        .or_default()
                        .insert(path.id().to_string(), Versioned { data, version });
                }
                None => {
                    if let Some(collection) = self.collections.get_mut(path.collection()) {
                        collection.remove(path.id());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Versioned, in-process [`DocumentStore`]
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<State>,
    max_batch_ops: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_batch_limit(DEFAULT_MAX_BATCH_OPS)
    }

    /// Store enforcing a custom provider batch limit
    pub fn with_batch_limit(max_batch_ops: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            max_batch_ops,
        }
    }

    /// Build a store from a snapshot value
    pub fn from_snapshot(snapshot: &Value, max_batch_ops: usize) -> Result<Self> {
        let collections = snapshot.as_object().ok_or_else(|| {
            OrgSyncError::Validation("snapshot must be an object of collections".into())
        })?;

        let mut state = State::default();
        for (collection, docs) in collections {
            let docs = docs.as_object().ok_or_else(|| {
                OrgSyncError::Validation(format!("collection '{}' must be an object", collection))
            })?;
            for (id, data) in docs {
                let data = data.as_object().cloned().ok_or_else(|| {
                    OrgSyncError::Validation(format!(
                        "document '{}/{}' must be an object",
                        collection, id
                    ))
                })?;
                let version = state.stamp();
                state
                    .collections
                    .entry(collection.clone())
                    .or_default()
                    .insert(id.clone(), Versioned { data, version });
            }
        }

        Ok(Self {
            state: RwLock::new(state),
            max_batch_ops,
        })
    }

    /// Load a snapshot file
    pub async fn load_file(path: impl AsRef<Path>, max_batch_ops: usize) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let snapshot: Value = serde_json::from_str(&raw)?;
        let store = Self::from_snapshot(&snapshot, max_batch_ops)?;
        info!(path = %path.display(), documents = store.len().await, "Snapshot loaded");
        Ok(store)
    }

    /// Export every non-empty collection
    pub async fn snapshot(&self) -> Value {
        let state = self.state.read().await;
        let mut out = Map::new();
        for (collection, docs) in &state.collections {
            if docs.is_empty() {
                continue;
            }
            let docs: Map<String, Value> = docs
                .iter()
                .map(|(id, v)| (id.clone(), Value::Object(v.data.clone())))
                .collect();
            out.insert(collection.clone(), Value::Object(docs));
        }
        Value::Object(out)
    }

    /// Write the snapshot to a file as pretty JSON
    pub async fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&self.snapshot().await)?;
        tokio::fs::write(path, content).await?;
        info!(path = %path.display(), "Snapshot saved");
        Ok(())
    }

    /// Seed or replace a document outside any transaction or batch
    pub async fn insert(&self, path: DocPath, data: Document) -> Result<()> {
        self.state
            .write()
            .await
            .apply(vec![WriteOp::Set { path, data }])
    }

    /// Total number of documents
    pub async fn len(&self) -> usize {
        self.state
            .read()
            .await
            .collections
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn to_stored(path: DocPath, versioned: &Versioned) -> StoredDocument {
    StoredDocument {
        path,
        data: versioned.data.clone(),
        version: versioned.version,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<StoredDocument>> {
        let state = self.state.read().await;
        Ok(state.lookup(path).map(|v| to_stored(path.clone(), v)))
    }

    async fn query(
        &self,
        collection: &str,
        field: &FieldPath,
        value: &Value,
    ) -> Result<Vec<StoredDocument>> {
        let state = self.state.read().await;
        let Some(docs) = state.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, v)| v.data.field(field) == Some(value))
            .map(|(id, v)| to_stored(DocPath::new(collection, id.clone()), v))
            .collect())
    }

    async fn list(
        &self,
        collection: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredDocument>> {
        let state = self.state.read().await;
        let Some(docs) = state.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(id, _)| start_after.map_or(true, |after| id.as_str() > after))
            .take(limit)
            .map(|(id, v)| to_stored(DocPath::new(collection, id.clone()), v))
            .collect())
    }

    async fn commit(&self, reads: &[ReadStamp], writes: Vec<WriteOp>) -> Result<CommitOutcome> {
        let mut state = self.state.write().await;

        for stamp in reads {
            let current = state.lookup(&stamp.path).map(|v| v.version);
            if current != stamp.version {
                debug!(path = %stamp.path, "Read-set validation failed");
                return Ok(CommitOutcome::Stale {
                    path: stamp.path.clone(),
                });
            }
        }

        state.apply(writes)?;
        Ok(CommitOutcome::Committed)
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.len() > self.max_batch_ops {
            return Err(OrgSyncError::BatchLimitExceeded {
                size: ops.len(),
                limit: self.max_batch_ops,
            });
        }
        self.state.write().await.apply(ops)
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}
