//! Optimistic transactions with automatic retry

use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{CommitOutcome, DocPath, Document, DocumentStore, FieldPath, ReadStamp, WriteOp};
use crate::error::{OrgSyncError, Result};

/// One attempt of a transaction body
///
/// Reads go straight to the store and are stamped; writes are buffered
/// until [`Transaction::commit`].
pub struct Transaction {
    store: Arc<dyn DocumentStore>,
    reads: Vec<ReadStamp>,
    writes: Vec<WriteOp>,
}

impl Transaction {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Read a document and add it to the read-set
    pub async fn get(&mut self, path: &DocPath) -> Result<Option<Document>> {
        let stored = self.store.get(path).await?;
        let version = stored.as_ref().map(|doc| doc.version);

        // First observation wins; a later differing read is caught at commit.
        if !self.reads.iter().any(|stamp| &stamp.path == path) {
            self.reads.push(ReadStamp {
                path: path.clone(),
                version,
            });
        }

        Ok(stored.map(|doc| doc.data))
    }

    pub fn set(&mut self, path: DocPath, data: Document) {
        self.writes.push(WriteOp::Set { path, data });
    }

    pub fn update(&mut self, path: DocPath, fields: Vec<(FieldPath, Value)>) {
        self.writes.push(WriteOp::Update { path, fields });
    }

    pub fn delete(&mut self, path: DocPath) {
        self.writes.push(WriteOp::Delete { path });
    }

    pub fn read_set(&self) -> &[ReadStamp] {
        &self.reads
    }

    pub fn pending_writes(&self) -> &[WriteOp] {
        &self.writes
    }

    /// Submit the read-set and buffered writes
    pub async fn commit(self) -> Result<CommitOutcome> {
        if self.writes.is_empty() {
            return Ok(CommitOutcome::Committed);
        }
        self.store.commit(&self.reads, self.writes).await
    }
}

/// Run `body` inside a transaction, retrying from scratch on a stale read-set
///
/// The body must be re-runnable: each attempt gets a fresh [`Transaction`]
/// and nothing from an abandoned attempt is applied. An error returned by
/// the body aborts immediately. Exhausting `max_attempts` yields
/// [`OrgSyncError::Conflict`].
///
/// ```ignore
/// async fn touch(tx: &mut Transaction, path: DocPath) -> Result<bool> {
///     let existed = tx.get(&path).await?.is_some();
///     tx.update(path, vec![("touched".into(), json!(true))]);
///     Ok(existed)
/// }
///
/// let existed = run_transaction(&store, 5, move |tx| Box::pin(touch(tx, path.clone()))).await?;
/// ```
pub async fn run_transaction<T, F>(
    store: &Arc<dyn DocumentStore>,
    max_attempts: u32,
    mut body: F,
) -> Result<T>
where
    T: Send,
    F: for<'t> FnMut(&'t mut Transaction) -> BoxFuture<'t, Result<T>> + Send,
{
    if max_attempts == 0 {
        return Err(OrgSyncError::Validation(
            "max_transaction_attempts must be at least 1".into(),
        ));
    }

    let mut last_stale = String::new();
    for attempt in 1..=max_attempts {
        let mut tx = Transaction::new(Arc::clone(store));
        let value = body(&mut tx).await?;

        match tx.commit().await? {
            CommitOutcome::Committed => {
                debug!(attempt, "Transaction committed");
                return Ok(value);
            }
            CommitOutcome::Stale { path } => {
                debug!(attempt, path = %path, "Transaction read-set stale, retrying");
                last_stale = path.to_string();
            }
        }
    }

    warn!(path = %last_stale, attempts = max_attempts, "Transaction retry budget exhausted");
    Err(OrgSyncError::Conflict {
        path: last_stale,
        attempts: max_attempts,
    })
}
