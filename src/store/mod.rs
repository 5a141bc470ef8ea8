//! Document store adapter
//!
//! The services never talk to a concrete database. They take an
//! `Arc<dyn DocumentStore>` constructed by the caller and express every
//! mutation through two primitives:
//!
//! - **Transactions** ([`run_transaction`]): reads are stamped with the
//!   document version observed, writes are buffered, and the store validates
//!   the read-set at commit time. A stale read-set re-runs the whole body.
//! - **Batched writes** ([`WriteBatch`]): atomic per batch, never larger than
//!   the provider limit, not transactional across batches.
//!
//! ## Backends
//!
//! - [`MemoryStore`] - in-process, snapshot import/export
//! - `MongoStore` - MongoDB (feature `mongo`)

pub mod batch;
pub mod document;
pub mod memory;
#[cfg(feature = "mongo")]
pub mod mongo;
pub mod transaction;

pub use batch::{chunk_ops, WriteBatch};
pub use document::{DocPath, Document, DocumentExt, FieldPath};
pub use memory::MemoryStore;
#[cfg(feature = "mongo")]
pub use mongo::MongoStore;
pub use transaction::{run_transaction, Transaction};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A document together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub path: DocPath,
    pub data: Document,
    /// Store-wide unique write stamp; changes on every write
    pub version: u64,
}

/// Version of a document observed inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStamp {
    pub path: DocPath,
    /// `None` when the document was absent at read time
    pub version: Option<u64>,
}

/// A single mutation
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or fully replace a document
    Set { path: DocPath, data: Document },
    /// Set individual fields; the document must exist
    Update {
        path: DocPath,
        fields: Vec<(FieldPath, Value)>,
    },
    Delete { path: DocPath },
}

impl WriteOp {
    /// Single-field update
    pub fn update_field(path: DocPath, field: FieldPath, value: Value) -> Self {
        WriteOp::Update {
            path,
            fields: vec![(field, value)],
        }
    }

    pub fn path(&self) -> &DocPath {
        match self {
            WriteOp::Set { path, .. } | WriteOp::Update { path, .. } | WriteOp::Delete { path } => {
                path
            }
        }
    }
}

/// Result of submitting a transaction's read-set and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// A document read by the transaction changed before commit
    Stale { path: DocPath },
}

/// Transactional document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one document
    async fn get(&self, path: &DocPath) -> Result<Option<StoredDocument>>;

    /// All documents in `collection` whose `field` equals `value`, ordered by id
    async fn query(
        &self,
        collection: &str,
        field: &FieldPath,
        value: &Value,
    ) -> Result<Vec<StoredDocument>>;

    /// Page through a collection in id order, starting after `start_after`
    async fn list(
        &self,
        collection: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredDocument>>;

    /// Validate `reads` and apply `writes` atomically
    async fn commit(&self, reads: &[ReadStamp], writes: Vec<WriteOp>) -> Result<CommitOutcome>;

    /// Apply `ops` atomically without read validation
    ///
    /// Fails with `BatchLimitExceeded` when `ops` is larger than
    /// [`DocumentStore::max_batch_ops`].
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// Provider-imposed maximum operations per batch
    fn max_batch_ops(&self) -> usize;
}
