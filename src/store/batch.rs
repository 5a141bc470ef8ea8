//! Bounded write batches
//!
//! Every batched mutation goes through [`WriteBatch`], which refuses to grow
//! past its limit. [`chunk_ops`] splits an arbitrary operation list into
//! batches that each fit.

use tracing::debug;

use super::{DocumentStore, WriteOp};
use crate::error::{OrgSyncError, Result};

/// A set of writes committed atomically, never larger than `limit`
#[derive(Debug, Clone)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    limit: usize,
}

impl WriteBatch {
    pub fn new(limit: usize) -> Self {
        Self {
            ops: Vec::with_capacity(limit.min(64)),
            limit,
        }
    }

    pub fn push(&mut self, op: WriteOp) -> Result<()> {
        if self.ops.len() >= self.limit {
            return Err(OrgSyncError::BatchLimitExceeded {
                size: self.ops.len() + 1,
                limit: self.limit,
            });
        }
        self.ops.push(op);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ops.len() >= self.limit
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Commit through the store; returns the number of operations written
    pub async fn commit(self, store: &dyn DocumentStore) -> Result<usize> {
        let size = self.ops.len();
        if size == 0 {
            return Ok(0);
        }
        store.batch_write(self.ops).await?;
        debug!(size, "Batch committed");
        Ok(size)
    }
}

/// Split `ops` into batches of at most `limit` operations, order preserved
pub fn chunk_ops(ops: Vec<WriteOp>, limit: usize) -> Result<Vec<WriteBatch>> {
    if limit == 0 {
        return Err(OrgSyncError::Validation("batch limit must be at least 1".into()));
    }

    let mut batches = Vec::with_capacity(ops.len().div_ceil(limit));
    let mut current = WriteBatch::new(limit);
    for op in ops {
        if current.is_full() {
            batches.push(std::mem::replace(&mut current, WriteBatch::new(limit)));
        }
        current.push(op)?;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}
