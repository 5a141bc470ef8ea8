//! Resumable maintenance jobs
//!
//! A job scans one or more collections page by page and hands each document
//! to the service that owns the fix. Progress is persisted after every page
//! in a checkpoint document, so an interrupted run picks up after the last
//! committed page and a completed job does nothing on the next run.
//!
//! ## Checkpoint
//!
//! ```text
//! _migrations/<job>
//!   collection   collection being scanned
//!   cursor       last document id processed in it
//!   processed    documents visited so far
//!   acted        documents the job changed
//!   completed    whole scan finished
//! ```
//!
//! Reprocessing a page after a crash between the fix and the checkpoint
//! write is safe because every job calls idempotent services.

mod archive_descendants;
mod repair_dangling;

pub use archive_descendants::ArchiveDescendants;
pub use repair_dangling::RepairDanglingParents;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::entities::decode;
use crate::error::{OrgSyncError, Result};
use crate::store::{DocPath, DocumentStore, StoredDocument, WriteBatch, WriteOp};

/// Collection holding job checkpoints
pub const CHECKPOINT_COLLECTION: &str = "_migrations";

/// Default documents per page
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A maintenance job driven by [`MigrationRunner`]
#[async_trait]
pub trait MigrationJob: Send + Sync {
    /// Stable name; keys the checkpoint document
    fn name(&self) -> &str;

    /// Collections to scan, in order
    fn collections(&self) -> Vec<String>;

    /// Handle one document; returns whether anything was changed
    async fn process(&self, doc: &StoredDocument) -> Result<bool>;
}

/// Persisted progress of one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub acted: u64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Outcome of one runner invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub job: String,
    /// Documents visited during this invocation
    pub processed: u64,
    /// Documents changed during this invocation
    pub acted: u64,
    pub completed: bool,
    /// Set when the run continued from a saved checkpoint
    pub resumed_from: Option<DocPath>,
}

/// Pages through a job's collections, checkpointing after each page
pub struct MigrationRunner {
    store: Arc<dyn DocumentStore>,
    page_size: usize,
    max_pages: Option<usize>,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Stop after `max_pages` pages, leaving the job resumable
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn checkpoint_path(job: &str) -> DocPath {
        DocPath::new(CHECKPOINT_COLLECTION, job)
    }

    pub async fn checkpoint(&self, job: &str) -> Result<Checkpoint> {
        let path = Self::checkpoint_path(job);
        match self.store.get(&path).await? {
            Some(doc) => decode(&path, &doc.data),
            None => Ok(Checkpoint::default()),
        }
    }

    /// Forget a job's progress so the next run starts from the beginning
    pub async fn reset(&self, job: &str) -> Result<()> {
        let mut batch = WriteBatch::new(1);
        batch.push(WriteOp::Delete {
            path: Self::checkpoint_path(job),
        })?;
        batch.commit(self.store.as_ref()).await?;
        info!(job = %job, "Migration checkpoint reset");
        Ok(())
    }

    async fn save(&self, job: &str, checkpoint: &Checkpoint) -> Result<()> {
        let data = match serde_json::to_value(checkpoint)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(OrgSyncError::Store("checkpoint did not encode as a document".into())),
        };
        let mut batch = WriteBatch::new(1);
        batch.push(WriteOp::Set {
            path: Self::checkpoint_path(job),
            data,
        })?;
        batch.commit(self.store.as_ref()).await?;
        Ok(())
    }

    pub async fn run(&self, job: &dyn MigrationJob) -> Result<MigrationReport> {
        if self.page_size == 0 {
            return Err(OrgSyncError::Validation("page size must be at least 1".into()));
        }

        let name = job.name().to_string();
        let collections = job.collections();
        let mut checkpoint = self.checkpoint(&name).await?;

        let mut report = MigrationReport {
            job: name.clone(),
            processed: 0,
            acted: 0,
            completed: checkpoint.completed,
            resumed_from: None,
        };
        if checkpoint.completed {
            info!(job = %name, "Migration already completed");
            return Ok(report);
        }

        let start = match checkpoint.collection.as_deref() {
            Some(saved) => collections.iter().position(|c| c == saved).ok_or_else(|| {
                OrgSyncError::Validation(format!(
                    "checkpoint for '{}' names unknown collection '{}'",
                    name, saved
                ))
            })?,
            None => 0,
        };
        if let (Some(collection), Some(cursor)) = (&checkpoint.collection, &checkpoint.cursor) {
            report.resumed_from = Some(DocPath::new(collection.as_str(), cursor.as_str()));
            info!(job = %name, collection = %collection, cursor = %cursor, "Resuming migration");
        }

        let mut pages = 0;
        for collection in &collections[start..] {
            if checkpoint.collection.as_deref() != Some(collection.as_str()) {
                checkpoint.collection = Some(collection.clone());
                checkpoint.cursor = None;
            }

            loop {
                if self.max_pages.is_some_and(|max| pages >= max) {
                    info!(job = %name, pages, "Migration paused at page limit");
                    return Ok(report);
                }

                let page = self
                    .store
                    .list(collection, checkpoint.cursor.as_deref(), self.page_size)
                    .await?;
                if page.is_empty() {
                    break;
                }

                for doc in &page {
                    let acted = job.process(doc).await?;
                    checkpoint.processed += 1;
                    report.processed += 1;
                    if acted {
                        checkpoint.acted += 1;
                        report.acted += 1;
                    }
                }

                checkpoint.cursor = page.last().map(|d| d.path.id().to_string());
                checkpoint.updated_at = Some(Utc::now());
                self.save(&name, &checkpoint).await?;
                pages += 1;
                debug!(job = %name, collection = %collection, size = page.len(), "Migration page committed");

                if page.len() < self.page_size {
                    break;
                }
            }
        }

        checkpoint.completed = true;
        checkpoint.updated_at = Some(Utc::now());
        self.save(&name, &checkpoint).await?;
        report.completed = true;

        info!(
            job = %name,
            processed = checkpoint.processed,
            acted = checkpoint.acted,
            "Migration completed"
        );
        Ok(report)
    }
}
