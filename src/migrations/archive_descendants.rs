//! Migration job re-running cascades under archived chain roots

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::MigrationJob;
use crate::error::Result;
use crate::services::{CascadeChain, CascadeSoftDeleteService};
use crate::store::{DocumentExt, FieldPath, StoredDocument};

/// Re-cascades every archived root of a chain
///
/// Finishes cascades that failed part way, and archives descendants created
/// under a root after it was archived.
pub struct ArchiveDescendants {
    name: String,
    chain: CascadeChain,
    archived_field: FieldPath,
    cascade: Arc<CascadeSoftDeleteService>,
}

impl ArchiveDescendants {
    pub fn new(
        chain: CascadeChain,
        archived_field: FieldPath,
        cascade: Arc<CascadeSoftDeleteService>,
    ) -> Self {
        Self {
            name: format!("archive-descendants-{}", chain.name()),
            chain,
            archived_field,
            cascade,
        }
    }
}

#[async_trait]
impl MigrationJob for ArchiveDescendants {
    fn name(&self) -> &str {
        &self.name
    }

    fn collections(&self) -> Vec<String> {
        vec![self.chain.root_collection().to_string()]
    }

    async fn process(&self, doc: &StoredDocument) -> Result<bool> {
        let archived = doc
            .data
            .field(&self.archived_field)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !archived {
            return Ok(false);
        }

        self.cascade.cascade_archive(&self.chain, doc.path.id()).await?;
        Ok(true)
    }
}
