//! Migration job clearing parent pointers that name missing or archived orgs

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::MigrationJob;
use crate::config::Config;
use crate::entities::OrgType;
use crate::error::{OrgSyncError, Result};
use crate::services::{
    parent_references, resolve_parent, ParentStatus, ReferenceRepairService, RepairCandidates,
};
use crate::store::{DocumentStore, StoredDocument};

/// Clears parent pointers that name a missing or archived org
///
/// Scans every org collection. Each dangling pointer is handed to
/// [`ReferenceRepairService`] with the document itself as the only candidate.
pub struct RepairDanglingParents {
    store: Arc<dyn DocumentStore>,
    config: Arc<Config>,
    repair: Arc<ReferenceRepairService>,
}

impl RepairDanglingParents {
    pub const NAME: &'static str = "repair-dangling-parents";

    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: Arc<Config>,
        repair: Arc<ReferenceRepairService>,
    ) -> Self {
        Self {
            store,
            config,
            repair,
        }
    }
}

#[async_trait]
impl MigrationJob for RepairDanglingParents {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn collections(&self) -> Vec<String> {
        OrgType::ALL
            .into_iter()
            .map(|t| self.config.collection_for(t).to_string())
            .collect()
    }

    async fn process(&self, doc: &StoredDocument) -> Result<bool> {
        let org_type = self
            .config
            .org_type_for_collection(doc.path.collection())
            .ok_or_else(|| {
                OrgSyncError::Validation(format!("{} is not an org collection", doc.path))
            })?;

        let mut repaired = false;
        for parent in parent_references(&self.config, org_type, &doc.path, &doc.data)? {
            let status = resolve_parent(self.store.as_ref(), &self.config, &parent).await?;
            if status == ParentStatus::Live {
                continue;
            }

            // An untyped pointer can only sit on a group, where the type is not consulted
            let parent_type = parent.parent_type.unwrap_or(OrgType::Group);
            warn!(
                path = %doc.path,
                parent_id = %parent.parent_id,
                status = ?status,
                "Dangling parent reference"
            );
            let candidates =
                RepairCandidates::from([(org_type, vec![doc.path.id().to_string()])]);
            let applied = self
                .repair
                .repair_references(&parent.parent_id, parent_type, &candidates)
                .await?;
            repaired |= !applied.is_empty();
        }

        if !repaired {
            debug!(path = %doc.path, "Parent references intact");
        }
        Ok(repaired)
    }
}
