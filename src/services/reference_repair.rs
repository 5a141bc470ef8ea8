//! Reference repair - clears stale parent pointers
//!
//! When an org node is detached from its parent or its parent is deleted,
//! children may still point at the old parent. Repair reads every candidate
//! inside one transaction and nulls the parent field of each candidate that
//! still references the departed parent.
//!
//! Candidates that no longer exist are skipped. Re-running with the same
//! input finds nothing left to match and applies no updates.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::events::{EventBus, HierarchyEvent};
use crate::config::Config;
use crate::entities::{decode, OrgEntity, OrgType};
use crate::error::{OrgSyncError, Result};
use crate::store::{
    run_transaction, DocPath, Document, DocumentExt, DocumentStore, FieldPath, Transaction,
};

/// Candidate ids to inspect, grouped by org type
pub type RepairCandidates = BTreeMap<OrgType, Vec<String>>;

/// A parent pointer that was cleared
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedUpdate {
    pub path: DocPath,
    pub field: String,
    pub value: Value,
}

/// An update scheduled during the scan; applied only when complete
#[derive(Debug, Clone)]
struct PendingUpdate {
    path: DocPath,
    field: Option<FieldPath>,
    value: Option<Value>,
}

impl PendingUpdate {
    fn into_applied(self) -> Option<AppliedUpdate> {
        match (self.field, self.value) {
            (Some(field), Some(value)) if !field.is_empty() => Some(AppliedUpdate {
                path: self.path,
                field: field.to_string(),
                value,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct RepairTarget {
    path: DocPath,
    field: Option<FieldPath>,
}

/// Everything the transaction body needs, owned so each attempt can clone it
#[derive(Debug, Clone)]
struct RepairPlan {
    parent_id: String,
    targets: Vec<RepairTarget>,
}

async fn repair_in_tx(tx: &mut Transaction, plan: RepairPlan) -> Result<Vec<AppliedUpdate>> {
    let mut pending = Vec::new();

    for target in &plan.targets {
        let Some(doc) = tx.get(&target.path).await? else {
            debug!(path = %target.path, "Repair candidate absent, skipping");
            continue;
        };
        decode::<OrgEntity>(&target.path, &doc)?;

        let references_parent = target
            .field
            .as_ref()
            .and_then(|field| doc.field_str(field))
            .is_some_and(|current| current == plan.parent_id);

        if references_parent {
            pending.push(PendingUpdate {
                path: target.path.clone(),
                field: target.field.clone(),
                value: Some(Value::Null),
            });
        }
    }

    let applied: Vec<AppliedUpdate> = pending
        .into_iter()
        .filter_map(PendingUpdate::into_applied)
        .collect();

    for update in &applied {
        tx.update(
            update.path.clone(),
            vec![(FieldPath::from(update.field.as_str()), update.value.clone())],
        );
    }
    Ok(applied)
}

/// A parent pointer held by an org document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    /// `None` for a group whose parent type is not recorded
    pub parent_type: Option<OrgType>,
    pub parent_id: String,
}

/// State of the org a parent pointer names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentStatus {
    Live,
    Archived,
    Missing,
}

/// Non-null parent pointers on an org document of `org_type`
///
/// Groups carry one pointer in the group parent field, typed by
/// `parentOrgType` when present. Other types carry one pointer per
/// configured parent field.
pub fn parent_references(
    config: &Config,
    org_type: OrgType,
    path: &DocPath,
    doc: &Document,
) -> Result<Vec<ParentRef>> {
    if org_type == OrgType::Group {
        let entity: OrgEntity = decode(path, doc)?;
        let field = FieldPath::from(config.group_parent_field.as_str());
        return Ok(doc
            .field_str(&field)
            .map(|id| ParentRef {
                parent_type: entity.parent_org_type,
                parent_id: id.to_string(),
            })
            .into_iter()
            .collect());
    }

    Ok(config
        .parent_fields
        .iter()
        .filter(|(parent_type, _)| **parent_type != org_type)
        .filter_map(|(parent_type, field)| {
            doc.field_str(&FieldPath::from(field.as_str()))
                .map(|id| ParentRef {
                    parent_type: Some(*parent_type),
                    parent_id: id.to_string(),
                })
        })
        .collect())
}

/// Look up the org a pointer names; an untyped pointer checks every org collection
pub async fn resolve_parent(
    store: &dyn DocumentStore,
    config: &Config,
    parent: &ParentRef,
) -> Result<ParentStatus> {
    let types: Vec<OrgType> = match parent.parent_type {
        Some(t) => vec![t],
        None => OrgType::ALL.to_vec(),
    };
    let archived_field = config.archived_field();

    for org_type in types {
        let path = DocPath::new(config.collection_for(org_type), parent.parent_id.as_str());
        if let Some(found) = store.get(&path).await? {
            let archived = found
                .data
                .field(&archived_field)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            return Ok(if archived {
                ParentStatus::Archived
            } else {
                ParentStatus::Live
            });
        }
    }
    Ok(ParentStatus::Missing)
}

/// Clears parent pointers that reference a detached or deleted org
pub struct ReferenceRepairService {
    store: Arc<dyn DocumentStore>,
    config: Arc<Config>,
    events: Arc<EventBus>,
}

impl ReferenceRepairService {
    pub fn new(store: Arc<dyn DocumentStore>, config: Arc<Config>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Null every candidate's parent field that still equals `deleted_parent_id`
    ///
    /// Groups are compared on the configured group parent field; other types
    /// on the field that references a `deleted_parent_type` parent. Returns
    /// the updates actually committed.
    pub async fn repair_references(
        &self,
        deleted_parent_id: &str,
        deleted_parent_type: OrgType,
        candidates: &RepairCandidates,
    ) -> Result<Vec<AppliedUpdate>> {
        if deleted_parent_id.trim().is_empty() {
            return Err(OrgSyncError::Validation(
                "deleted parent id must not be blank".into(),
            ));
        }

        let plan = self.plan(deleted_parent_id, deleted_parent_type, candidates);
        if plan.targets.is_empty() {
            return Ok(Vec::new());
        }

        let applied = run_transaction(
            &self.store,
            self.config.max_transaction_attempts,
            move |tx| Box::pin(repair_in_tx(tx, plan.clone())),
        )
        .await?;

        info!(
            parent_id = %deleted_parent_id,
            parent_type = %deleted_parent_type,
            cleared = applied.len(),
            "References repaired"
        );

        if !applied.is_empty() {
            self.events.emit(HierarchyEvent::ReferencesRepaired {
                parent_id: deleted_parent_id.to_string(),
                parent_type: deleted_parent_type,
                cleared: applied.iter().map(|u| u.path.clone()).collect(),
            });
        }
        Ok(applied)
    }

    fn plan(
        &self,
        parent_id: &str,
        parent_type: OrgType,
        candidates: &RepairCandidates,
    ) -> RepairPlan {
        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();

        for (org_type, ids) in candidates {
            let collection = self.config.collection_for(*org_type);
            let field = self.config.parent_field_for(parent_type, *org_type);
            for id in ids {
                let path = DocPath::new(collection, id.clone());
                if seen.insert(path.clone()) {
                    targets.push(RepairTarget {
                        path,
                        field: field.clone(),
                    });
                }
            }
        }

        RepairPlan {
            parent_id: parent_id.to_string(),
            targets,
        }
    }
}
