//! Trigger adapter - routes store change events to services
//!
//! The platform delivers `(kind, path, before?, after?)` at least once with
//! no ordering guarantee across documents. Routing is a pure function of the
//! event, and every routed operation is idempotent, so redelivery is safe.
//!
//! ## Routing
//!
//! ```text
//! org updated, ids dropped from a child list   → repair those children
//! org deleted or newly archived                → repair every prior child
//! chain root deleted or newly archived         → cascade the chain
//! claims record created or updated             → publish claims
//! anything else                                → ignored
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::entities::OrgType;
use crate::error::{OrgSyncError, Result};
use crate::services::{AppliedUpdate, CascadeResult, RepairCandidates, Services};
use crate::store::{DocPath, Document, DocumentExt, FieldPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// One change notification from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,
    pub path: DocPath,
    #[serde(default)]
    pub before: Option<Document>,
    #[serde(default)]
    pub after: Option<Document>,
}

impl TriggerEvent {
    pub fn created(path: DocPath, after: Document) -> Self {
        Self {
            kind: EventKind::Created,
            path,
            before: None,
            after: Some(after),
        }
    }

    pub fn updated(path: DocPath, before: Document, after: Document) -> Self {
        Self {
            kind: EventKind::Updated,
            path,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn deleted(path: DocPath, before: Option<Document>) -> Self {
        Self {
            kind: EventKind::Deleted,
            path,
            before,
            after: None,
        }
    }

    /// Deleted, or updated from live to archived
    fn is_removal(&self, archived_field: &FieldPath) -> bool {
        match self.kind {
            EventKind::Deleted => true,
            EventKind::Updated => {
                !is_archived(self.before.as_ref(), archived_field)
                    && is_archived(self.after.as_ref(), archived_field)
            }
            EventKind::Created => false,
        }
    }
}

fn is_archived(doc: Option<&Document>, archived_field: &FieldPath) -> bool {
    doc.and_then(|d| d.field(archived_field))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// What a dispatched event did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum DispatchOutcome {
    Repaired {
        parent: DocPath,
        applied: Vec<AppliedUpdate>,
    },
    Cascaded(CascadeResult),
    Published {
        user_id: String,
    },
    Ignored,
}

/// Maps store change events onto service calls
pub struct TriggerRouter {
    services: Arc<Services>,
}

impl TriggerRouter {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn config(&self) -> &Config {
        &self.services.config
    }

    /// Route one event; an event may both repair and cascade
    pub async fn dispatch(&self, event: &TriggerEvent) -> Result<Vec<DispatchOutcome>> {
        let mut outcomes = Vec::new();
        let collection = event.path.collection();
        let archived_field = self.config().archived_field();

        if let Some(org_type) = self.config().org_type_for_collection(collection) {
            if let Some(outcome) = self.route_org_change(event, org_type, &archived_field).await? {
                outcomes.push(outcome);
            }
        }

        if event.is_removal(&archived_field) {
            if let Some(chain) = self.config().chain_rooted_at(collection) {
                let result = self
                    .services
                    .cascade
                    .cascade_archive_named(chain, event.path.id())
                    .await?;
                outcomes.push(DispatchOutcome::Cascaded(result));
            }
        }

        if collection == self.config().claims_collection && event.kind != EventKind::Deleted {
            let user_id = event.path.id().to_string();
            self.services.claims.publish(&user_id).await?;
            outcomes.push(DispatchOutcome::Published { user_id });
        }

        if outcomes.is_empty() {
            debug!(path = %event.path, kind = ?event.kind, "Trigger event ignored");
            outcomes.push(DispatchOutcome::Ignored);
        } else {
            info!(path = %event.path, kind = ?event.kind, routed = outcomes.len(), "Trigger event dispatched");
        }
        Ok(outcomes)
    }

    async fn route_org_change(
        &self,
        event: &TriggerEvent,
        org_type: OrgType,
        archived_field: &FieldPath,
    ) -> Result<Option<DispatchOutcome>> {
        let candidates = if event.is_removal(archived_field) {
            self.all_children(&event.path, org_type, event.before.as_ref())?
        } else if event.kind == EventKind::Updated {
            self.removed_children(&event.path, org_type, event.before.as_ref(), event.after.as_ref())?
        } else {
            return Ok(None);
        };

        if candidates.values().all(Vec::is_empty) {
            return Ok(None);
        }

        let applied = self
            .services
            .repair
            .repair_references(event.path.id(), org_type, &candidates)
            .await?;
        Ok(Some(DispatchOutcome::Repaired {
            parent: event.path.clone(),
            applied,
        }))
    }

    fn all_children(
        &self,
        path: &DocPath,
        org_type: OrgType,
        before: Option<&Document>,
    ) -> Result<RepairCandidates> {
        let mut candidates = RepairCandidates::new();
        let Some(before) = before else {
            debug!(path = %path, "Removal without prior state; no children to repair");
            return Ok(candidates);
        };
        for list in self.config().child_fields_for(org_type) {
            let ids = child_ids(path, before, &list.field)?;
            add_candidates(&mut candidates, list.child_type, ids);
        }
        Ok(candidates)
    }

    fn removed_children(
        &self,
        path: &DocPath,
        org_type: OrgType,
        before: Option<&Document>,
        after: Option<&Document>,
    ) -> Result<RepairCandidates> {
        let mut candidates = RepairCandidates::new();
        let Some(before) = before else {
            return Ok(candidates);
        };
        for list in self.config().child_fields_for(org_type) {
            let kept: BTreeSet<String> = match after {
                Some(after) => child_ids(path, after, &list.field)?.into_iter().collect(),
                None => BTreeSet::new(),
            };
            let removed = child_ids(path, before, &list.field)?
                .into_iter()
                .filter(|id| !kept.contains(id))
                .collect();
            add_candidates(&mut candidates, list.child_type, removed);
        }
        Ok(candidates)
    }
}

fn add_candidates(candidates: &mut RepairCandidates, child_type: OrgType, ids: Vec<String>) {
    if !ids.is_empty() {
        candidates.entry(child_type).or_default().extend(ids);
    }
}

/// Ids in a child-list field; absent or null is empty
fn child_ids(path: &DocPath, doc: &Document, field: &str) -> Result<Vec<String>> {
    match doc.field(&FieldPath::from(field)) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
            OrgSyncError::Validation(format!("malformed child list '{}' in {}: {}", field, path, e))
        }),
    }
}
