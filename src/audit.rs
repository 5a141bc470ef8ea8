//! Read-only consistency audit
//!
//! Checks the hierarchy invariants without writing anything:
//! - no org parent pointer names a missing or archived org
//! - no chain descendant is live under an archived root
//! - no live user is a current member of a missing or archived org
//! - stored normalized names agree with display names
//!
//! A clean report means repair and cascade have nothing left to do.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::entities::{decode, OrgEntity, OrgType, UserEntity};
use crate::error::Result;
use crate::services::{parent_references, resolve_parent, CascadeChain, ParentRef, ParentStatus};
use crate::store::{DocPath, DocumentExt, DocumentStore, StoredDocument};

const PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DanglingParent {
    pub path: DocPath,
    pub parent: ParentRef,
    pub status: ParentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnarchivedDescendant {
    pub chain: String,
    pub root: DocPath,
    pub path: DocPath,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleMembership {
    pub user: DocPath,
    pub org_type: OrgType,
    pub org_id: String,
    pub status: ParentStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub dangling_parents: Vec<DanglingParent>,
    pub unarchived_descendants: Vec<UnarchivedDescendant>,
    pub stale_memberships: Vec<StaleMembership>,
    pub name_mismatches: Vec<DocPath>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.dangling_parents.is_empty()
            && self.unarchived_descendants.is_empty()
            && self.stale_memberships.is_empty()
            && self.name_mismatches.is_empty()
    }

    pub fn issue_count(&self) -> usize {
        self.dangling_parents.len()
            + self.unarchived_descendants.len()
            + self.stale_memberships.len()
            + self.name_mismatches.len()
    }
}

/// Id-ordered pages of one collection, fetched on demand
struct Pager<'a> {
    store: &'a dyn DocumentStore,
    collection: String,
    cursor: Option<String>,
    done: bool,
}

impl<'a> Pager<'a> {
    fn new(store: &'a dyn DocumentStore, collection: &str) -> Self {
        Self {
            store,
            collection: collection.to_string(),
            cursor: None,
            done: false,
        }
    }

    async fn next_page(&mut self) -> Result<Option<Vec<StoredDocument>>> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .store
            .list(&self.collection, self.cursor.as_deref(), PAGE_SIZE)
            .await?;
        self.done = page.len() < PAGE_SIZE;
        self.cursor = page.last().map(|d| d.path.id().to_string());
        Ok(if page.is_empty() { None } else { Some(page) })
    }
}

pub struct Auditor {
    store: Arc<dyn DocumentStore>,
    config: Arc<Config>,
}

impl Auditor {
    pub fn new(store: Arc<dyn DocumentStore>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    pub async fn run(&self) -> Result<AuditReport> {
        let mut report = AuditReport::default();
        self.audit_orgs(&mut report).await?;
        self.audit_chains(&mut report).await?;
        self.audit_memberships(&mut report).await?;

        if report.is_clean() {
            info!("Audit clean");
        } else {
            warn!(
                dangling_parents = report.dangling_parents.len(),
                unarchived_descendants = report.unarchived_descendants.len(),
                stale_memberships = report.stale_memberships.len(),
                name_mismatches = report.name_mismatches.len(),
                "Audit found issues"
            );
        }
        Ok(report)
    }

    fn is_archived(&self, doc: &StoredDocument) -> bool {
        doc.data
            .field(&self.config.archived_field())
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    async fn audit_orgs(&self, report: &mut AuditReport) -> Result<()> {
        for org_type in OrgType::ALL {
            let mut pager = Pager::new(self.store.as_ref(), self.config.collection_for(org_type));
            while let Some(page) = pager.next_page().await? {
                for doc in page {
                    let entity: OrgEntity = decode(&doc.path, &doc.data)?;
                    if !entity.normalized_name_matches() {
                        report.name_mismatches.push(doc.path.clone());
                    }

                    for parent in parent_references(&self.config, org_type, &doc.path, &doc.data)? {
                        let status =
                            resolve_parent(self.store.as_ref(), &self.config, &parent).await?;
                        if status != ParentStatus::Live {
                            report.dangling_parents.push(DanglingParent {
                                path: doc.path.clone(),
                                parent,
                                status,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn audit_chains(&self, report: &mut AuditReport) -> Result<()> {
        for name in self.config.chains.keys() {
            let chain = CascadeChain::from_config(&self.config, name)?;
            let mut pager = Pager::new(self.store.as_ref(), chain.root_collection());
            while let Some(page) = pager.next_page().await? {
                for root in page {
                    if self.is_archived(&root) {
                        self.audit_subtree(&chain, &root.path, report).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Record every live descendant of an archived root, walking the chain's levels
    async fn audit_subtree(
        &self,
        chain: &CascadeChain,
        root: &DocPath,
        report: &mut AuditReport,
    ) -> Result<()> {
        let mut pending = vec![(1usize, root.id().to_string())];
        while let Some((depth, parent_id)) = pending.pop() {
            let Some((collection, parent_field)) = chain.child_level(depth) else {
                continue;
            };
            let children = self
                .store
                .query(collection, parent_field, &Value::String(parent_id))
                .await?;
            for child in children {
                if !self.is_archived(&child) {
                    report.unarchived_descendants.push(UnarchivedDescendant {
                        chain: chain.name().to_string(),
                        root: root.clone(),
                        path: child.path.clone(),
                    });
                }
                pending.push((depth + 1, child.path.id().to_string()));
            }
        }
        Ok(())
    }

    async fn audit_memberships(&self, report: &mut AuditReport) -> Result<()> {
        let mut pager = Pager::new(self.store.as_ref(), &self.config.users_collection);
        while let Some(page) = pager.next_page().await? {
            for doc in page {
                self.audit_user(&doc, report).await?;
            }
        }
        Ok(())
    }

    async fn audit_user(&self, doc: &StoredDocument, report: &mut AuditReport) -> Result<()> {
        let user: UserEntity = decode(&doc.path, &doc.data)?;
        if user.archived {
            return Ok(());
        }
        for (org_type, org_id) in user.current_orgs() {
            let parent = ParentRef {
                parent_type: Some(org_type),
                parent_id: org_id.to_string(),
            };
            let status = resolve_parent(self.store.as_ref(), &self.config, &parent).await?;
            if status != ParentStatus::Live {
                report.stale_memberships.push(StaleMembership {
                    user: doc.path.clone(),
                    org_type,
                    org_id: org_id.to_string(),
                    status,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn store_with(snapshot: Value) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::from_snapshot(&snapshot, 500).unwrap())
    }

    fn auditor(memory: Arc<MemoryStore>) -> Auditor {
        Auditor::new(memory, Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_consistent_tree_is_clean() {
        let memory = store_with(json!({
            "districts": { "D1": { "name": "North", "normalizedName": "north" } },
            "schools": { "S1": { "name": "Elm", "districtId": "D1" } },
            "groups": { "G1": { "parentOrgId": "D1", "parentOrgType": "district" } },
            "users": { "u1": { "schools": { "current": ["S1"] }, "archived": false } },
            "runs": { "r1": { "parentUserId": "u1" } }
        }))
        .await;

        let report = auditor(memory).run().await.unwrap();
        assert!(report.is_clean(), "{:?}", report);
    }

    #[tokio::test]
    async fn test_reports_every_issue_kind() {
        let memory = store_with(json!({
            "districts": { "D1": { "name": "North", "normalizedName": "south", "archived": true } },
            "classes": { "C1": { "schoolId": "S404" } },
            "users": {
                "u1": { "archived": true },
                "u2": { "groups": { "current": ["G404"] } }
            },
            "runs": { "r1": { "parentUserId": "u1", "archived": true } },
            "trials": { "t1": { "parentRunId": "r1" } }
        }))
        .await;

        let report = auditor(memory).run().await.unwrap();
        assert_eq!(report.name_mismatches, vec![DocPath::new("districts", "D1")]);
        assert_eq!(report.dangling_parents.len(), 1);
        assert_eq!(report.dangling_parents[0].status, ParentStatus::Missing);
        assert_eq!(
            report.unarchived_descendants,
            vec![UnarchivedDescendant {
                chain: "users".into(),
                root: DocPath::new("users", "u1"),
                path: DocPath::new("trials", "t1"),
            }]
        );
        assert_eq!(report.stale_memberships.len(), 1);
        assert_eq!(report.stale_memberships[0].org_id, "G404");
        assert_eq!(report.issue_count(), 4);
    }

    #[tokio::test]
    async fn test_collections_larger_than_a_page_are_fully_audited() {
        let schools: serde_json::Map<String, Value> = (0..PAGE_SIZE * 2 + 50)
            .map(|n| (format!("S{:04}", n), json!({ "districtId": "D404" })))
            .collect();
        let memory = store_with(json!({ "schools": schools })).await;

        let report = auditor(memory).run().await.unwrap();
        assert_eq!(report.dangling_parents.len(), PAGE_SIZE * 2 + 50);
        assert_eq!(report.dangling_parents[0].path, DocPath::new("schools", "S0000"));
    }

    #[tokio::test]
    async fn test_pager_stops_after_short_page() {
        let memory = store_with(json!({ "users": { "u1": {}, "u2": {} } })).await;
        let mut pager = Pager::new(&*memory, "users");

        let page = pager.next_page().await.unwrap().unwrap();
        assert_eq!(page.len(), 2);
        assert!(pager.next_page().await.unwrap().is_none());
        assert!(Pager::new(&*memory, "missing").next_page().await.unwrap().is_none());
    }
}
