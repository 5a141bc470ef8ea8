//! Claims propagation
//!
//! Each authenticated identity owns one claims record holding a flat map of
//! claim name to boolean flag or id list. Every mutation is a transactional
//! read-modify-write so concurrent callers never lose an update:
//!
//! ```text
//! toggle_flag(u1, super_admin)
//!   tx.get(userClaims/u1)         read stamped
//!   claims.super_admin = !old     absent reads as false
//!   commit                        stale -> re-run from the read
//! ```
//!
//! Publishing pushes the stored map to the external identity provider so
//! issued tokens carry the new claims.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::events::{EventBus, HierarchyEvent};
use crate::config::Config;
use crate::entities::{ClaimValue, ClaimsEntity};
use crate::error::{OrgSyncError, Result};
use crate::store::{run_transaction, DocPath, DocumentStore, FieldPath, Transaction};

/// External identity service that stamps claims onto issued tokens
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn set_custom_claims(&self, uid: &str, claims: &BTreeMap<String, ClaimValue>) -> Result<()>;
}

/// Identity provider that records every publish; used by tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingIdentityProvider {
    published: Mutex<Vec<(String, BTreeMap<String, ClaimValue>)>>,
}

impl RecordingIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<(String, BTreeMap<String, ClaimValue>)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl IdentityProvider for RecordingIdentityProvider {
    async fn set_custom_claims(&self, uid: &str, claims: &BTreeMap<String, ClaimValue>) -> Result<()> {
        self.published
            .lock()
            .await
            .push((uid.to_string(), claims.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleStatus {
    Enabled,
    Disabled,
}

impl From<bool> for ToggleStatus {
    fn from(value: bool) -> Self {
        if value {
            ToggleStatus::Enabled
        } else {
            ToggleStatus::Disabled
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleOutcome {
    pub status: ToggleStatus,
    pub flag: String,
    pub updated_claims: BTreeMap<String, ClaimValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdChange {
    Grant,
    Revoke,
}

/// Owned inputs for one claims transaction
#[derive(Debug, Clone)]
struct ClaimRequest {
    path: DocPath,
    claims_field: FieldPath,
    claim: String,
}

impl ClaimRequest {
    fn claim_field(&self) -> FieldPath {
        let mut segments = self.claims_field.segments().to_vec();
        segments.push(self.claim.clone());
        FieldPath::from(segments.join("."))
    }
}

async fn load_claims(tx: &mut Transaction, req: &ClaimRequest) -> Result<ClaimsEntity> {
    let doc = tx
        .get(&req.path)
        .await?
        .ok_or_else(|| OrgSyncError::NotFound(req.path.to_string()))?;
    ClaimsEntity::from_document(&req.path, &doc, &req.claims_field)
}

async fn toggle_in_tx(tx: &mut Transaction, req: ClaimRequest) -> Result<ToggleOutcome> {
    let mut entity = load_claims(tx, &req).await?;
    let enabled = !entity.flag(&req.claim)?;

    tx.update(req.path.clone(), vec![(req.claim_field(), Value::Bool(enabled))]);
    entity.claims.insert(req.claim.clone(), ClaimValue::Flag(enabled));

    Ok(ToggleOutcome {
        status: enabled.into(),
        flag: req.claim,
        updated_claims: entity.claims,
    })
}

async fn change_ids_in_tx(
    tx: &mut Transaction,
    req: ClaimRequest,
    change: IdChange,
    ids: Vec<String>,
) -> Result<Vec<String>> {
    let entity = load_claims(tx, &req).await?;
    let current = entity.ids(&req.claim)?;

    let updated: Vec<String> = match change {
        IdChange::Grant => {
            let mut seen: BTreeSet<String> = current.iter().cloned().collect();
            let mut out = current.clone();
            for id in ids {
                if seen.insert(id.clone()) {
                    out.push(id);
                }
            }
            out
        }
        IdChange::Revoke => {
            let drop: BTreeSet<&String> = ids.iter().collect();
            current.iter().filter(|id| !drop.contains(id)).cloned().collect()
        }
    };

    if updated != current {
        let value = serde_json::to_value(&updated)?;
        tx.update(req.path.clone(), vec![(req.claim_field(), value)]);
    }
    Ok(updated)
}

/// Transactional edits to per-user claims records
pub struct ClaimsPropagationService {
    store: Arc<dyn DocumentStore>,
    config: Arc<Config>,
    events: Arc<EventBus>,
    identity: Arc<dyn IdentityProvider>,
}

impl ClaimsPropagationService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: Arc<Config>,
        events: Arc<EventBus>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            store,
            config,
            events,
            identity,
        }
    }

    fn request(&self, user_id: &str, claim: &str) -> Result<ClaimRequest> {
        if user_id.trim().is_empty() {
            return Err(OrgSyncError::Validation("user id must not be blank".into()));
        }
        if claim.trim().is_empty() || claim.contains('.') {
            return Err(OrgSyncError::Validation(format!(
                "invalid claim name '{}'",
                claim
            )));
        }
        Ok(ClaimRequest {
            path: self.claims_path(user_id),
            claims_field: self.config.claims_field(),
            claim: claim.to_string(),
        })
    }

    pub fn claims_path(&self, user_id: &str) -> DocPath {
        DocPath::new(self.config.claims_collection.as_str(), user_id)
    }

    /// Invert a boolean claim; an absent flag reads as false
    pub async fn toggle_flag(&self, user_id: &str, flag: &str) -> Result<ToggleOutcome> {
        let req = self.request(user_id, flag)?;

        let outcome = run_transaction(
            &self.store,
            self.config.max_transaction_attempts,
            move |tx| Box::pin(toggle_in_tx(tx, req.clone())),
        )
        .await?;

        info!(user_id = %user_id, flag = %flag, status = ?outcome.status, "Claim toggled");
        self.events.emit(HierarchyEvent::ClaimsChanged {
            user_id: user_id.to_string(),
            claim: flag.to_string(),
        });
        Ok(outcome)
    }

    /// Add ids to a list claim, keeping existing order and skipping duplicates
    pub async fn grant_ids(&self, user_id: &str, claim: &str, ids: &[String]) -> Result<Vec<String>> {
        self.change_ids(user_id, claim, IdChange::Grant, ids).await
    }

    /// Remove ids from a list claim
    pub async fn revoke_ids(&self, user_id: &str, claim: &str, ids: &[String]) -> Result<Vec<String>> {
        self.change_ids(user_id, claim, IdChange::Revoke, ids).await
    }

    async fn change_ids(
        &self,
        user_id: &str,
        claim: &str,
        change: IdChange,
        ids: &[String],
    ) -> Result<Vec<String>> {
        let req = self.request(user_id, claim)?;
        let ids = ids.to_vec();

        let updated = run_transaction(
            &self.store,
            self.config.max_transaction_attempts,
            move |tx| Box::pin(change_ids_in_tx(tx, req.clone(), change, ids.clone())),
        )
        .await?;

        debug!(user_id = %user_id, claim = %claim, change = ?change, count = updated.len(), "List claim updated");
        self.events.emit(HierarchyEvent::ClaimsChanged {
            user_id: user_id.to_string(),
            claim: claim.to_string(),
        });
        Ok(updated)
    }

    /// Push the stored claims map to the identity provider
    pub async fn publish(&self, user_id: &str) -> Result<BTreeMap<String, ClaimValue>> {
        let path = self.claims_path(user_id);
        let stored = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| OrgSyncError::NotFound(path.to_string()))?;
        let entity = ClaimsEntity::from_document(&path, &stored.data, &self.config.claims_field())?;

        self.identity
            .set_custom_claims(user_id, &entity.claims)
            .await?;

        info!(user_id = %user_id, claims = entity.claims.len(), "Claims published");
        self.events.emit(HierarchyEvent::ClaimsPublished {
            user_id: user_id.to_string(),
        });
        Ok(entity.claims)
    }
}
