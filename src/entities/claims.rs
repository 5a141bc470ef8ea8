//! Per-user authorization claims

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{OrgSyncError, Result};
use crate::store::{DocPath, Document, DocumentExt, FieldPath};

/// One named claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimValue {
    Flag(bool),
    Ids(Vec<String>),
}

/// The claims map held in a claims record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimsEntity {
    pub claims: BTreeMap<String, ClaimValue>,
}

impl ClaimsEntity {
    /// Decode the map stored under `claims_field`; an absent or null map is empty
    pub fn from_document(path: &DocPath, doc: &Document, claims_field: &FieldPath) -> Result<Self> {
        let claims = match doc.field(claims_field) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                OrgSyncError::Validation(format!("malformed claims in {}: {}", path, e))
            })?,
        };
        Ok(Self { claims })
    }

    /// Boolean value of `name`; absent reads as false
    pub fn flag(&self, name: &str) -> Result<bool> {
        match self.claims.get(name) {
            None => Ok(false),
            Some(ClaimValue::Flag(value)) => Ok(*value),
            Some(ClaimValue::Ids(_)) => Err(OrgSyncError::Validation(format!(
                "claim '{}' is a list, not a flag",
                name
            ))),
        }
    }

    /// Ids held by list claim `name`; absent reads as empty
    pub fn ids(&self, name: &str) -> Result<Vec<String>> {
        match self.claims.get(name) {
            None => Ok(Vec::new()),
            Some(ClaimValue::Ids(ids)) => Ok(ids.clone()),
            Some(ClaimValue::Flag(_)) => Err(OrgSyncError::Validation(format!(
                "claim '{}' is a flag, not a list",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims_doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_decode_mixed_claims() {
        let path = DocPath::new("userClaims", "u1");
        let doc = claims_doc(json!({
            "claims": { "super_admin": true, "adminOrgs": ["D1", "S2"] }
        }));
        let entity = ClaimsEntity::from_document(&path, &doc, &"claims".into()).unwrap();

        assert!(entity.flag("super_admin").unwrap());
        assert!(!entity.flag("hyper_admin").unwrap());
        assert_eq!(entity.ids("adminOrgs").unwrap(), vec!["D1", "S2"]);
        assert!(entity.flag("adminOrgs").is_err());
        assert!(entity.ids("super_admin").is_err());
    }

    #[test]
    fn test_missing_claims_map_is_empty() {
        let path = DocPath::new("userClaims", "u1");
        let entity =
            ClaimsEntity::from_document(&path, &claims_doc(json!({ "claims": null })), &"claims".into())
                .unwrap();
        assert!(entity.claims.is_empty());
    }

    #[test]
    fn test_malformed_claim_rejected() {
        let path = DocPath::new("userClaims", "u1");
        let doc = claims_doc(json!({ "claims": { "super_admin": "yes" } }));
        assert!(matches!(
            ClaimsEntity::from_document(&path, &doc, &"claims".into()),
            Err(OrgSyncError::Validation(_))
        ));
    }
}
