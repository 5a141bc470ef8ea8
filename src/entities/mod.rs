//! Typed views of stored documents
//!
//! Documents arrive as loosely-typed JSON. Services decode them here before
//! acting on them, so a malformed document fails as a validation error at
//! the store boundary instead of being silently misread.

mod claims;
mod descendant;
mod org;
mod user;

pub use claims::{ClaimValue, ClaimsEntity};
pub use descendant::{DescendantEntity, RunEntity, TrialEntity};
pub use org::{normalize_name, OrgEntity};
pub use user::{DateRange, Membership, UserEntity};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{OrgSyncError, Result};
use crate::store::{DocPath, Document};

/// Kind of node in the organization hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgType {
    District,
    School,
    Class,
    Group,
    Family,
}

impl OrgType {
    pub const ALL: [OrgType; 5] = [
        OrgType::District,
        OrgType::School,
        OrgType::Class,
        OrgType::Group,
        OrgType::Family,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrgType::District => "district",
            OrgType::School => "school",
            OrgType::Class => "class",
            OrgType::Group => "group",
            OrgType::Family => "family",
        }
    }

    /// Plural form, the default collection name
    pub fn plural(&self) -> &'static str {
        match self {
            OrgType::District => "districts",
            OrgType::School => "schools",
            OrgType::Class => "classes",
            OrgType::Group => "groups",
            OrgType::Family => "families",
        }
    }
}

impl fmt::Display for OrgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrgType {
    type Err = OrgSyncError;

    /// Accepts singular or plural, any case
    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_lowercase();
        OrgType::ALL
            .into_iter()
            .find(|t| t.as_str() == lowered || t.plural() == lowered)
            .ok_or_else(|| OrgSyncError::Validation(format!("unknown org type '{}'", s)))
    }
}

/// Decode a raw document into `T`, reporting failures against its path
pub fn decode<T: DeserializeOwned>(path: &DocPath, doc: &Document) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(doc.clone()))
        .map_err(|e| OrgSyncError::Validation(format!("malformed document {}: {}", path, e)))
}

/// Treat an explicit `null` like a missing field
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_org_type_parsing() {
        assert_eq!("groups".parse::<OrgType>().unwrap(), OrgType::Group);
        assert_eq!(" District ".parse::<OrgType>().unwrap(), OrgType::District);
        assert_eq!("classes".parse::<OrgType>().unwrap(), OrgType::Class);
        assert!("campus".parse::<OrgType>().is_err());
    }

    #[test]
    fn test_org_type_serde_lowercase() {
        assert_eq!(serde_json::to_string(&OrgType::Family).unwrap(), "\"family\"");
        let parsed: OrgType = serde_json::from_value(json!("school")).unwrap();
        assert_eq!(parsed, OrgType::School);
    }

    #[test]
    fn test_decode_failure_is_validation() {
        let path = DocPath::new("groups", "G1");
        let doc = json!({ "subGroups": "not-a-list" }).as_object().cloned().unwrap();
        let err = decode::<OrgEntity>(&path, &doc).unwrap_err();
        assert!(matches!(err, OrgSyncError::Validation(ref m) if m.contains("groups/G1")));
    }
}
