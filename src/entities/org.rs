//! Organization node documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{null_as_default, OrgType};

/// Lowercased, trimmed form used for name lookups
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A district, school, class, group or family
///
/// Parent references use the default field names. Services that honor
/// configured field names read them from the raw document instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_name: Option<String>,

    /// Parent of a group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_org_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_org_type: Option<OrgType>,

    /// Parent of a school
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district_id: Option<String>,

    /// Parent of a class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_id: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub schools: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub classes: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub sub_groups: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub archived: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrgEntity {
    /// Whether the stored normalized name agrees with the display name
    pub fn normalized_name_matches(&self) -> bool {
        match &self.normalized_name {
            Some(stored) => *stored == normalize_name(&self.name),
            None => true,
        }
    }
}
