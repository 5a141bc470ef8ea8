//! User documents and their org memberships

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{null_as_default, OrgType};

/// Active window of a membership
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

/// Membership in orgs of one type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    /// Every org the user has ever belonged to
    #[serde(default, deserialize_with = "null_as_default")]
    pub all: Vec<String>,
    /// Orgs the user belongs to now
    #[serde(default, deserialize_with = "null_as_default")]
    pub current: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dates: BTreeMap<String, DateRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub districts: Membership,
    #[serde(default, deserialize_with = "null_as_default")]
    pub schools: Membership,
    #[serde(default, deserialize_with = "null_as_default")]
    pub classes: Membership,
    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: Membership,
    #[serde(default, deserialize_with = "null_as_default")]
    pub families: Membership,

    #[serde(default, deserialize_with = "null_as_default")]
    pub archived: bool,
}

impl UserEntity {
    pub fn membership(&self, org_type: OrgType) -> &Membership {
        match org_type {
            OrgType::District => &self.districts,
            OrgType::School => &self.schools,
            OrgType::Class => &self.classes,
            OrgType::Group => &self.groups,
            OrgType::Family => &self.families,
        }
    }

    /// Current memberships across every org type
    pub fn current_orgs(&self) -> impl Iterator<Item = (OrgType, &str)> + '_ {
        OrgType::ALL.into_iter().flat_map(move |t| {
            self.membership(t)
                .current
                .iter()
                .map(move |id| (t, id.as_str()))
        })
    }
}
