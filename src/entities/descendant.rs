//! Records nested under a chain root

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::null_as_default;

/// A run under a user or guest, or a trial under a run
///
/// Parent references are named per chain level in the configuration, so
/// only the fields common to every level are typed here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescendantEntity {
    #[serde(default, deserialize_with = "null_as_default")]
    pub archived: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

pub type RunEntity = DescendantEntity;
pub type TrialEntity = DescendantEntity;
