//! Configuration for orgsync
//!
//! Loaded from TOML; every field has a default matching the hosted data
//! layout, so an empty file is a valid configuration. [`Config::validate`]
//! runs before any store access.
//!
//! ```toml
//! batch_limit = 500
//! max_transaction_attempts = 5
//!
//! [[chains.users]]
//! collection = "users"
//!
//! [[chains.users]]
//! collection = "runs"
//! parent_field = "parentUserId"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::entities::OrgType;
use crate::error::{OrgSyncError, Result};
use crate::store::FieldPath;

/// One level of a cascade chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDescriptor {
    /// Collection holding this level's documents
    pub collection: String,
    /// Field referencing the previous level's document id (absent on the root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_field: Option<String>,
}

impl LevelDescriptor {
    pub fn root(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            parent_field: None,
        }
    }

    pub fn child(collection: &str, parent_field: &str) -> Self {
        Self {
            collection: collection.to_string(),
            parent_field: Some(parent_field.to_string()),
        }
    }
}

/// A list field on a parent org naming its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildListField {
    pub field: String,
    pub child_type: OrgType,
}

impl ChildListField {
    fn new(field: &str, child_type: OrgType) -> Self {
        Self {
            field: field.to_string(),
            child_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Soft-delete flag written by cascades
    #[serde(default = "default_archived_field")]
    pub archived_field: String,

    /// Parent pointer on group documents
    #[serde(default = "default_group_parent_field")]
    pub group_parent_field: String,

    /// Field on a non-group child that references a parent of the keyed type
    #[serde(default = "default_parent_fields")]
    pub parent_fields: BTreeMap<OrgType, String>,

    /// List fields on a parent that enumerate its children
    #[serde(default = "default_child_fields")]
    pub child_fields: BTreeMap<OrgType, Vec<ChildListField>>,

    /// Collection per org type
    #[serde(default = "default_collections")]
    pub collections: BTreeMap<OrgType, String>,

    #[serde(default = "default_users_collection")]
    pub users_collection: String,

    #[serde(default = "default_claims_collection")]
    pub claims_collection: String,

    /// Field in a claims record holding the claims map
    #[serde(default = "default_claims_field")]
    pub claims_field: String,

    /// Maximum operations per batched write
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    #[serde(default = "default_max_transaction_attempts")]
    pub max_transaction_attempts: u32,

    /// Named cascade chains, root level first
    #[serde(default = "default_chains")]
    pub chains: BTreeMap<String, Vec<LevelDescriptor>>,
}

fn default_archived_field() -> String {
    "archived".to_string()
}

fn default_group_parent_field() -> String {
    "parentOrgId".to_string()
}

fn default_parent_fields() -> BTreeMap<OrgType, String> {
    BTreeMap::from([
        (OrgType::District, "districtId".to_string()),
        (OrgType::School, "schoolId".to_string()),
        (OrgType::Class, "classId".to_string()),
    ])
}

fn default_child_fields() -> BTreeMap<OrgType, Vec<ChildListField>> {
    BTreeMap::from([
        (
            OrgType::District,
            vec![
                ChildListField::new("schools", OrgType::School),
                ChildListField::new("subGroups", OrgType::Group),
            ],
        ),
        (OrgType::School, vec![ChildListField::new("classes", OrgType::Class)]),
        (OrgType::Group, vec![ChildListField::new("subGroups", OrgType::Group)]),
    ])
}

fn default_collections() -> BTreeMap<OrgType, String> {
    OrgType::ALL
        .into_iter()
        .map(|t| (t, t.plural().to_string()))
        .collect()
}

fn default_users_collection() -> String {
    "users".to_string()
}

fn default_claims_collection() -> String {
    "userClaims".to_string()
}

fn default_claims_field() -> String {
    "claims".to_string()
}

fn default_batch_limit() -> usize {
    500
}

fn default_max_transaction_attempts() -> u32 {
    5
}

fn default_chains() -> BTreeMap<String, Vec<LevelDescriptor>> {
    let descendants = |root: &str| {
        vec![
            LevelDescriptor::root(root),
            LevelDescriptor::child("runs", "parentUserId"),
            LevelDescriptor::child("trials", "parentRunId"),
        ]
    };
    BTreeMap::from([
        ("users".to_string(), descendants("users")),
        ("guests".to_string(), descendants("guests")),
    ])
}

impl Default for Config {
    fn default() -> Self {
        Self {
            archived_field: default_archived_field(),
            group_parent_field: default_group_parent_field(),
            parent_fields: default_parent_fields(),
            child_fields: default_child_fields(),
            collections: default_collections(),
            users_collection: default_users_collection(),
            claims_collection: default_claims_collection(),
            claims_field: default_claims_field(),
            batch_limit: default_batch_limit(),
            max_transaction_attempts: default_max_transaction_attempts(),
            chains: default_chains(),
        }
    }
}

fn require_name(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(OrgSyncError::Validation(format!("{} must not be blank", what)));
    }
    Ok(())
}

impl Config {
    /// Load and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        require_name("archived_field", &self.archived_field)?;
        require_name("group_parent_field", &self.group_parent_field)?;
        require_name("users_collection", &self.users_collection)?;
        require_name("claims_collection", &self.claims_collection)?;
        require_name("claims_field", &self.claims_field)?;

        if self.batch_limit == 0 {
            return Err(OrgSyncError::Validation("batch_limit must be at least 1".into()));
        }
        if self.max_transaction_attempts == 0 {
            return Err(OrgSyncError::Validation(
                "max_transaction_attempts must be at least 1".into(),
            ));
        }

        for (org_type, field) in &self.parent_fields {
            require_name(&format!("parent_fields.{}", org_type), field)?;
        }
        for (org_type, fields) in &self.child_fields {
            for child in fields {
                require_name(&format!("child_fields.{}", org_type), &child.field)?;
            }
        }
        for org_type in OrgType::ALL {
            let collection = self.collections.get(&org_type).ok_or_else(|| {
                OrgSyncError::Validation(format!("no collection configured for {}", org_type))
            })?;
            require_name(&format!("collections.{}", org_type), collection)?;
        }

        for (name, levels) in &self.chains {
            validate_chain(name, levels)?;
        }
        Ok(())
    }

    pub fn collection_for(&self, org_type: OrgType) -> &str {
        self.collections
            .get(&org_type)
            .map(String::as_str)
            .unwrap_or_else(|| org_type.plural())
    }

    pub fn org_type_for_collection(&self, collection: &str) -> Option<OrgType> {
        OrgType::ALL
            .into_iter()
            .find(|t| self.collection_for(*t) == collection)
    }

    /// Field on a `child_type` document that references a parent of `parent_type`
    ///
    /// Groups always use `group_parent_field`; other types use the field keyed
    /// by the parent's type, which may be unconfigured.
    pub fn parent_field_for(&self, parent_type: OrgType, child_type: OrgType) -> Option<FieldPath> {
        if child_type == OrgType::Group {
            return Some(FieldPath::from(self.group_parent_field.as_str()));
        }
        self.parent_fields
            .get(&parent_type)
            .map(|f| FieldPath::from(f.as_str()))
    }

    pub fn child_fields_for(&self, org_type: OrgType) -> &[ChildListField] {
        self.child_fields
            .get(&org_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn archived_field(&self) -> FieldPath {
        FieldPath::from(self.archived_field.as_str())
    }

    pub fn claims_field(&self) -> FieldPath {
        FieldPath::from(self.claims_field.as_str())
    }

    /// Levels of the named chain
    pub fn chain(&self, name: &str) -> Result<&[LevelDescriptor]> {
        self.chains
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| OrgSyncError::Validation(format!("unknown cascade chain '{}'", name)))
    }

    /// Name of the chain rooted at `collection`, if any
    pub fn chain_rooted_at(&self, collection: &str) -> Option<&str> {
        self.chains
            .iter()
            .find(|(_, levels)| levels.first().map(|l| l.collection.as_str()) == Some(collection))
            .map(|(name, _)| name.as_str())
    }
}

/// Root level has no parent field; every later level has one
pub fn validate_chain(name: &str, levels: &[LevelDescriptor]) -> Result<()> {
    let Some((root, rest)) = levels.split_first() else {
        return Err(OrgSyncError::Validation(format!("chain '{}' has no levels", name)));
    };

    require_name(&format!("chain '{}' root collection", name), &root.collection)?;
    if root.parent_field.is_some() {
        return Err(OrgSyncError::Validation(format!(
            "chain '{}' root level must not have a parent field",
            name
        )));
    }

    for level in rest {
        require_name(&format!("chain '{}' collection", name), &level.collection)?;
        match &level.parent_field {
            Some(field) => require_name(
                &format!("chain '{}' level '{}' parent field", name, level.collection),
                field,
            )?,
            None => {
                return Err(OrgSyncError::Validation(format!(
                    "chain '{}' level '{}' is missing its parent field",
                    name, level.collection
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.archived_field, "archived");
        assert_eq!(config.batch_limit, 500);
        assert_eq!(config.chain("users").unwrap().len(), 3);
        assert_eq!(config.chain_rooted_at("guests"), Some("guests"));
        assert_eq!(config.chain_rooted_at("runs"), None);
    }

    #[test]
    fn test_parent_field_resolution() {
        let config = Config::default();
        assert_eq!(
            config
                .parent_field_for(OrgType::District, OrgType::Group)
                .map(|f| f.to_string()),
            Some("parentOrgId".to_string())
        );
        assert_eq!(
            config
                .parent_field_for(OrgType::School, OrgType::Class)
                .map(|f| f.to_string()),
            Some("schoolId".to_string())
        );
        assert_eq!(config.parent_field_for(OrgType::Family, OrgType::Class), None);
    }

    #[test]
    fn test_collection_lookup() {
        let config = Config::default();
        assert_eq!(config.collection_for(OrgType::Class), "classes");
        assert_eq!(config.org_type_for_collection("families"), Some(OrgType::Family));
        assert_eq!(config.org_type_for_collection("users"), None);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            batch_limit = 2
            archived_field = "isArchived"

            [[chains.districts]]
            collection = "districts"

            [[chains.districts]]
            collection = "schools"
            parent_field = "districtId"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.batch_limit, 2);
        assert_eq!(config.archived_field, "isArchived");
        assert!(config.chain("users").is_err());
        assert_eq!(config.chain("districts").unwrap()[1].collection, "schools");
    }

    #[test]
    fn test_invalid_chains_rejected() {
        assert!(validate_chain("empty", &[]).is_err());
        assert!(validate_chain("rooted", &[LevelDescriptor::child("users", "x")]).is_err());
        assert!(validate_chain(
            "orphan",
            &[LevelDescriptor::root("users"), LevelDescriptor::root("runs")]
        )
        .is_err());
        assert!(validate_chain(
            "ok",
            &[LevelDescriptor::root("users"), LevelDescriptor::child("runs", "parentUserId")]
        )
        .is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = Config {
            batch_limit: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(OrgSyncError::Validation(_))));

        let config = Config {
            max_transaction_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orgsync.toml");
        std::fs::write(&path, "max_transaction_attempts = 9\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_transaction_attempts, 9);

        std::fs::write(&path, "batch_limit = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
