//! Document addressing and field access
//!
//! Documents are JSON objects. A [`DocPath`] names one document as
//! `collection/id`, where the collection may itself be nested
//! (`users/u1/runs/r1`). A [`FieldPath`] addresses a value inside a
//! document using dotted segments (`claims.super_admin`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{OrgSyncError, Result};

/// Raw document payload as stored
pub type Document = Map<String, Value>;

/// Location of a single document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocPath {
    collection: String,
    id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Parse `collection/id`; the id is the last segment
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_matches('/');
        match trimmed.rsplit_once('/') {
            Some((collection, id)) if !collection.is_empty() && !id.is_empty() => {
                Ok(Self::new(collection, id))
            }
            _ => Err(OrgSyncError::Validation(format!(
                "document path must look like collection/id, got '{}'",
                raw
            ))),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

impl FromStr for DocPath {
    type Err = OrgSyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocPath {
    type Error = OrgSyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DocPath> for String {
    fn from(path: DocPath) -> Self {
        path.to_string()
    }
}

/// Dotted path to a field inside a document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for FieldPath {
    fn from(raw: &str) -> Self {
        FieldPath(
            raw.split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

impl From<String> for FieldPath {
    fn from(raw: String) -> Self {
        FieldPath::from(raw.as_str())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Field-level access on raw documents
pub trait DocumentExt {
    /// Value at `field`, if every segment resolves
    fn field(&self, field: &FieldPath) -> Option<&Value>;

    /// String value at `field`; null and non-string values read as absent
    fn field_str(&self, field: &FieldPath) -> Option<&str> {
        self.field(field).and_then(Value::as_str)
    }

    /// Set `field`, creating intermediate objects as needed
    fn set_field(&mut self, field: &FieldPath, value: Value) -> Result<()>;
}

impl DocumentExt for Document {
    fn field(&self, field: &FieldPath) -> Option<&Value> {
        let (first, rest) = field.segments().split_first()?;
        let mut current = self.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    fn set_field(&mut self, field: &FieldPath, value: Value) -> Result<()> {
        let Some((last, parents)) = field.segments().split_last() else {
            return Err(OrgSyncError::Validation("empty field path".into()));
        };

        let mut current = self;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if entry.is_null() {
                *entry = Value::Object(Map::new());
            }
            current = entry.as_object_mut().ok_or_else(|| {
                OrgSyncError::Validation(format!(
                    "cannot set '{}': segment '{}' is not an object",
                    field, segment
                ))
            })?;
        }
        current.insert(last.clone(), value);
        Ok(())
    }
}
