//! Error types for orgsync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrgSyncError {
    /// Referenced document is absent. Repair scans absorb this; writes surface it.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Transaction retry budget exhausted under contention
    #[error("Transaction conflict on {path} after {attempts} attempts")]
    Conflict { path: String, attempts: u32 },

    #[error("Validation error: {0}")]
    Validation(String),

    /// A batch was constructed past the configured limit. Always a bug.
    #[error("Batch of {size} operations exceeds limit of {limit}")]
    BatchLimitExceeded { size: usize, limit: usize },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrgSyncError {
    /// Whether redelivering the triggering event can succeed.
    ///
    /// Conflicts and store failures are transient; every operation is
    /// idempotent, so the trigger platform may simply redeliver.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrgSyncError::Conflict { .. } | OrgSyncError::Store(_))
    }
}

impl From<toml::de::Error> for OrgSyncError {
    fn from(e: toml::de::Error) -> Self {
        OrgSyncError::Config(e.to_string())
    }
}

/// Result type for orgsync operations
pub type Result<T> = std::result::Result<T, OrgSyncError>;
