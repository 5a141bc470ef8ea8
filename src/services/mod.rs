//! Service layer for orgsync
//!
//! Services hold the hierarchy-consistency logic between event delivery
//! (triggers, migrations, CLI) and the document store. Each service:
//! - Validates its input before touching the store
//! - Commits through a transaction or bounded batches
//! - Emits an event after a successful commit
//!
//! ## Architecture
//!
//! ```text
//! TriggerRouter / migrations / CLI
//!     ↓
//! Service Layer (repair, cascade, claims)
//!     ↓
//! DocumentStore (memory, mongo)
//! ```

pub mod cascade;
pub mod claims;
pub mod events;
pub mod reference_repair;

// Re-exports
pub use cascade::{CascadeChain, CascadeResult, CascadeSoftDeleteService, LevelCount};
pub use claims::{
    ClaimsPropagationService, IdentityProvider, RecordingIdentityProvider, ToggleOutcome,
    ToggleStatus,
};
pub use events::{EventBus, HierarchyEvent};
pub use reference_repair::{
    parent_references, resolve_parent, AppliedUpdate, ParentRef, ParentStatus,
    ReferenceRepairService, RepairCandidates,
};

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::store::DocumentStore;

/// Service container for dependency injection
///
/// Holds all services around one explicitly constructed store handle.
pub struct Services {
    pub repair: Arc<ReferenceRepairService>,
    pub cascade: Arc<CascadeSoftDeleteService>,
    pub claims: Arc<ClaimsPropagationService>,
    pub events: Arc<EventBus>,
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
}

impl Services {
    /// Validate `config`, then wire every service to `store`
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: Config,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new());

        Ok(Self {
            repair: Arc::new(ReferenceRepairService::new(
                store.clone(),
                config.clone(),
                events.clone(),
            )),
            cascade: Arc::new(CascadeSoftDeleteService::new(
                store.clone(),
                config.clone(),
                events.clone(),
            )),
            claims: Arc::new(ClaimsPropagationService::new(
                store.clone(),
                config.clone(),
                events.clone(),
                identity,
            )),
            events,
            config,
            store,
        })
    }
}
