//! orgsync - consistency maintenance for organization hierarchies
//!
//! Keeps a tree of organization records (districts, schools, classes,
//! groups, families) and the per-user records hanging off it consistent
//! inside a transactional document store.
//!
//! ## Services
//!
//! - **Reference repair**: clears parent pointers left behind when a node
//!   is detached or deleted, in one optimistic transaction
//! - **Cascading soft delete**: archives a root and every descendant along
//!   a configured chain of collections, in batches bounded by the store's
//!   per-batch limit
//! - **Claims propagation**: linearizable toggles and list edits on per-user
//!   authorization claims, published to the identity provider
//!
//! ## Drivers
//!
//! - **Triggers**: route store change events to the services
//! - **Migrations**: resumable, checkpointed scans that call the same services
//! - **Audit**: read-only invariant report
//! - **CLI**: the `orgsync` binary over a JSON snapshot or MongoDB

pub mod audit;
pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod migrations;
pub mod services;
pub mod store;
pub mod triggers;

pub use config::Config;
pub use error::{OrgSyncError, Result};
pub use services::Services;
pub use store::{DocPath, DocumentStore, MemoryStore};
