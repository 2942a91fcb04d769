//! Cluster role resolution and credential replication.
//!
//! Exactly one process per user is the authority (enforced by whoever assigns
//! roles, not here). It publishes cookies, profile and heartbeat through a
//! [`CredentialStore`]; followers only read from it.

pub mod role;
pub mod store;

pub use role::ClusterRole;
pub use store::{CredentialStore, DirectoryStore, MemoryStore, StoreError};
