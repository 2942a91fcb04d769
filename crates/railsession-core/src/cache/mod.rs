//! Per-user files on local disk.
//!
//! This module provides the `LocalStore` for state that survives a restart:
//! - the cookie jar of a single-node session
//! - a snapshot of the passenger roster, stale after 60 minutes
//! - downloaded QR code images

pub mod manager;

pub use manager::{file_stem, CachedData, LocalStore};
