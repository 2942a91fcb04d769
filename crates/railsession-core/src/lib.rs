//! Core library for railsession.
//!
//! Keeps one ticketing-service account authenticated across a cluster of
//! worker processes. The authority (or a stand-alone node) performs the real
//! login and publishes the resulting cookies and profile to a shared
//! [`cluster::CredentialStore`]; followers adopt whatever was published last.
//!
//! - [`api`]: HTTP boundary to the ticketing service
//! - [`auth`]: QR, credential and slide-captcha login protocols
//! - [`session`]: the per-user session state machine
//! - [`cluster`]: role resolution and credential replication
//! - [`cache`]: per-user files on local disk

pub mod api;
pub mod auth;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod models;
pub mod session;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;
