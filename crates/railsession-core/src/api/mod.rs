//! HTTP boundary to the ticketing service.
//!
//! `TicketService` is the black-box contract the login protocols and sessions
//! talk to; `ApiClient` implements it over reqwest, carrying the account's
//! cookie jar on every request.

pub mod client;
pub mod error;
pub mod json;
pub mod service;

pub use client::ApiClient;
pub use error::ApiError;
pub use service::{LoginResult, LoginSubmission, QrIssue, TicketService};
