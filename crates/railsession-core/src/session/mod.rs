//! Per-user session state machine.
//!
//! One [`SessionManager`] runs per configured user as its own task. Other
//! tasks observe and stop it through a cloneable [`SessionHandle`].

pub mod handle;
pub mod manager;
pub mod passengers;
pub mod state;

use thiserror::Error;

use crate::api::ApiError;
use crate::cluster::{ClusterRole, StoreError};
use crate::config::ConfigError;

pub use handle::{Liveness, SessionHandle};
pub use manager::{SessionManager, SessionSettings};
pub use passengers::{resolve_members, MemberQuery};
pub use state::{ReadyState, SessionEvent};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Passenger '{member}' not found for user {identity}")]
    UnknownPassenger { identity: String, member: String },

    #[error("Login for user {identity} was rejected")]
    LoginFailed { identity: String },

    #[error("Session destroyed")]
    Destroyed,

    #[error("The {0} role needs a credential store")]
    StoreRequired(ClusterRole),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to set up session: {0:#}")]
    Setup(anyhow::Error),
}
