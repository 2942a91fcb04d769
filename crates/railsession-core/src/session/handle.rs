use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use super::{ReadyState, SessionError};

/// Shared "keep going" flag. Cleared once by `destroy()`, checked at the top
/// of every loop that could otherwise run forever.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was still set.
    pub fn kill(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable view of a running session for other tasks.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    identity: String,
    alive: Liveness,
    state: watch::Receiver<ReadyState>,
    retry_time: Duration,
}

impl SessionHandle {
    pub(crate) fn new(
        identity: String,
        alive: Liveness,
        state: watch::Receiver<ReadyState>,
        retry_time: Duration,
    ) -> Self {
        Self {
            identity,
            alive,
            state,
            retry_time,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Stop the session loop at its next check. Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.alive.kill() {
            info!(user = %self.identity, "Session destroyed");
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        if !self.alive.is_alive() {
            return ReadyState::Destroyed;
        }
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.ready_state() == ReadyState::Ready
    }

    /// Block until the session is usable. There is no timeout; only
    /// `destroy()` ends the wait early.
    pub async fn wait_for_ready(&self) -> Result<(), SessionError> {
        loop {
            match self.ready_state() {
                ReadyState::Ready => return Ok(()),
                ReadyState::Destroyed => return Err(SessionError::Destroyed),
                state => {
                    info!(user = %self.identity, %state, "Waiting for user to become ready");
                    tokio::time::sleep(self.retry_time).await;
                }
            }
        }
    }
}
