use std::fmt;

/// Readiness of one user's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyState {
    /// Never authenticated since start
    #[default]
    NotReady,
    /// Authenticated and usable
    Ready,
    /// Was usable, now waiting on a re-login
    Stale,
    /// `destroy()` was called; terminal
    Destroyed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::NotReady => "not_ready",
            ReadyState::Ready => "ready",
            ReadyState::Stale => "stale",
            ReadyState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Published on the manager's optional event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ReadyState),
    /// The first time the user becomes usable
    UserLoaded { identity: String },
}
