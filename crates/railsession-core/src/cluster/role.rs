use std::fmt;

/// Role of this process for every user it manages, resolved once from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    /// Clustering disabled: log in locally, persist cookies to disk.
    Single,
    /// Cluster master: log in and publish credentials to the store.
    Authority,
    /// Cluster slave: adopt credentials from the store, never log in.
    Follower,
}

impl ClusterRole {
    pub fn is_clustered(&self) -> bool {
        !matches!(self, ClusterRole::Single)
    }

    /// Whether this process may run a login protocol.
    pub fn may_authenticate(&self) -> bool {
        !matches!(self, ClusterRole::Follower)
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterRole::Single => "single",
            ClusterRole::Authority => "authority",
            ClusterRole::Follower => "follower",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_capabilities() {
        assert!(!ClusterRole::Single.is_clustered());
        assert!(ClusterRole::Single.may_authenticate());
        assert!(ClusterRole::Authority.is_clustered());
        assert!(ClusterRole::Authority.may_authenticate());
        assert!(ClusterRole::Follower.is_clustered());
        assert!(!ClusterRole::Follower.may_authenticate());
        assert_eq!(ClusterRole::Follower.to_string(), "follower");
    }
}
