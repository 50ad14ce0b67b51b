//! Access control at accept time.

use crate::config::AccessSettings;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

/// Decision for one accepted peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Close the socket right away
    Deny,
    Allow,
    /// Admit even past the max-connection limit
    Trusted,
}

/// Decides whether an accepted peer may proceed.
pub trait AccessPolicy: Send + Sync {
    fn check(&self, peer: SocketAddr) -> Access;
}

/// Allow and trusted lists keyed by IP address. An empty allow list admits
/// everyone; trusted addresses are always admitted.
#[derive(Debug, Clone, Default)]
pub struct IpAccessList {
    allow: HashSet<IpAddr>,
    trusted: HashSet<IpAddr>,
}

impl IpAccessList {
    pub fn new(
        allow: impl IntoIterator<Item = IpAddr>,
        trusted: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            allow: allow.into_iter().map(|ip| ip.to_canonical()).collect(),
            trusted: trusted.into_iter().map(|ip| ip.to_canonical()).collect(),
        }
    }

    pub fn from_settings(settings: &AccessSettings) -> Self {
        Self::new(
            settings.allow.iter().copied(),
            settings.trusted.iter().copied(),
        )
    }
}

impl AccessPolicy for IpAccessList {
    fn check(&self, peer: SocketAddr) -> Access {
        // IPv4-mapped IPv6 peers match their IPv4 entries
        let ip = peer.ip().to_canonical();
        if self.trusted.contains(&ip) {
            Access::Trusted
        } else if self.allow.is_empty() || self.allow.contains(&ip) {
            Access::Allow
        } else {
            Access::Deny
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_list_allows_all() {
        let policy = IpAccessList::default();
        assert_eq!(policy.check(addr("10.0.0.1:1234")), Access::Allow);
    }

    #[test]
    fn test_allow_and_trusted() {
        let policy = IpAccessList::from_settings(&AccessSettings {
            allow: vec!["10.0.0.1".parse().unwrap()],
            trusted: vec!["127.0.0.1".parse().unwrap()],
        });

        assert_eq!(policy.check(addr("10.0.0.1:1")), Access::Allow);
        assert_eq!(policy.check(addr("10.0.0.2:1")), Access::Deny);
        assert_eq!(policy.check(addr("127.0.0.1:1")), Access::Trusted);
        assert_eq!(policy.check(addr("[::ffff:127.0.0.1]:1")), Access::Trusted);
    }
}
