//! Host-based authorization table.
//!
//! Rights are a string of single-letter flags; a host either has a flag in
//! its rights string or it does not.

use dashmap::DashMap;
use std::net::IpAddr;

/// User name recorded when rights are granted to an unknown host.
pub const UNKNOWN_USER: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Grant {
    user: String,
    rights: String,
}

#[derive(Debug, Default)]
pub struct AuthTable {
    grants: DashMap<IpAddr, Grant>,
}

impl AuthTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_authentify(&self, host: IpAddr, user: &str, rights: &str) {
        self.grants.insert(
            host,
            Grant {
                user: user.to_string(),
                rights: rights.to_string(),
            },
        );
    }

    pub fn remove_authentify(&self, host: IpAddr) {
        self.grants.remove(&host);
    }

    pub fn authentify_user(&self, host: IpAddr) -> Option<String> {
        self.grants.get(&host).map(|g| g.user.clone())
    }

    pub fn authentify_rights(&self, host: IpAddr) -> Option<String> {
        self.grants.get(&host).map(|g| g.rights.clone())
    }

    /// Append `right` to the host's rights, creating an `unknown` user entry
    /// when the host has none.
    pub fn add_authentify_right(&self, host: IpAddr, right: &str) {
        self.grants
            .entry(host)
            .and_modify(|g| g.rights.push_str(right))
            .or_insert_with(|| Grant {
                user: UNKNOWN_USER.to_string(),
                rights: right.to_string(),
            });
    }

    pub fn has_authentify_right(&self, host: IpAddr, right: &str) -> bool {
        self.grants
            .get(&host)
            .is_some_and(|g| g.rights.contains(right))
    }
}
