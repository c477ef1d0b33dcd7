//! Types for the `m.room.server_acl` event.

use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

use crate::ServerName;

/// The content of an `m.room.server_acl` event.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RoomServerAclEventContent {
    /// Whether to allow server names that are IP address literals.
    #[serde(
        default = "crate::serde::default_true",
        skip_serializing_if = "crate::serde::is_true"
    )]
    pub allow_ip_literals: bool,

    /// The server names to allow in the room, excluding any port
    /// information.
    ///
    /// Wildcards may be used to cover a wider range of hosts, where `*`
    /// matches zero or more characters and `?` matches exactly one
    /// character.
    #[serde(default)]
    pub allow: Vec<String>,

    /// The server names to disallow in the room, excluding any port
    /// information.
    #[serde(default)]
    pub deny: Vec<String>,
}

impl RoomServerAclEventContent {
    /// Creates a new `RoomServerAclEventContent` with the given settings.
    pub fn new(allow_ip_literals: bool, allow: Vec<String>, deny: Vec<String>) -> Self {
        Self {
            allow_ip_literals,
            allow,
            deny,
        }
    }

    /// Returns true if and only if the server is allowed by this ACL.
    pub fn is_allowed(&self, server_name: &ServerName) -> bool {
        if !self.allow_ip_literals && server_name.is_ip_literal() {
            return false;
        }

        let host = server_name.host();

        if self.deny.iter().any(|d| WildMatch::new(d).matches(host)) {
            return false;
        }

        self.allow.iter().any(|a| WildMatch::new(a).matches(host))
    }
}

#[cfg(test)]
mod tests {
    use super::RoomServerAclEventContent;
    use crate::ServerName;

    fn server(s: &str) -> &ServerName {
        ServerName::parse(s).unwrap()
    }

    #[test]
    fn deny_beats_allow() {
        let acl = RoomServerAclEventContent::new(
            true,
            vec!["*".to_owned()],
            vec!["evil.example".to_owned()],
        );
        assert!(acl.is_allowed(server("matrix.org")));
        assert!(!acl.is_allowed(server("evil.example")));
    }

    #[test]
    fn wildcards_and_ports() {
        let acl =
            RoomServerAclEventContent::new(true, vec!["*.example.com".to_owned()], vec![]);
        assert!(acl.is_allowed(server("host.example.com")));
        assert!(acl.is_allowed(server("host.example.com:8448")));
        assert!(!acl.is_allowed(server("example.org")));
    }

    #[test]
    fn ip_literals() {
        let acl = RoomServerAclEventContent::new(false, vec!["*".to_owned()], vec![]);
        assert!(!acl.is_allowed(server("127.0.0.1")));
        assert!(!acl.is_allowed(server("[::1]")));
        assert!(acl.is_allowed(server("matrix.org")));
    }

    #[test]
    fn empty_allow_denies_everything() {
        let acl = RoomServerAclEventContent::new(true, vec![], vec![]);
        assert!(!acl.is_allowed(server("matrix.org")));
    }
}
