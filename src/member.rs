//! Member identity records.
//!
//! A [`Member`] is created locally with [`UNASSIGNED_ID`], receives its
//! final id exactly once (self-assigned when founding a group, otherwise
//! derived from the admitting member's roster) and afterwards only ever
//! changes through the one-way coordinator flag.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::GroupError;

/// Id carried by a member that has not been admitted yet.
pub const UNASSIGNED_ID: i64 = -1;

/// Identity of one process in the group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Group-unique id, [`UNASSIGNED_ID`] until admission.
    pub id: i64,
    /// Case-insensitively unique display name.
    pub username: String,
    /// Host other members dial.
    pub address: String,
    /// Listener port.
    pub port: u16,
    /// Sticky: once set it is never cleared for this record.
    #[serde(default)]
    pub is_coordinator: bool,
}

impl Member {
    /// Create an unadmitted member after validating `username`.
    pub fn new(username: &str, address: &str, port: u16) -> Result<Self, GroupError> {
        validate_username(username)?;
        Ok(Self {
            id: UNASSIGNED_ID,
            username: username.to_string(),
            address: address.to_string(),
            port,
            is_coordinator: false,
        })
    }

    /// Rebuild a member announced by another process.
    pub fn with_id(username: &str, id: i64, address: &str, port: u16) -> Self {
        Self {
            id,
            username: username.to_string(),
            address: address.to_string(),
            port,
            is_coordinator: false,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.id != UNASSIGNED_ID
    }

    /// Assign the final id.  Returns `false` (and changes nothing) if an
    /// id was already assigned.
    pub fn assign_id(&mut self, id: i64) -> bool {
        if self.is_assigned() {
            return false;
        }
        self.id = id;
        true
    }

    /// Mark this record as coordinator.  There is no inverse.
    pub fn promote(&mut self) {
        self.is_coordinator = true;
    }

    /// Case-insensitive username comparison.
    pub fn has_username(&self, name: &str) -> bool {
        self.username.to_lowercase() == name.to_lowercase()
    }

    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.has_username(&other.username)
            && self.address.eq_ignore_ascii_case(&other.address)
            && self.port == other.port
            && self.is_coordinator == other.is_coordinator
    }
}

impl Eq for Member {}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = if self.is_coordinator {
            "coordinator"
        } else {
            "member"
        };
        write!(f, "{}-{}-{} ({})", self.username, self.id, level, self.socket_addr())
    }
}

/// Check the username syntax: non-empty, no whitespace, no `:`.
pub fn validate_username(name: &str) -> Result<(), GroupError> {
    let reason = if name.is_empty() {
        "cannot be empty"
    } else if name.chars().any(char::is_whitespace) {
        "cannot contain whitespace"
    } else if name.contains(':') {
        "cannot contain ':'"
    } else {
        return Ok(());
    };
    Err(GroupError::InvalidUsername {
        username: name.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_member_is_unassigned() {
        let m = Member::new("alice", "127.0.0.1", 7100).unwrap();
        assert_eq!(m.id, UNASSIGNED_ID);
        assert!(!m.is_assigned());
        assert!(!m.is_coordinator);
    }

    #[test]
    fn test_username_rules() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("Bob_2").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("al ice").is_err());
        assert!(validate_username("al\tice").is_err());
        assert!(validate_username("al:ice").is_err());
        assert!(matches!(
            Member::new("a b", "h", 1),
            Err(GroupError::InvalidUsername { .. })
        ));
    }

    #[test]
    fn test_id_assigned_exactly_once() {
        let mut m = Member::new("alice", "127.0.0.1", 7100).unwrap();
        assert!(m.assign_id(3));
        assert!(!m.assign_id(7));
        assert_eq!(m.id, 3);
    }

    #[test]
    fn test_equality_is_case_insensitive() {
        let a = Member::with_id("Alice", 1, "Host.Local", 7100);
        let b = Member::with_id("alice", 1, "host.local", 7100);
        assert_eq!(a, b);

        let mut c = b.clone();
        c.promote();
        assert_ne!(a, c);
        assert_ne!(a, Member::with_id("alice", 2, "host.local", 7100));
    }

    #[test]
    fn test_socket_addr_brackets_ipv6() {
        assert_eq!(Member::with_id("a", 0, "10.0.0.1", 80).socket_addr(), "10.0.0.1:80");
        assert_eq!(Member::with_id("a", 0, "::1", 80).socket_addr(), "[::1]:80");
    }
}
