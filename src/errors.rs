//! Error types for group membership and the wire protocol.
//!
//! [`GroupError`] is what library entry points return to the operator
//! surface.  [`ProtocolError`] covers everything that can go wrong while
//! framing or decoding a single connection; the listener swallows those
//! after logging, so they never take a node down.

use thiserror::Error;

/// Errors surfaced to whoever started or drives a node.
#[derive(Debug, Error)]
pub enum GroupError {
    /// The listening port is already bound (fatal at startup).
    #[error("cannot listen on {addr}: port not available")]
    PortUnavailable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The join target could not be reached or dropped the connection.
    #[error("no member reachable at {target}: {reason}")]
    UnknownMember { target: String, reason: String },

    /// The join target answered with an empty roster.
    #[error("username `{username}` is already taken in this group")]
    DuplicateUsername { username: String },

    /// The username breaks the syntax rules.
    #[error("invalid username `{username}`: {reason}")]
    InvalidUsername { username: String, reason: String },

    /// A join target that is not `host:port`.
    #[error("invalid join target `{target}`, expected host:port")]
    InvalidTarget { target: String },

    /// Framing or decoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GroupError {
    /// Stable identifier used in logs and operator messages.
    pub fn code(&self) -> &'static str {
        match self {
            GroupError::PortUnavailable { .. } => "PortUnavailable",
            GroupError::UnknownMember { .. } => "UnknownMember",
            GroupError::DuplicateUsername { .. } => "DuplicateUsername",
            GroupError::InvalidUsername { .. } => "InvalidUsername",
            GroupError::InvalidTarget { .. } => "InvalidTarget",
            GroupError::Protocol(_) => "Protocol",
            GroupError::Internal(_) => "Internal",
        }
    }

    /// Whether the operator can recover by retrying with different input
    /// (another target, username, or port).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GroupError::PortUnavailable { .. }
                | GroupError::UnknownMember { .. }
                | GroupError::DuplicateUsername { .. }
                | GroupError::InvalidUsername { .. }
                | GroupError::InvalidTarget { .. }
        )
    }

    pub(crate) fn port_unavailable(addr: impl std::fmt::Display, source: std::io::Error) -> Self {
        GroupError::PortUnavailable {
            addr: addr.to_string(),
            source,
        }
    }
}

/// Errors raised while reading or writing a single framed envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid command `{0}`")]
    InvalidCommand(String),

    #[error("expected {expected} envelope, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_codes_are_stable() {
        let err = GroupError::DuplicateUsername {
            username: "alice".to_string(),
        };
        assert_eq!(err.code(), "DuplicateUsername");
        assert!(err.is_retryable());

        let err = GroupError::Protocol(ProtocolError::Timeout(500));
        assert_eq!(err.code(), "Protocol");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_port_unavailable_message_names_address() {
        let addr: SocketAddr = "127.0.0.1:7100".parse().unwrap();
        let err = GroupError::port_unavailable(
            addr,
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        );
        assert_eq!(err.to_string(), "cannot listen on 127.0.0.1:7100: port not available");
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: GroupError = ProtocolError::InvalidCommand("bogus".to_string()).into();
        assert_eq!(err.to_string(), "invalid command `bogus`");
    }
}
