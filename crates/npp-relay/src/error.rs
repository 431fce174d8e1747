//! Error types for the Relay server and client.

use std::fmt;
use std::net::SocketAddr;

use npp_core::ProtoError;
use thiserror::Error;

/// Failure kinds a relay node reports over the wire before closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorKind {
    /// The handshake frame is malformed or its signature does not verify.
    InvalidHandshake,
    /// The handshake names an unknown peer type.
    UnknownPeerType,
    /// The handshake or the wait for a peer took too long.
    Timeout,
    /// This node does not own the requested address.
    WrongNode,
    /// The cluster has no members to own the requested address.
    NoNodes,
}

impl ProtocolErrorKind {
    /// Numeric code carried in responses.
    pub const fn code(self) -> i32 {
        match self {
            Self::InvalidHandshake => 1,
            Self::UnknownPeerType => 2,
            Self::Timeout => 3,
            Self::WrongNode => 4,
            Self::NoNodes => 5,
        }
    }

    /// Looks up the kind for a numeric code.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::InvalidHandshake),
            2 => Some(Self::UnknownPeerType),
            3 => Some(Self::Timeout),
            4 => Some(Self::WrongNode),
            5 => Some(Self::NoNodes),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidHandshake => "invalid handshake",
            Self::UnknownPeerType => "unknown peer type",
            Self::Timeout => "timeout",
            Self::WrongNode => "wrong node",
            Self::NoNodes => "no nodes",
        };
        f.write_str(name)
    }
}

/// Errors produced by relay nodes, their monitoring service and relay clients.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A protocol failure, either detected locally or reported by a node.
    #[error("relay protocol error ({kind}): {description}")]
    Protocol {
        /// What went wrong.
        kind: ProtocolErrorKind,
        /// Human-readable detail.
        description: String,
    },

    /// A node answered with an error code this build does not know.
    #[error("relay error {code}: {description}")]
    Remote {
        /// Wire error code.
        code: i32,
        /// Node-provided description.
        description: String,
    },

    /// A relay node could not be reached.
    #[error("relay {addr} unreachable: {reason}")]
    Unreachable {
        /// Address that was dialed.
        addr: SocketAddr,
        /// Underlying failure.
        reason: String,
    },

    /// Every configured relay failed.
    #[error("all relays failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),

    /// No relay addresses are configured.
    #[error("no relay addresses configured")]
    NoRelays,

    /// Gossip membership failure.
    #[error("gossip error: {0}")]
    Gossip(String),

    /// Invalid configuration.
    #[error("invalid relay configuration: {0}")]
    Config(String),

    /// Failed to bind a listening socket.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// Wire-layer failure.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Builds a protocol error.
    pub fn protocol(kind: ProtocolErrorKind, description: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            description: description.into(),
        }
    }

    /// Reconstructs an error from a non-zero response code.
    pub fn from_code(code: i32, description: String) -> Self {
        match ProtocolErrorKind::from_code(code) {
            Some(kind) => Self::Protocol { kind, description },
            None => Self::Remote { code, description },
        }
    }

    /// Protocol error kind, if this is a protocol error.
    pub const fn kind(&self) -> Option<ProtocolErrorKind> {
        match self {
            Self::Protocol { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Every relay failure may succeed on a later attempt.
    pub const fn is_temporary(&self) -> bool {
        true
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ProtocolErrorKind::InvalidHandshake, 1)]
    #[test_case(ProtocolErrorKind::UnknownPeerType, 2)]
    #[test_case(ProtocolErrorKind::Timeout, 3)]
    #[test_case(ProtocolErrorKind::WrongNode, 4)]
    #[test_case(ProtocolErrorKind::NoNodes, 5)]
    fn codes_are_stable(kind: ProtocolErrorKind, code: i32) {
        assert_eq!(kind.code(), code);
        assert_eq!(ProtocolErrorKind::from_code(code), Some(kind));
    }

    #[test]
    fn unknown_code_becomes_remote() {
        let err = RelayError::from_code(42, "odd".to_string());
        assert!(matches!(err, RelayError::Remote { code: 42, .. }));
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn known_code_keeps_kind() {
        let err = RelayError::from_code(4, "moved".to_string());
        assert_eq!(err.kind(), Some(ProtocolErrorKind::WrongNode));
        assert_eq!(err.to_string(), "relay protocol error (wrong node): moved");
    }

    #[test]
    fn every_error_is_temporary() {
        assert!(RelayError::NoRelays.is_temporary());
        assert!(RelayError::Exhausted(vec!["a".into()]).is_temporary());
        assert!(RelayError::protocol(ProtocolErrorKind::NoNodes, "empty").is_temporary());
    }

    #[test]
    fn exhausted_lists_causes() {
        let err = RelayError::Exhausted(vec!["first".into(), "second".into()]);
        assert_eq!(err.to_string(), "all relays failed: first; second");
    }
}
