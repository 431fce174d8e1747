//! Error types for the Rendezvous server and client.

use std::net::SocketAddr;

use npp_core::ProtoError;
use npp_core::wire::RpcError;
use thiserror::Error;

/// Wire code for a call rejected because the session has too many in flight.
pub const CODE_RESOURCE_EXHAUSTED: i32 = 8;
/// Wire code for [`RendezvousError::NotFound`].
pub const CODE_NOT_FOUND: i32 = 5;
/// Wire code for [`RendezvousError::NoPeerInfo`].
pub const CODE_NO_PEER_INFO: i32 = 9;
/// Wire code for failures without a dedicated variant.
pub const CODE_INTERNAL: i32 = 13;
/// Wire code for [`RendezvousError::Unauthenticated`].
pub const CODE_UNAUTHENTICATED: i32 = 16;

/// Errors produced by Rendezvous calls.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// The transport did not expose the caller's address.
    #[error("no peer info available")]
    NoPeerInfo,

    /// The session carries no authenticated identity.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Nothing is published under the requested address.
    #[error("not found: {0}")]
    NotFound(String),

    /// The Rendezvous server could not be reached.
    #[error("rendezvous {addr} unreachable: {reason}")]
    Unreachable {
        /// Address that was dialed.
        addr: SocketAddr,
        /// Underlying failure.
        reason: String,
    },

    /// The server answered a call with an error that has no local variant.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Wire error code.
        code: i32,
        /// Server-provided description.
        message: String,
    },

    /// The session ended while a call was pending.
    #[error("rendezvous session closed")]
    SessionClosed,

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

impl RendezvousError {
    /// Wire code used when this error is sent to a client.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound(_) => CODE_NOT_FOUND,
            Self::NoPeerInfo => CODE_NO_PEER_INFO,
            Self::Unauthenticated(_) => CODE_UNAUTHENTICATED,
            Self::Remote { code, .. } => *code,
            _ => CODE_INTERNAL,
        }
    }

    /// Converts into the wire representation.
    pub fn to_rpc(&self) -> RpcError {
        let message = match self {
            Self::NotFound(msg) | Self::Unauthenticated(msg) => msg.clone(),
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        RpcError {
            code: self.code(),
            message,
        }
    }

    /// Reconstructs an error received from the server.
    pub fn from_rpc(err: RpcError) -> Self {
        match err.code {
            CODE_NOT_FOUND => Self::NotFound(err.message),
            CODE_NO_PEER_INFO => Self::NoPeerInfo,
            CODE_UNAUTHENTICATED => Self::Unauthenticated(err.message),
            code => Self::Remote {
                code,
                message: err.message,
            },
        }
    }

    /// Every Rendezvous failure may succeed on a later attempt.
    pub const fn is_retryable(&self) -> bool {
        true
    }

    /// Returns true if the failure concerns the session itself rather than
    /// the outcome of a single call.
    pub const fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::SessionClosed | Self::Proto(_) | Self::Io(_)
        )
    }
}

/// Result type for Rendezvous operations.
pub type RendezvousResult<T> = Result<T, RendezvousError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(RendezvousError::NotFound("0xab".into()) ; "not found")]
    #[test_case(RendezvousError::NoPeerInfo ; "no peer info")]
    #[test_case(RendezvousError::Unauthenticated("no identity".into()) ; "unauthenticated")]
    #[test_case(RendezvousError::Remote { code: 42, message: "odd".into() } ; "remote")]
    fn survives_the_wire(err: RendezvousError) {
        let code = err.code();
        let back = RendezvousError::from_rpc(err.to_rpc());
        assert_eq!(back.code(), code);
        assert_eq!(back.to_string(), err.to_string());
    }

    #[test]
    fn local_failures_map_to_internal() {
        let err = RendezvousError::SessionClosed;
        assert_eq!(err.code(), CODE_INTERNAL);
        let back = RendezvousError::from_rpc(err.to_rpc());
        assert!(matches!(back, RendezvousError::Remote { code: CODE_INTERNAL, .. }));
    }

    #[test]
    fn transport_failures_are_classified() {
        assert!(RendezvousError::SessionClosed.is_transport_failure());
        assert!(RendezvousError::Proto(ProtoError::Closed).is_transport_failure());
        assert!(!RendezvousError::NotFound(String::new()).is_transport_failure());
        assert!(RendezvousError::NotFound(String::new()).is_retryable());
    }
}
