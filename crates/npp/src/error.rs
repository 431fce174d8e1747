//! Error types for punchers, the listener and the dialer.

use std::fmt;
use std::time::Duration;

use npp_core::ProtoError;
use npp_relay::RelayError;
use npp_rendezvous::RendezvousError;
use thiserror::Error;

/// Ordered collection of distinct failure messages.
///
/// Used where many attempts run in parallel and only their combined
/// failure is reported. Messages are kept in arrival order; repeats of an
/// already recorded message are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiError {
    errors: Vec<String>,
}

impl MultiError {
    /// Creates an empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Records `err` unless an identical message is already present.
    pub fn push(&mut self, err: impl fmt::Display) {
        let message = err.to_string();
        if !self.errors.contains(&message) {
            self.errors.push(message);
        }
    }

    /// Number of distinct messages.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Recorded messages in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(String::as_str)
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return f.write_str("no attempts were made");
        }
        f.write_str(&self.errors.join("; "))
    }
}

impl std::error::Error for MultiError {}

impl<D: fmt::Display> Extend<D> for MultiError {
    fn extend<I: IntoIterator<Item = D>>(&mut self, iter: I) {
        for err in iter {
            self.push(err);
        }
    }
}

/// Errors produced while establishing peer connections.
#[derive(Debug, Error)]
pub enum NppError {
    /// The Rendezvous server failed or could not be reached.
    #[error("rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    /// Rendezvous matched a peer that reported no addresses.
    #[error("no addresses resolved")]
    NoAddressesResolved,

    /// Every punch attempt failed.
    #[error("failed to punch the network: {0}")]
    PunchFailed(MultiError),

    /// A transport-level failure, such as a broken QUIC connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// The relay path failed.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Every connection method failed.
    #[error("all connection methods failed: {0}")]
    Exhausted(MultiError),

    /// An operation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The listener or puncher has been closed.
    #[error("closed")]
    Closed,

    /// A dial target could not be parsed.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NppError {
    /// Returns true if the failure means the Rendezvous session is
    /// unusable and the puncher owning it should be rebuilt.
    pub const fn is_rendezvous_error(&self) -> bool {
        matches!(self, Self::Rendezvous(_))
    }
}

impl From<ProtoError> for NppError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Io(e) => Self::Io(e),
            ProtoError::Closed => Self::Closed,
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<quinn::ConnectError> for NppError {
    fn from(err: quinn::ConnectError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<quinn::ConnectionError> for NppError {
    fn from(err: quinn::ConnectionError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<quinn::WriteError> for NppError {
    fn from(err: quinn::WriteError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for NPP operations.
pub type NppResult<T> = Result<T, NppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_error_keeps_order_and_drops_repeats() {
        let mut errors = MultiError::new();
        errors.push("connection refused");
        errors.push("timed out");
        errors.push("connection refused");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.to_string(), "connection refused; timed out");
        assert_eq!(errors.iter().collect::<Vec<_>>(), vec!["connection refused", "timed out"]);
    }

    #[test]
    fn empty_multi_error_still_reads() {
        let errors = MultiError::default();
        assert!(errors.is_empty());
        assert_eq!(errors.to_string(), "no attempts were made");
    }

    #[test]
    fn multi_error_extends_from_displayables() {
        let mut errors = MultiError::new();
        errors.extend([NppError::Closed, NppError::NoAddressesResolved, NppError::Closed]);
        assert_eq!(errors.to_string(), "closed; no addresses resolved");
    }

    #[test]
    fn only_rendezvous_failures_rebuild_the_puncher() {
        assert!(NppError::Rendezvous(RendezvousError::SessionClosed).is_rendezvous_error());
        assert!(!NppError::PunchFailed(MultiError::new()).is_rendezvous_error());
        assert!(!NppError::Closed.is_rendezvous_error());
    }

    #[test]
    fn proto_errors_map_onto_npp_errors() {
        assert!(matches!(NppError::from(ProtoError::Closed), NppError::Closed));
        assert!(matches!(
            NppError::from(ProtoError::Tls("bad".into())),
            NppError::Transport(_)
        ));
    }
}
