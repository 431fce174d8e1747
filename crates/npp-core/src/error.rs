//! Error types for npp-core.

use thiserror::Error;

/// Errors produced by the wire layer: framing, decoding, credentials and
/// session authentication.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A frame could not be decoded into the expected message.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// An outgoing message does not fit into a single frame.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Encoded size of the message.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// The peer closed the stream before a full frame arrived.
    #[error("stream closed by peer")]
    Closed,

    /// A textual or binary address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A self-signature over an address did not verify.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// TLS configuration could not be built.
    #[error("tls error: {0}")]
    Tls(String),

    /// The remote side failed the challenge-response authentication.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire-layer operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

impl From<rustls::Error> for ProtoError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for ProtoError {
    fn from(err: rcgen::Error) -> Self {
        Self::Tls(format!("certificate generation failed: {err}"))
    }
}
