use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Fatal session errors.
///
/// Any of these tears down the current session; the listener keeps accepting.
/// Session-service failures are deliberately not represented here - they are
/// logged and the handshake continues (the upstream drops the connection
/// itself if the join was rejected).
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Socket read/write or DNS failure.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed varint, payload overrun, or a compression envelope whose
    /// declared uncompressed length does not match the inflated data.
    #[error("framing: {0}")]
    Framing(String),

    /// Token mismatch, key decode/decrypt failure, or an out-of-order
    /// handshake packet.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}
