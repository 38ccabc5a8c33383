//! Error taxonomy for the realtime core.
//!
//! - [`TransportError`]: a send or accept on a subscriber's stream failed.
//!   Always recovered locally by evicting that subscriber.
//! - [`ProtocolError`]: a client frame could not be decoded. Terminates that
//!   subscriber's stream only.

use thiserror::Error;

/// Failure on a subscriber's underlying transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The stream is closed (peer gone or writer task ended).
    #[error("transport closed")]
    Closed,

    /// The subscriber's bounded outbound queue is full.
    #[error("outbound queue full ({capacity} frames)")]
    Backpressure {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The message could not be serialized to a frame.
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The stream handshake was rejected.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Failure decoding a frame received from a client.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON, not an object, or a known control
    /// message with missing/invalid fields.
    #[error("malformed client frame: {0}")]
    MalformedFrame(String),
}
