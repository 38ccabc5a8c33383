//! Transport seam between the registry and a concrete client stream.

use async_trait::async_trait;
use vivify_core::{ServerMessage, TransportError};

/// A live, bidirectional stream to one subscriber.
///
/// The registry only ever talks to subscribers through this trait, so tests
/// can stand in scripted transports for real sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Complete the stream handshake. A failure leaves the registry untouched.
    async fn accept(&self) -> Result<(), TransportError>;

    /// Hand one frame to the stream without waiting for the write.
    ///
    /// Any error is final: the registry evicts the subscriber and never
    /// retries.
    fn send(&self, message: &ServerMessage) -> Result<(), TransportError>;

    /// Tear the stream down. Called once the subscriber is deregistered.
    fn close(&self) {}
}
