//! # vivify-realtime
//!
//! Real-time fan-out of task changes to connected subscribers.
//!
//! - **Batching**: [`batcher::MessageBatcher`] keeps one pending queue and at
//!   most one flush timer per subscriber, coalescing same-path patches
//! - **Registry**: [`registry::ConnectionRegistry`] owns subscriber identities,
//!   channel membership, and the send path; a failed send evicts the subscriber
//! - **Transport seam**: [`transport::Transport`], implemented for WebSocket
//!   clients by [`websocket::connection::ClientConnection`]
//! - **Server**: Axum router with `/ws`, `/health`, and `/metrics`
//! - **Publishing**: [`publish::TaskPublisher`] turns task changes into channel
//!   broadcasts
//! - Graceful shutdown: pending batches are flushed before sessions close

#![deny(unsafe_code)]

pub mod batcher;
pub mod config;
pub mod health;
pub mod metrics;
pub mod publish;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod snapshot;
pub mod transport;
pub mod websocket;

pub use batcher::{Batch, FlushSink, MessageBatcher};
pub use config::{BatchConfig, ServerConfig};
pub use publish::TaskPublisher;
pub use registry::ConnectionRegistry;
pub use server::RealtimeServer;
pub use snapshot::SnapshotSource;
pub use transport::Transport;
