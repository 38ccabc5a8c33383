//! # vivify-core
//!
//! Shared vocabulary for the Vivify realtime update core.
//!
//! - **Protocol**: [`protocol::ServerMessage`] (one variant per message kind,
//!   serialized as the `{ "type", "data" }` envelope) and
//!   [`protocol::ClientMessage`] control frames decoded at the transport edge
//! - **Change records**: [`patch::Patch`] add/replace/remove against a
//!   slash-delimited document path, plus the task patch codec
//! - **IDs**: [`ids::SubscriberId`] as a branded newtype
//! - **Errors**: transport and protocol failures via `thiserror`
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod patch;
pub mod protocol;

pub use errors::{ProtocolError, TransportError};
pub use ids::SubscriberId;
pub use patch::{Patch, PatchOp, TaskChange};
pub use protocol::{BatchEntry, ClientMessage, MessageKind, Priority, ServerMessage};
