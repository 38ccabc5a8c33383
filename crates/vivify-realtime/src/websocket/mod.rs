//! WebSocket client connections and the per-client session loop.

pub mod connection;
pub mod session;
