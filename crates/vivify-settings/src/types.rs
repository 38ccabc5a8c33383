//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON file only needs the keys it overrides:
//!
//! ```json
//! {
//!   "server": { "port": 9090 },
//!   "batching": { "maxBatchDelayMs": 250 }
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VivifySettings {
    /// Network and stream settings.
    pub server: ServerSettings,
    /// Per-subscriber batching policy.
    pub batching: BatchingSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Network and stream settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Seconds between server Ping frames.
    pub heartbeat_interval_secs: u64,
    /// Seconds of client silence before the stream is closed.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted client frame in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per subscriber before it is evicted.
    pub outbound_queue_capacity: usize,
    /// Channels every new subscriber joins right after its snapshot.
    pub default_channels: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
            outbound_queue_capacity: 1024,
            default_channels: vec!["tasks".to_string()],
        }
    }
}

/// Per-subscriber batching policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchingSettings {
    /// Pending messages that force a flush.
    pub max_batch_size: usize,
    /// Longest a message waits before a scheduled flush, in milliseconds.
    pub max_batch_delay_ms: u64,
    /// When `false` every message is sent on its own, immediately.
    pub enabled: bool,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_batch_delay_ms: 100,
            enabled: true,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
