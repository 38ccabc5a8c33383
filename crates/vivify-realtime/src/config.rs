//! Runtime configuration for the server and the batcher.
//!
//! Both types are plain values built once by the composition root, usually
//! from [`vivify_settings::VivifySettings`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vivify_settings::{BatchingSettings, ServerSettings};

/// Configuration for the realtime server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a client after this many seconds without any frame from it.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per subscriber before it is evicted.
    pub outbound_queue_capacity: usize,
    /// Channels every new subscriber joins after its snapshot.
    pub default_channels: Vec<String>,
}

impl ServerConfig {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Heartbeat timeout as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            heartbeat_interval_secs: settings.heartbeat_interval_secs,
            heartbeat_timeout_secs: settings.heartbeat_timeout_secs,
            max_message_size: settings.max_message_size,
            outbound_queue_capacity: settings.outbound_queue_capacity.max(1),
            default_channels: settings.default_channels.clone(),
        }
    }
}

/// Per-registry batching policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Pending messages that force a flush.
    pub max_batch_size: usize,
    /// Delay before a scheduled flush fires, in milliseconds.
    pub max_batch_delay_ms: u64,
    /// When `false`, every message is its own batch and nothing is queued.
    pub enabled: bool,
}

impl BatchConfig {
    /// Scheduled flush delay as a `Duration`.
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    /// Batching off: every message is sent on its own.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&BatchingSettings::default())
    }
}

impl From<&BatchingSettings> for BatchConfig {
    fn from(settings: &BatchingSettings) -> Self {
        Self {
            max_batch_size: settings.max_batch_size.max(1),
            max_batch_delay_ms: settings.max_batch_delay_ms,
            enabled: settings.enabled,
        }
    }
}
