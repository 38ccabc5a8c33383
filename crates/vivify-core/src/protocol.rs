//! Wire protocol between the realtime server and its subscribers.
//!
//! Every server → client frame is an envelope `{ "type": <kind>, "data": <payload> }`.
//! [`ServerMessage`] has one variant per kind so payloads are typed once at
//! the edge instead of being passed around as loose JSON maps.
//!
//! Client → server frames are `{ "type": ..., ... }` control messages decoded
//! by [`parse_client_frame`]. Unknown control types are inert.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::ProtocolError;
use crate::patch::Patch;

/// Message kind tag carried in the envelope's `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Full current state, sent once on connect.
    Snapshot,
    /// One or more change records.
    Patch,
    /// Several coalesced entries in one frame.
    BatchPatch,
    /// Keep-alive ping.
    Ping,
    /// Keep-alive echo.
    Pong,
    /// Error notice.
    Error,
    /// Channel join.
    Subscribe,
    /// Channel leave.
    Unsubscribe,
}

impl MessageKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Patch => "patch",
            Self::BatchPatch => "batch_patch",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message urgency. `0` is normal; anything `>= 1` forces an immediate flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Coalesce within the batch window.
    pub const NORMAL: Self = Self(0);
    /// Flush the subscriber's queue now.
    pub const IMMEDIATE: Self = Self(1);

    /// Whether this priority forces an immediate flush.
    pub fn is_immediate(self) -> bool {
        self.0 >= 1
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → client
// ─────────────────────────────────────────────────────────────────────────────

/// `snapshot` payload: full current state keyed by task ID.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// Task records keyed by ID.
    pub tasks: Map<String, Value>,
}

/// `patch` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchPayload {
    /// Change records in application order.
    pub patches: Vec<Patch>,
}

/// `batch_patch` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    /// Ordered entries after coalescing.
    pub patches: Vec<BatchEntry>,
    /// Number of entries.
    pub count: usize,
    /// ISO 8601 time the batch was built.
    pub timestamp: String,
}

/// One entry of a `batch_patch`.
///
/// Coalesced change records appear bare; any other message keeps its full
/// envelope so the client can dispatch it by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchEntry {
    /// A single change record.
    Patch(Patch),
    /// A non-patch message passed through unchanged.
    Message(ServerMessage),
}

/// `pong` payload: echoes the client's ping timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    /// Timestamp from the ping, `null` when the ping carried none.
    pub timestamp: Value,
}

/// `error` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable reason.
    pub message: String,
}

/// `subscribe` / `unsubscribe` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelPayload {
    /// Channel name.
    pub channel: String,
}

/// A server → client frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full state on connect.
    Snapshot(SnapshotPayload),
    /// Change records.
    Patch(PatchPayload),
    /// Coalesced batch.
    BatchPatch(BatchPayload),
    /// Keep-alive ping; payload is opaque.
    Ping(Value),
    /// Keep-alive echo.
    Pong(PongPayload),
    /// Error notice.
    Error(ErrorPayload),
    /// Channel join notice.
    Subscribe(ChannelPayload),
    /// Channel leave notice.
    Unsubscribe(ChannelPayload),
}

impl ServerMessage {
    /// Kind tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Snapshot(_) => MessageKind::Snapshot,
            Self::Patch(_) => MessageKind::Patch,
            Self::BatchPatch(_) => MessageKind::BatchPatch,
            Self::Ping(_) => MessageKind::Ping,
            Self::Pong(_) => MessageKind::Pong,
            Self::Error(_) => MessageKind::Error,
            Self::Subscribe(_) => MessageKind::Subscribe,
            Self::Unsubscribe(_) => MessageKind::Unsubscribe,
        }
    }

    /// `patch` carrying the given records.
    pub fn patch(patches: Vec<Patch>) -> Self {
        Self::Patch(PatchPayload { patches })
    }

    /// `snapshot` carrying the given task map.
    pub fn snapshot(tasks: Map<String, Value>) -> Self {
        Self::Snapshot(SnapshotPayload { tasks })
    }

    /// `pong` echoing `timestamp`.
    pub fn pong(timestamp: Value) -> Self {
        Self::Pong(PongPayload { timestamp })
    }

    /// `error` with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Serialize to the JSON envelope.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client → server
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded client control frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// `{"type": "ping", "timestamp": T}` → answered with `pong`.
    Ping {
        /// Opaque client timestamp, echoed back.
        #[serde(default)]
        timestamp: Value,
    },
    /// `{"type": "subscribe", "channel": name}`.
    Subscribe {
        /// Channel to join.
        channel: String,
    },
    /// `{"type": "unsubscribe", "channel": name}`.
    Unsubscribe {
        /// Channel to leave.
        channel: String,
    },
    /// `{"type": "flush"}`: deliver anything pending for this subscriber now.
    Flush,
}

const CLIENT_TYPES: [&str; 4] = ["ping", "subscribe", "unsubscribe", "flush"];

/// Decode one client text frame.
///
/// Returns `Ok(None)` for a well-formed frame whose `type` is not a known
/// control message. Invalid JSON, a non-object, a missing `type`, or a known
/// type with bad fields is a [`ProtocolError::MalformedFrame`].
pub fn parse_client_frame(text: &str) -> Result<Option<ClientMessage>, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::MalformedFrame(format!("invalid JSON: {e}")))?;

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(ProtocolError::MalformedFrame(
            "expected an object with a string `type`".into(),
        ));
    };

    if !CLIENT_TYPES.contains(&kind) {
        debug!(kind, "ignoring unknown control message");
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}
