//! Task change publishing.
//!
//! Producers call these after a mutation is committed; delivery is
//! asynchronous and failures stay inside the registry.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;
use vivify_core::patch::task_field_patch;
use vivify_core::{Priority, ServerMessage, TaskChange};

use crate::registry::ConnectionRegistry;

/// Channel task changes go to unless configured otherwise.
pub const DEFAULT_TASK_CHANNEL: &str = "tasks";

/// Turns task changes into channel broadcasts.
#[derive(Clone)]
pub struct TaskPublisher {
    registry: Arc<ConnectionRegistry>,
    channel: String,
}

impl TaskPublisher {
    /// Publisher on [`DEFAULT_TASK_CHANNEL`].
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::on_channel(registry, DEFAULT_TASK_CHANNEL)
    }

    /// Publisher on a specific channel.
    pub fn on_channel(registry: Arc<ConnectionRegistry>, channel: impl Into<String>) -> Self {
        Self {
            registry,
            channel: channel.into(),
        }
    }

    /// Target channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Broadcast one change with the priority its kind calls for.
    pub async fn publish(&self, change: TaskChange) {
        let patches = change.patches();
        if patches.is_empty() {
            return;
        }
        debug!(channel = %self.channel, patches = patches.len(), "publishing task change");
        self.registry
            .broadcast(&self.channel, ServerMessage::patch(patches), change.priority())
            .await;
    }

    /// Fields of one task changed: one `replace` per field.
    pub async fn task_updated(&self, task_id: &str, fields: Map<String, Value>) {
        self.publish(TaskChange::FieldsUpdated {
            task_id: task_id.to_owned(),
            fields,
        })
        .await;
    }

    /// A task was created: `add` with the full record, flushed immediately.
    pub async fn task_created(&self, task_id: &str, record: Value) {
        self.publish(TaskChange::Created {
            task_id: task_id.to_owned(),
            record,
        })
        .await;
    }

    /// A task was deleted: `remove`, flushed immediately.
    pub async fn task_deleted(&self, task_id: &str) {
        self.publish(TaskChange::Deleted {
            task_id: task_id.to_owned(),
        })
        .await;
    }

    /// Several tasks moved to the same status, as one `patch` message.
    pub async fn tasks_status_updated(&self, task_ids: &[String], status: &str) {
        if task_ids.is_empty() {
            return;
        }
        let patches = task_ids
            .iter()
            .map(|id| task_field_patch(id, "status", Value::from(status)))
            .collect();
        self.registry
            .broadcast(&self.channel, ServerMessage::patch(patches), Priority::NORMAL)
            .await;
    }
}
