//! Source of the full state sent to a subscriber on connect.

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Produces the `snapshot` payload: current task records keyed by ID.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Current state keyed by task ID.
    async fn snapshot(&self) -> Map<String, Value>;
}

/// A fixed snapshot, for servers that start empty and for tests.
#[derive(Clone, Debug, Default)]
pub struct StaticSnapshot(pub Map<String, Value>);

#[async_trait]
impl SnapshotSource for StaticSnapshot {
    async fn snapshot(&self) -> Map<String, Value> {
        self.0.clone()
    }
}
