//! In-memory task store.
//!
//! Mutations commit under a short synchronous lock and are published after
//! it is released. Writers also take an async ordering lock for the whole
//! commit-then-publish step, so changes reach the registry in commit order
//! and subscribers converge on the latest committed value.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use vivify_realtime::{SnapshotSource, TaskPublisher};

use crate::errors::TaskError;
use crate::seed::demo_tasks;
use crate::types::{Task, TaskCreate, TaskStatus};

const ID_PREFIX: &str = "task-";

struct StoreState {
    /// Insertion order is list order.
    tasks: Vec<Task>,
    next_seq: u64,
}

impl StoreState {
    fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }
}

/// Task records plus the publisher their changes go to.
pub struct TaskStore {
    state: RwLock<StoreState>,
    /// Held by a writer from commit until its change is published.
    write_order: Mutex<()>,
    publisher: Option<TaskPublisher>,
}

impl TaskStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::from_tasks(Vec::new())
    }

    /// A store holding the demo board.
    pub fn seeded() -> Self {
        Self::from_tasks(demo_tasks(&now()))
    }

    /// A store holding `tasks`, in order.
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let next_seq = tasks
            .iter()
            .filter_map(|t| t.id.strip_prefix(ID_PREFIX)?.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        Self {
            state: RwLock::new(StoreState { tasks, next_seq }),
            write_order: Mutex::new(()),
            publisher: None,
        }
    }

    /// Publish committed changes through `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: TaskPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// All tasks in insertion order, optionally only those with `status`.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.state
            .read()
            .tasks
            .iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect()
    }

    /// One task by ID.
    pub fn get(&self, id: &str) -> Result<Task, TaskError> {
        let state = self.state.read();
        state
            .position(id)
            .map(|i| state.tasks[i].clone())
            .ok_or_else(|| TaskError::not_found(id))
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.state.read().tasks.len()
    }

    /// Whether the store holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a task with the next free `task-N` ID.
    pub async fn create(&self, params: TaskCreate) -> Result<Task, TaskError> {
        let _order = self.write_order.lock().await;
        let task = {
            let mut state = self.state.write();
            let stamp = now();
            let task = Task {
                id: format!("{ID_PREFIX}{}", state.next_seq),
                title: params.title,
                description: params.description,
                status: params.status,
                created_at: stamp.clone(),
                updated_at: stamp,
                subtasks: Vec::new(),
                metadata: Map::new(),
            };
            state.next_seq += 1;
            state.tasks.push(task.clone());
            task
        };
        info!(task_id = %task.id, "task created");

        if let Some(publisher) = &self.publisher {
            publisher.task_created(&task.id, task.to_record()?).await;
        }
        Ok(task)
    }

    /// Set the given fields on one task and bump `updated_at`.
    ///
    /// Only [`Task::EDITABLE_FIELDS`] may be set, and each value must fit the
    /// field's type. Nothing is applied when any field is rejected.
    pub async fn update(&self, id: &str, fields: Map<String, Value>) -> Result<Task, TaskError> {
        if let Some(field) = fields.keys().find(|k| !Task::EDITABLE_FIELDS.contains(&k.as_str())) {
            return Err(TaskError::invalid_field(field.as_str(), "not editable"));
        }

        let _order = self.write_order.lock().await;
        let (task, changed) = {
            let mut state = self.state.write();
            let index = state.position(id).ok_or_else(|| TaskError::not_found(id))?;
            let Value::Object(mut record) = state.tasks[index].to_record()? else {
                return Err(TaskError::invalid_field("*", "task record is not an object"));
            };

            let mut changed = fields;
            let stamp = Value::from(now());
            for (field, value) in &changed {
                let _ = record.insert(field.clone(), value.clone());
            }
            let _ = record.insert("updated_at".into(), stamp.clone());

            let updated: Task = serde_json::from_value(Value::Object(record)).map_err(|e| {
                let field = changed.keys().next().cloned().unwrap_or_default();
                TaskError::invalid_field(field, e.to_string())
            })?;
            let _ = changed.insert("updated_at".into(), stamp);
            state.tasks[index] = updated.clone();
            (updated, changed)
        };
        debug!(task_id = %task.id, fields = changed.len(), "task updated");

        if let Some(publisher) = &self.publisher {
            publisher.task_updated(&task.id, changed).await;
        }
        Ok(task)
    }

    /// Remove one task.
    pub async fn delete(&self, id: &str) -> Result<(), TaskError> {
        let _order = self.write_order.lock().await;
        {
            let mut state = self.state.write();
            let index = state.position(id).ok_or_else(|| TaskError::not_found(id))?;
            let _ = state.tasks.remove(index);
        }
        info!(task_id = id, "task deleted");

        if let Some(publisher) = &self.publisher {
            publisher.task_deleted(id).await;
        }
        Ok(())
    }

    /// Move several tasks to `status` at once. Unknown IDs are skipped.
    ///
    /// Returns the IDs that were updated, in request order.
    pub async fn batch_update_status(&self, ids: &[String], status: TaskStatus) -> Vec<String> {
        let _order = self.write_order.lock().await;
        let mut updated = Vec::with_capacity(ids.len());
        {
            let mut state = self.state.write();
            let stamp = now();
            for id in ids {
                let Some(task) = state.tasks.iter_mut().find(|t| &t.id == id) else {
                    continue;
                };
                task.status = status;
                task.updated_at.clone_from(&stamp);
                updated.push(id.clone());
            }
        }
        debug!(requested = ids.len(), updated = updated.len(), %status, "batch status update");

        if let Some(publisher) = &self.publisher {
            publisher.tasks_status_updated(&updated, status.as_str()).await;
        }
        updated
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotSource for TaskStore {
    async fn snapshot(&self) -> Map<String, Value> {
        self.state
            .read()
            .tasks
            .iter()
            .filter_map(|t| Some((t.id.clone(), t.to_record().ok()?)))
            .collect()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use vivify_realtime::websocket::connection::ClientConnection;
    use vivify_realtime::{BatchConfig, ConnectionRegistry, Transport};

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    async fn published_store(
        config: BatchConfig,
    ) -> (TaskStore, mpsc::Receiver<Arc<String>>) {
        let registry = ConnectionRegistry::new(config);
        let (tx, rx) = mpsc::channel(32);
        let id = registry
            .register(Arc::new(ClientConnection::new(tx)) as Arc<dyn Transport>)
            .await
            .unwrap();
        assert!(registry.subscribe(&id, "tasks").await);
        let store = TaskStore::seeded().with_publisher(TaskPublisher::new(registry));
        (store, rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    // ── queries ─────────────────────────────────────────────────────

    #[test]
    fn seeded_store_lists_in_order() {
        let store = TaskStore::seeded();
        let ids: Vec<String> = store.list(None).into_iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 7);
        assert_eq!(ids[0], "task-1");
        assert_eq!(ids[6], "task-7");
    }

    #[test]
    fn list_filters_by_status() {
        let store = TaskStore::seeded();
        let in_progress = store.list(Some(TaskStatus::InProgress));
        assert_eq!(in_progress.len(), 3);
        assert!(in_progress.iter().all(|t| t.status == TaskStatus::InProgress));
        assert_eq!(store.list(Some(TaskStatus::Done)).len(), 1);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let store = TaskStore::seeded();
        assert_eq!(store.get("task-3").unwrap().title, "Deploy to Production");
        assert_matches!(store.get("task-99"), Err(TaskError::NotFound(id)) if id == "task-99");
    }

    #[tokio::test]
    async fn snapshot_is_keyed_by_id() {
        let store = TaskStore::seeded();
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 7);
        assert_eq!(snapshot["task-7"]["status"], "inreview");
    }

    // ── mutations ───────────────────────────────────────────────────

    #[tokio::test]
    async fn create_assigns_next_id_and_never_reuses() {
        let store = TaskStore::seeded();
        let created = store
            .create(TaskCreate {
                title: "New".into(),
                ..TaskCreate::default()
            })
            .await
            .unwrap();
        assert_eq!(created.id, "task-8");
        assert_eq!(created.status, TaskStatus::Todo);

        store.delete("task-8").await.unwrap();
        let again = store
            .create(TaskCreate {
                title: "Another".into(),
                ..TaskCreate::default()
            })
            .await
            .unwrap();
        assert_eq!(again.id, "task-9");
    }

    #[tokio::test]
    async fn update_applies_fields_and_bumps_timestamp() {
        let store = TaskStore::seeded();
        let before = store.get("task-4").unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let task = store
            .update("task-4", fields(&[("status", json!("done")), ("title", json!("Docs"))]))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.title, "Docs");
        assert_ne!(task.updated_at, before.updated_at);
        assert_eq!(task.created_at, before.created_at);
    }

    #[tokio::test]
    async fn update_rejects_unknown_field() {
        let store = TaskStore::seeded();
        assert_matches!(
            store.update("task-1", fields(&[("id", json!("x"))])).await,
            Err(TaskError::InvalidField { field, .. }) if field == "id"
        );
    }

    #[tokio::test]
    async fn update_rejects_bad_value_and_keeps_task() {
        let store = TaskStore::seeded();
        let result = store
            .update("task-1", fields(&[("status", json!("blocked"))]))
            .await;
        assert_matches!(result, Err(TaskError::InvalidField { .. }));
        assert_eq!(store.get("task-1").unwrap().status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let store = TaskStore::seeded();
        assert_matches!(
            store.update("task-99", fields(&[("title", json!("x"))])).await,
            Err(TaskError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn delete_removes_and_second_delete_fails() {
        let store = TaskStore::seeded();
        store.delete("task-2").await.unwrap();
        assert_eq!(store.len(), 6);
        assert_matches!(store.delete("task-2").await, Err(TaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn batch_update_skips_unknown_ids() {
        let store = TaskStore::seeded();
        let ids = vec!["task-4".to_string(), "task-99".to_string(), "task-5".to_string()];
        let updated = store.batch_update_status(&ids, TaskStatus::InProgress).await;
        assert_eq!(updated, vec!["task-4".to_string(), "task-5".to_string()]);
        assert_eq!(store.list(Some(TaskStatus::Todo)).len(), 0);
    }

    #[tokio::test]
    async fn batch_update_stamps_only_matched_tasks() {
        let store = TaskStore::seeded();
        let before: Vec<Task> = store.list(None);
        tokio::time::sleep(Duration::from_millis(2)).await;

        let ids = vec!["task-99".to_string(), "task-2".to_string()];
        let updated = store.batch_update_status(&ids, TaskStatus::Done).await;
        assert_eq!(updated, vec!["task-2".to_string()]);

        for old in before {
            let now = store.get(&old.id).unwrap();
            if old.id == "task-2" {
                assert_eq!(now.status, TaskStatus::Done);
                assert_ne!(now.updated_at, old.updated_at);
            } else {
                assert_eq!(now, old);
            }
        }
    }

    // ── publishing ──────────────────────────────────────────────────

    #[tokio::test]
    async fn create_publishes_add_immediately() {
        let (store, mut rx) = published_store(BatchConfig::default()).await;
        let task = store
            .create(TaskCreate {
                title: "Realtime".into(),
                ..TaskCreate::default()
            })
            .await
            .unwrap();

        let frame = next_frame(&mut rx).await;
        let patch = &frame["data"]["patches"][0];
        assert_eq!(patch["op"], "add");
        assert_eq!(patch["path"], format!("/tasks/{}", task.id));
        assert_eq!(patch["value"]["title"], "Realtime");
    }

    #[tokio::test]
    async fn update_publishes_changed_fields() {
        let (store, mut rx) = published_store(BatchConfig::disabled()).await;
        let _ = store
            .update("task-1", fields(&[("status", json!("done"))]))
            .await
            .unwrap();

        let frame = next_frame(&mut rx).await;
        let paths: Vec<&str> = frame["data"]["patches"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|p| p["path"].as_str())
            .collect();
        assert!(paths.contains(&"/tasks/task-1/status"));
        assert!(paths.contains(&"/tasks/task-1/updated_at"));
    }

    #[tokio::test]
    async fn delete_publishes_remove() {
        let (store, mut rx) = published_store(BatchConfig::default()).await;
        store.delete("task-3").await.unwrap();
        let frame = next_frame(&mut rx).await;
        assert_eq!(
            frame["data"]["patches"][0],
            json!({"op": "remove", "path": "/tasks/task-3"})
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_updates_publish_in_commit_order() {
        const WRITERS: usize = 64;

        let registry = ConnectionRegistry::new(BatchConfig::disabled());
        let (tx, mut rx) = mpsc::channel(WRITERS * 2);
        let id = registry
            .register(Arc::new(ClientConnection::new(tx)) as Arc<dyn Transport>)
            .await
            .unwrap();
        assert!(registry.subscribe(&id, "tasks").await);
        let store = Arc::new(TaskStore::seeded().with_publisher(TaskPublisher::new(registry)));

        let writers: Vec<_> = (0..WRITERS)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    store
                        .update("task-1", fields(&[("title", json!(format!("v{i}")))]))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for writer in writers {
            let _ = writer.await.unwrap();
        }

        let mut titles = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let frame: Value = serde_json::from_str(&text).unwrap();
            for patch in frame["data"]["patches"].as_array().unwrap() {
                if patch["path"] == "/tasks/task-1/title" {
                    titles.push(patch["value"].as_str().unwrap().to_string());
                }
            }
        }
        assert_eq!(titles.len(), WRITERS);
        assert_eq!(titles.last().unwrap(), &store.get("task-1").unwrap().title);
    }

    #[tokio::test]
    async fn failed_update_publishes_nothing() {
        let (store, mut rx) = published_store(BatchConfig::disabled()).await;
        let _ = store.update("task-1", fields(&[("id", json!("x"))])).await;
        assert!(rx.try_recv().is_err());
    }
}
