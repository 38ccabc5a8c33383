//! Change records and the task patch codec.
//!
//! A [`Patch`] is one add/replace/remove against a slash-delimited pointer
//! into the logical task document, e.g. `/tasks/42/status`. Serialized form
//! is `{"op": "...", "path": "...", "value": ...}` with `value` omitted for
//! `remove`.
//!
//! The codec functions are pure: they turn a domain change into records and
//! never touch connection state.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::Priority;

/// Root of the task collection inside the logical document.
pub const TASKS_ROOT: &str = "/tasks";

/// One change record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    /// Insert a value at `path`.
    Add {
        /// Target pointer.
        path: String,
        /// Inserted value.
        value: Value,
    },
    /// Overwrite the value at `path`.
    Replace {
        /// Target pointer.
        path: String,
        /// New value.
        value: Value,
    },
    /// Delete whatever lives at `path`.
    Remove {
        /// Target pointer.
        path: String,
    },
}

/// Operation tag of a [`Patch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatchOp {
    /// `add`
    Add,
    /// `replace`
    Replace,
    /// `remove`
    Remove,
}

impl PatchOp {
    /// Wire name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Patch {
    /// Target pointer of this record.
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }

    /// Operation tag.
    pub fn op(&self) -> PatchOp {
        match self {
            Self::Add { .. } => PatchOp::Add,
            Self::Replace { .. } => PatchOp::Replace,
            Self::Remove { .. } => PatchOp::Remove,
        }
    }

    /// Value carried by `add`/`replace`; `None` for `remove`.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Add { value, .. } | Self::Replace { value, .. } => Some(value),
            Self::Remove { .. } => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Paths
// ─────────────────────────────────────────────────────────────────────────────

/// Escape one pointer segment (`~` → `~0`, `/` → `~1`).
pub fn escape_segment(segment: &str) -> Cow<'_, str> {
    if segment.contains(['~', '/']) {
        Cow::Owned(segment.replace('~', "~0").replace('/', "~1"))
    } else {
        Cow::Borrowed(segment)
    }
}

/// Pointer to a whole task: `/tasks/{id}`.
pub fn task_path(task_id: &str) -> String {
    format!("{TASKS_ROOT}/{}", escape_segment(task_id))
}

/// Pointer to one field of a task: `/tasks/{id}/{field}`.
pub fn task_field_path(task_id: &str, field: &str) -> String {
    format!("{}/{}", task_path(task_id), escape_segment(field))
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// `replace /tasks/{id}/{field}` with the new field value.
pub fn task_field_patch(task_id: &str, field: &str, value: Value) -> Patch {
    Patch::Replace {
        path: task_field_path(task_id, field),
        value,
    }
}

/// `add /tasks/{id}` carrying the full task record.
pub fn task_added_patch(task_id: &str, record: Value) -> Patch {
    Patch::Add {
        path: task_path(task_id),
        value: record,
    }
}

/// `remove /tasks/{id}`.
pub fn task_removed_patch(task_id: &str) -> Patch {
    Patch::Remove {
        path: task_path(task_id),
    }
}

/// A committed domain change to one task.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskChange {
    /// One or more fields changed; map of field name to new value.
    FieldsUpdated {
        /// Task ID.
        task_id: String,
        /// Changed fields.
        fields: Map<String, Value>,
    },
    /// A task was created.
    Created {
        /// Task ID.
        task_id: String,
        /// Full task record.
        record: Value,
    },
    /// A task was deleted.
    Deleted {
        /// Task ID.
        task_id: String,
    },
}

impl TaskChange {
    /// Change records for this change.
    pub fn patches(&self) -> Vec<Patch> {
        match self {
            Self::FieldsUpdated { task_id, fields } => fields
                .iter()
                .map(|(field, value)| task_field_patch(task_id, field, value.clone()))
                .collect(),
            Self::Created { task_id, record } => vec![task_added_patch(task_id, record.clone())],
            Self::Deleted { task_id } => vec![task_removed_patch(task_id)],
        }
    }

    /// Structural changes (create/delete) flush immediately; field churn
    /// tolerates coalescing.
    pub fn priority(&self) -> Priority {
        match self {
            Self::FieldsUpdated { .. } => Priority::NORMAL,
            Self::Created { .. } | Self::Deleted { .. } => Priority::IMMEDIATE,
        }
    }
}
