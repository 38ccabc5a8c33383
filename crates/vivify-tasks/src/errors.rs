//! Task error types.
//!
//! Store errors are returned to the caller; they never reach subscribers.

use thiserror::Error;

/// Errors from task operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No task with this ID.
    #[error("Task not found: {0}")]
    NotFound(String),

    /// An update named a field that cannot be set, or gave it a bad value.
    #[error("Invalid field `{field}`: {reason}")]
    InvalidField {
        /// Field name from the update.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Record (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskError {
    /// Create a not-found error for a task.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create an invalid-field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
