//! # vivify-tasks
//!
//! In-memory task storage for the Vivify realtime server.
//!
//! - [`store::TaskStore`] holds the task records, answers queries, and after
//!   every committed mutation hands the change to an optional
//!   [`vivify_realtime::TaskPublisher`]
//! - The store is the [`vivify_realtime::SnapshotSource`] for new subscribers
//! - [`seed`] provides the demo board the server starts with

#![deny(unsafe_code)]

pub mod errors;
pub mod seed;
pub mod store;
pub mod types;

pub use errors::TaskError;
pub use store::TaskStore;
pub use types::{Task, TaskCreate, TaskStatus};
