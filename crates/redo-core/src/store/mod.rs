//! Task stores: the storage port plus the in-memory and sqlite
//! implementations.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::domain::{FailedTask, TaskId};
use crate::error::RedoError;

/// Storage port for failed tasks.
///
/// Implementations keep two views of the same records: a table keyed by id,
/// and a ready view of `Failed` tasks ordered by `(next_run_time, id)`.
/// This trait is the seam for swapping backends; the in-memory store is the
/// reference implementation of the ordering and concurrency contract.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Upsert by id.
    ///
    /// Tasks carrying `TaskId::UNASSIGNED` get a fresh monotonically
    /// increasing id assigned before insertion (and written back to the
    /// record). A `Failed` task is (re)inserted into the ready view;
    /// re-inserting an id replaces its previous queue entry. Tasks in any
    /// other state stay discoverable via `all` but leave the ready view.
    async fn put(&self, task: &mut FailedTask) -> Result<(), RedoError>;

    /// Remove and return the earliest ready task whose `next_run_time` is
    /// due, if any. Returns `None` when the queue is empty or the earliest
    /// entry lies in the future. The record itself stays in the table until
    /// `remove`.
    async fn take_ready(&self) -> Result<Option<FailedTask>, RedoError>;

    /// The earliest ready-or-future `Failed` task, without removing it.
    async fn peek_next(&self) -> Result<Option<FailedTask>, RedoError>;

    /// Drop a task from the table and the ready view. Unknown ids are a
    /// no-op, so removal is idempotent.
    async fn remove(&self, id: TaskId) -> Result<(), RedoError>;

    /// Snapshot of every task currently in the table, whatever its state.
    async fn all(&self) -> Result<Vec<FailedTask>, RedoError>;
}
