//! Domain identifiers.
//!
//! # Why not `i64` everywhere?
//! The newtype keeps task ids from being mixed up with retry counts or
//! persisted state codes, and gives the unassigned sentinel a single home.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a task inside a store.
///
/// Ids are assigned by the store on first `put`; until then a task carries
/// [`TaskId::UNASSIGNED`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(i64);

impl TaskId {
    /// Sentinel for a task that has not been persisted yet.
    pub const UNASSIGNED: TaskId = TaskId(-1);

    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_unassigned(self) -> bool {
        self == Self::UNASSIGNED
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}
