//! Task state machine and idempotence classification.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Failed -> Failed (another retry scheduled)
/// - Failed -> Stopped (retry budget exhausted, or retry abandoned)
/// - Failed -> Interrupted (runner no longer registered at retry time)
/// - Failed -> Success (observed only transiently; the record is removed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Completed; the store record is about to be removed.
    Success,

    /// Waiting in the ready queue for another attempt.
    Failed,

    /// Retry budget exhausted or retry abandoned; kept for inspection.
    Stopped,

    /// Runner disappeared from the registry; kept for inspection.
    Interrupted,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Failed)
    }

    /// Is this task eligible for the ready queue?
    pub fn is_retryable(self) -> bool {
        matches!(self, TaskState::Failed)
    }

    /// Persisted integer code.
    pub fn code(self) -> i64 {
        match self {
            TaskState::Success => 0,
            TaskState::Failed => 1,
            TaskState::Stopped => 2,
            TaskState::Interrupted => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskState::Success),
            1 => Some(TaskState::Failed),
            2 => Some(TaskState::Stopped),
            3 => Some(TaskState::Interrupted),
            _ => None,
        }
    }
}

/// Whether a plain failure permits automatic retry with the original
/// arguments.
///
/// Non-idempotent functions are retried only when their failure carries
/// replacement arguments (see `RunError::RetryRequest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    NonIdempotent,
    Idempotent,
}

impl TaskKind {
    /// Persisted integer code.
    pub fn code(self) -> i64 {
        match self {
            TaskKind::NonIdempotent => 0,
            TaskKind::Idempotent => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskKind::NonIdempotent),
            1 => Some(TaskKind::Idempotent),
            _ => None,
        }
    }
}
