//! The failed-task record: metadata, arguments, and state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{CallArgs, TaskId, TaskKind, TaskState};

/// Retry budget for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryBudget {
    /// Retry until the task succeeds or is abandoned.
    Unbounded,

    /// At most this many retries after the initial call.
    Limit(u32),
}

impl RetryBudget {
    /// Persisted integer code: -1 for unbounded, the limit otherwise.
    pub fn code(self) -> i64 {
        match self {
            RetryBudget::Unbounded => -1,
            RetryBudget::Limit(n) => i64::from(n),
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(RetryBudget::Unbounded),
            n if n >= 0 => u32::try_from(n).ok().map(RetryBudget::Limit),
            _ => None,
        }
    }
}

/// A persisted record describing one failed invocation that should be
/// retried.
///
/// Design:
/// - The record is the single source of truth for retry state; ready-queue
///   structures hold `(next_run_time, id)` keys only.
/// - All state transitions happen here. The wrapper mutates a record before
///   handing it over, the engine applies `register_failure`, nothing else
///   writes to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub id: TaskId,

    /// Human-readable name produced by the namer; not necessarily unique.
    pub name: String,

    /// Key into the runner registry at retry time.
    pub runner_name: String,

    pub kind: TaskKind,

    /// Arguments for re-invocation (receiver already stripped for methods).
    pub args: CallArgs,

    /// Retries already attempted, not counting the initial call.
    pub retry_count: u32,

    pub max_retry: RetryBudget,

    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,

    /// Earliest instant the worker may dispatch this task; `None` means
    /// ready at once.
    pub next_run_time: Option<DateTime<Utc>>,

    pub state: TaskState,
}

impl FailedTask {
    pub fn new(
        name: impl Into<String>,
        runner_name: impl Into<String>,
        kind: TaskKind,
        args: CallArgs,
        max_retry: RetryBudget,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::UNASSIGNED,
            name: name.into(),
            runner_name: runner_name.into(),
            kind,
            args,
            retry_count: 0,
            max_retry,
            create_time: now,
            update_time: now,
            next_run_time: None,
            state: TaskState::Failed,
        }
    }

    /// Record one more failure.
    ///
    /// The budget comparison happens before the increment: a task with
    /// `Limit(n)` is re-queued n times and stopped on the failure after its
    /// n-th retry, so an always-failing task runs n + 1 times in total. A
    /// `next_run_time` of `None` ("ready at once") is materialised as `now`.
    pub fn register_failure(&mut self, next_run_time: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.update_time = now;
        self.next_run_time = Some(next_run_time.unwrap_or(now));
        if let RetryBudget::Limit(limit) = self.max_retry
            && self.retry_count == limit
        {
            self.state = TaskState::Stopped;
        } else {
            self.retry_count += 1;
            self.state = TaskState::Failed;
        }
    }

    /// Runner no longer registered; park the record for inspection.
    pub fn mark_interrupted(&mut self, now: DateTime<Utc>) {
        self.update_time = now;
        self.state = TaskState::Interrupted;
    }

    /// Retry abandoned; park the record for inspection.
    pub fn mark_stopped(&mut self, now: DateTime<Utc>) {
        self.update_time = now;
        self.state = TaskState::Stopped;
    }
}

impl fmt::Display for FailedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(id={}, name={}, runner_name={}, retry_count={})",
            self.id, self.name, self.runner_name, self.retry_count
        )
    }
}

/// Introspection snapshot of a task, as reported by `Redo::task_info`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: i64,
    pub name: String,
    pub runner_name: String,
    pub kind: TaskKind,
    pub retry_count: u32,
    pub max_retry: i64,
    pub state: TaskState,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub next_run_time: Option<DateTime<Utc>>,
}

impl From<&FailedTask> for TaskInfo {
    fn from(task: &FailedTask) -> Self {
        Self {
            id: task.id.get(),
            name: task.name.clone(),
            runner_name: task.runner_name.clone(),
            kind: task.kind,
            retry_count: task.retry_count,
            max_retry: task.max_retry.code(),
            state: task.state,
            create_time: task.create_time,
            update_time: task.update_time,
            next_run_time: task.next_run_time,
        }
    }
}
