//! In-memory store implementation.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::TaskStore;
use crate::domain::{FailedTask, TaskId, TaskState};
use crate::error::RedoError;

/// Ready-queue entry for the priority heap.
///
/// We use reverse ordering so BinaryHeap acts as a min-heap: earliest
/// `next_run_time` first, ties broken by ascending id. `None` ("ready at
/// once") sorts before any concrete instant.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    next_run_time: Option<DateTime<Utc>>,
    id: TaskId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering: earlier times have higher priority.
        (other.next_run_time, other.id).cmp(&(self.next_run_time, self.id))
    }
}

/// In-memory store state, all behind one lock.
struct MemoryState {
    /// Task table (single source of truth).
    tasks: HashMap<TaskId, FailedTask>,

    /// Ready view over `Failed` tasks. Superseded or removed entries are
    /// dropped lazily when they surface at the top.
    ready: BinaryHeap<ReadyEntry>,

    /// Next id to assign.
    next_id: i64,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            ready: BinaryHeap::new(),
            next_id: 1,
        }
    }

    fn assign_id(&mut self) -> TaskId {
        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Is this heap entry still the live queue entry for its task?
    ///
    /// Re-inserting an id pushes a fresh entry rather than rewriting the
    /// heap, so an entry is live only while it matches the table record.
    fn is_live(&self, entry: &ReadyEntry) -> bool {
        self.tasks
            .get(&entry.id)
            .is_some_and(|task| {
                task.state == TaskState::Failed && task.next_run_time == entry.next_run_time
            })
    }

    fn drop_stale(&mut self) {
        while let Some(entry) = self.ready.peek() {
            if self.is_live(entry) {
                break;
            }
            self.ready.pop();
        }
    }
}

/// In-memory task store: a hash table plus a `(next_run_time, id)` min-heap
/// over the same records.
pub struct MemoryStore {
    state: Mutex<MemoryState>,

    /// Maximum number of tracked tasks; `None` is unbounded.
    capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::new()),
            capacity: None,
        }
    }

    /// Bound the number of tasks the store will hold; `put` of a new task
    /// fails with a data error once the bound is reached.
    pub fn with_capacity(limit: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::new()),
            capacity: Some(limit),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn put(&self, task: &mut FailedTask) -> Result<(), RedoError> {
        let mut state = self.state.lock().await;
        if task.id.is_unassigned() {
            task.id = state.assign_id();
        }
        if let Some(limit) = self.capacity
            && !state.tasks.contains_key(&task.id)
            && state.tasks.len() >= limit
        {
            return Err(RedoError::Data(format!("store is full ({limit} tasks)")));
        }
        state.tasks.insert(task.id, task.clone());
        if task.state == TaskState::Failed {
            state.ready.push(ReadyEntry {
                next_run_time: task.next_run_time,
                id: task.id,
            });
        }
        Ok(())
    }

    async fn take_ready(&self) -> Result<Option<FailedTask>, RedoError> {
        let mut state = self.state.lock().await;
        state.drop_stale();
        let now = Utc::now();
        let due = state
            .ready
            .peek()
            .filter(|entry| entry.next_run_time.is_none_or(|t| t <= now))
            .map(|entry| entry.id);
        match due {
            Some(id) => {
                state.ready.pop();
                Ok(state.tasks.get(&id).cloned())
            }
            None => Ok(None),
        }
    }

    async fn peek_next(&self) -> Result<Option<FailedTask>, RedoError> {
        let mut state = self.state.lock().await;
        state.drop_stale();
        let id = state.ready.peek().map(|entry| entry.id);
        Ok(id.and_then(|id| state.tasks.get(&id).cloned()))
    }

    async fn remove(&self, id: TaskId) -> Result<(), RedoError> {
        // The heap entry (if any) goes stale and is dropped lazily.
        let mut state = self.state.lock().await;
        state.tasks.remove(&id);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<FailedTask>, RedoError> {
        let state = self.state.lock().await;
        Ok(state.tasks.values().cloned().collect())
    }
}
