//! Sqlite-backed store implementation.
//!
//! A single `failed_task` table mirrors the task record; arguments are
//! persisted as self-describing JSON text. Every public operation runs in
//! its own transaction: commit on success, propagate (and roll back) on
//! error. Here the ready view is the ordered query itself - a row leaves it
//! when the worker re-queues or removes the task.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::TaskStore;
use crate::domain::{CallArgs, FailedTask, RetryBudget, TaskId, TaskKind, TaskState};
use crate::error::RedoError;

/// Columns of the `failed_task` table, in select order.
const COLUMNS: &str = "task_id, task_type, task_name, task_args, task_kwargs, runner_name, \
                       retry_count, max_retry, create_time, update_time, next_run_time, state";

/// Sqlite task store for retries that must survive the process.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the backing database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RedoError> {
        let conn = Connection::open(path).map_err(data_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(data_err)?;
        Self::init(conn)
    }

    /// In-memory database, handy for tests.
    pub fn in_memory() -> Result<Self, RedoError> {
        let conn = Connection::open_in_memory().map_err(data_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, RedoError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS failed_task (
                task_id INTEGER PRIMARY KEY,
                task_type INTEGER NOT NULL,
                task_name TEXT NOT NULL,
                task_args TEXT NOT NULL,
                task_kwargs TEXT NOT NULL,
                runner_name TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                max_retry INTEGER NOT NULL,
                create_time REAL NOT NULL,
                update_time REAL NOT NULL,
                next_run_time REAL,
                state INTEGER NOT NULL
            )",
            [],
        )
        .map_err(data_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn db(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn put(&self, task: &mut FailedTask) -> Result<(), RedoError> {
        let (args, kwargs) = encode_args(&task.args)?;
        let mut conn = self.db();
        let tx = conn.transaction().map_err(data_err)?;

        let mut assigned = None;
        if task.id.is_unassigned() {
            tx.execute(
                "INSERT INTO failed_task (task_type, task_name, task_args, task_kwargs, \
                 runner_name, retry_count, max_retry, create_time, update_time, next_run_time, \
                 state) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.kind.code(),
                    task.name,
                    args,
                    kwargs,
                    task.runner_name,
                    i64::from(task.retry_count),
                    task.max_retry.code(),
                    to_secs(task.create_time),
                    to_secs(task.update_time),
                    task.next_run_time.map(to_secs),
                    task.state.code(),
                ],
            )
            .map_err(data_err)?;
            assigned = Some(tx.last_insert_rowid());
        } else {
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM failed_task WHERE task_id = ?1)",
                    params![task.id.get()],
                    |row| row.get(0),
                )
                .map_err(data_err)?;
            let sql = if exists {
                "UPDATE failed_task SET task_type = ?2, task_name = ?3, task_args = ?4, \
                 task_kwargs = ?5, runner_name = ?6, retry_count = ?7, max_retry = ?8, \
                 create_time = ?9, update_time = ?10, next_run_time = ?11, state = ?12 \
                 WHERE task_id = ?1"
            } else {
                "INSERT INTO failed_task (task_id, task_type, task_name, task_args, task_kwargs, \
                 runner_name, retry_count, max_retry, create_time, update_time, next_run_time, \
                 state) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            };
            tx.execute(
                sql,
                params![
                    task.id.get(),
                    task.kind.code(),
                    task.name,
                    args,
                    kwargs,
                    task.runner_name,
                    i64::from(task.retry_count),
                    task.max_retry.code(),
                    to_secs(task.create_time),
                    to_secs(task.update_time),
                    task.next_run_time.map(to_secs),
                    task.state.code(),
                ],
            )
            .map_err(data_err)?;
        }

        tx.commit().map_err(data_err)?;
        if let Some(id) = assigned {
            task.id = TaskId::new(id);
        }
        Ok(())
    }

    async fn take_ready(&self) -> Result<Option<FailedTask>, RedoError> {
        let now = to_secs(Utc::now());
        let mut conn = self.db();
        let tx = conn.transaction().map_err(data_err)?;
        let raw = tx
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM failed_task \
                     WHERE state = ?1 AND (next_run_time IS NULL OR next_run_time <= ?2) \
                     ORDER BY next_run_time ASC, task_id ASC LIMIT 1"
                ),
                params![TaskState::Failed.code(), now],
                RawRow::from_row,
            )
            .optional()
            .map_err(data_err)?;
        tx.commit().map_err(data_err)?;
        raw.map(RawRow::into_task).transpose()
    }

    async fn peek_next(&self) -> Result<Option<FailedTask>, RedoError> {
        let mut conn = self.db();
        let tx = conn.transaction().map_err(data_err)?;
        let raw = tx
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM failed_task WHERE state = ?1 \
                     ORDER BY next_run_time ASC, task_id ASC LIMIT 1"
                ),
                params![TaskState::Failed.code()],
                RawRow::from_row,
            )
            .optional()
            .map_err(data_err)?;
        tx.commit().map_err(data_err)?;
        raw.map(RawRow::into_task).transpose()
    }

    async fn remove(&self, id: TaskId) -> Result<(), RedoError> {
        let mut conn = self.db();
        let tx = conn.transaction().map_err(data_err)?;
        tx.execute(
            "DELETE FROM failed_task WHERE task_id = ?1",
            params![id.get()],
        )
        .map_err(data_err)?;
        tx.commit().map_err(data_err)
    }

    async fn all(&self) -> Result<Vec<FailedTask>, RedoError> {
        let mut conn = self.db();
        let tx = conn.transaction().map_err(data_err)?;
        let mut tasks = Vec::new();
        {
            let mut stmt = tx
                .prepare(&format!("SELECT {COLUMNS} FROM failed_task ORDER BY task_id"))
                .map_err(data_err)?;
            let rows = stmt.query_map([], RawRow::from_row).map_err(data_err)?;
            for row in rows {
                tasks.push(row.map_err(data_err)?.into_task()?);
            }
        }
        tx.commit().map_err(data_err)?;
        Ok(tasks)
    }
}

fn data_err(err: rusqlite::Error) -> RedoError {
    RedoError::Data(err.to_string())
}

/// Positional arguments are wrapped in a `{"task_args": [...]}` document;
/// keyword arguments are stored as the bare JSON object.
fn encode_args(args: &CallArgs) -> Result<(String, String), RedoError> {
    let positional = serde_json::to_string(&serde_json::json!({ "task_args": args.positional }))
        .map_err(|e| RedoError::Data(format!("encode task_args: {e}")))?;
    let keyword = serde_json::to_string(&args.keyword)
        .map_err(|e| RedoError::Data(format!("encode task_kwargs: {e}")))?;
    Ok((positional, keyword))
}

fn decode_args(args: &str, kwargs: &str) -> Result<CallArgs, RedoError> {
    #[derive(Deserialize)]
    struct ArgsDoc {
        task_args: Vec<Value>,
    }
    let doc: ArgsDoc = serde_json::from_str(args)
        .map_err(|e| RedoError::Data(format!("decode task_args: {e}")))?;
    let keyword: Map<String, Value> = serde_json::from_str(kwargs)
        .map_err(|e| RedoError::Data(format!("decode task_kwargs: {e}")))?;
    Ok(CallArgs {
        positional: doc.task_args,
        keyword,
    })
}

/// REAL columns hold epoch seconds at microsecond precision.
fn to_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_micros() as f64 / 1e6
}

fn from_secs(secs: f64) -> Result<DateTime<Utc>, RedoError> {
    DateTime::from_timestamp_micros((secs * 1e6).round() as i64)
        .ok_or_else(|| RedoError::Data(format!("timestamp out of range: {secs}")))
}

/// One row as read from sqlite, before enum and JSON decoding.
struct RawRow {
    id: i64,
    kind: i64,
    name: String,
    args: String,
    kwargs: String,
    runner_name: String,
    retry_count: i64,
    max_retry: i64,
    create_time: f64,
    update_time: f64,
    next_run_time: Option<f64>,
    state: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            args: row.get(3)?,
            kwargs: row.get(4)?,
            runner_name: row.get(5)?,
            retry_count: row.get(6)?,
            max_retry: row.get(7)?,
            create_time: row.get(8)?,
            update_time: row.get(9)?,
            next_run_time: row.get(10)?,
            state: row.get(11)?,
        })
    }

    fn into_task(self) -> Result<FailedTask, RedoError> {
        let kind = TaskKind::from_code(self.kind)
            .ok_or_else(|| RedoError::Data(format!("unknown task_type code: {}", self.kind)))?;
        let state = TaskState::from_code(self.state)
            .ok_or_else(|| RedoError::Data(format!("unknown state code: {}", self.state)))?;
        let max_retry = RetryBudget::from_code(self.max_retry)
            .ok_or_else(|| RedoError::Data(format!("unknown max_retry code: {}", self.max_retry)))?;
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| RedoError::Data(format!("negative retry_count: {}", self.retry_count)))?;
        Ok(FailedTask {
            id: TaskId::new(self.id),
            name: self.name,
            runner_name: self.runner_name,
            kind,
            args: decode_args(&self.args, &self.kwargs)?,
            retry_count,
            max_retry,
            create_time: from_secs(self.create_time)?,
            update_time: from_secs(self.update_time)?,
            next_run_time: self.next_run_time.map(from_secs).transpose()?,
            state,
        })
    }
}
