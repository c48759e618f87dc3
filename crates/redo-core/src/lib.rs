//! redo-core
//!
//! Durable retry of failed function calls. A wrapped function still fails
//! loudly on the caller's side, but the failure is recorded in a task store
//! and a single background worker keeps re-invoking the function with the
//! captured arguments until it succeeds, exhausts its retry budget, or is
//! abandoned.
//!
//! # Module layout
//! - **domain**: the task record, ids, states, and argument capture
//! - **store**: storage port plus the in-memory and sqlite implementations
//! - **strategy**: retry scheduling policies (immediate, fixed interval, backoff)
//! - **namer**: task naming
//! - **wrap**: the function wrapper (first call vs retry classification)
//! - **engine**: registries, failure handling, and the background worker
//! - **logging**: tracing bootstrap for embedders without their own subscriber

pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;
pub mod namer;
pub mod store;
pub mod strategy;
pub mod wrap;

pub use domain::{CallArgs, FailedTask, RetryBudget, TaskId, TaskInfo, TaskKind, TaskState};
pub use engine::{Redo, RedoBuilder};
pub use error::{CallError, RedoError};
pub use namer::{DefaultNamer, Namer};
pub use store::{MemoryStore, SqliteStore, TaskStore};
pub use strategy::{ExponentialBackoff, FixedIntervalStrategy, ImmediateStrategy, RetryStrategy};
pub use wrap::{FuncForm, Retryable, RunError, Runner, runner_fn};
