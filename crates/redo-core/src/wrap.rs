//! The wrapper around a user function.
//!
//! The caller-facing entry ([`Retryable::call`]) builds a fresh task record
//! and fails loudly; the worker re-enters through a crate-private entry that
//! takes the task explicitly, so no hidden metadata ever flows through the
//! user function's arguments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::domain::{CallArgs, FailedTask, RetryBudget, TaskKind};
use crate::engine::Redo;
use crate::error::CallError;
use crate::namer::{DefaultNamer, Namer};
use crate::strategy::RetryStrategy;

/// How the wrapped function relates to its first positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FuncForm {
    /// Free function: every positional argument is persisted.
    #[default]
    Function,

    /// Bound method: the first positional argument is the receiver and is
    /// stripped from the persisted arguments (receivers rarely serialize,
    /// and the registered runner is already bound to one).
    Method,

    /// Best effort. A registered runner is always an already-bound
    /// callable, so this resolves to `Function`; declare `Method` to get
    /// stripping.
    AutoDetect,
}

impl FuncForm {
    fn strips_receiver(self) -> bool {
        matches!(self, FuncForm::Method)
    }
}

/// Failure surface of a user function.
#[derive(Debug)]
pub enum RunError {
    /// Plain failure: retried with the original arguments when the task is
    /// idempotent, not retried otherwise.
    Fail(String),

    /// Control signal demanding a retry with replacement arguments: the
    /// only way a non-idempotent task gets retried.
    RetryRequest(CallArgs),
}

impl RunError {
    pub fn fail(message: impl Into<String>) -> Self {
        RunError::Fail(message.into())
    }
}

/// A unit of user work the engine can invoke and re-invoke.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, args: CallArgs) -> Result<Value, RunError>;
}

/// Adapt a plain closure into a [`Runner`].
pub fn runner_fn<F>(f: F) -> Arc<dyn Runner>
where
    F: Fn(CallArgs) -> Result<Value, RunError> + Send + Sync + 'static,
{
    Arc::new(FnRunner(f))
}

struct FnRunner<F>(F);

#[async_trait]
impl<F> Runner for FnRunner<F>
where
    F: Fn(CallArgs) -> Result<Value, RunError> + Send + Sync + 'static,
{
    async fn run(&self, args: CallArgs) -> Result<Value, RunError> {
        (self.0)(args)
    }
}

/// Configures and registers one wrapper. Produced by [`Redo::wrap`]; unset
/// options fall back to the engine defaults.
pub struct WrapBuilder {
    engine: Redo,
    func_name: String,
    runner: Arc<dyn Runner>,
    kind: Option<TaskKind>,
    runner_name: Option<String>,
    namer: Arc<dyn Namer>,
    max_retry: Option<RetryBudget>,
    form: FuncForm,
    strategy: Option<Arc<dyn RetryStrategy>>,
}

impl WrapBuilder {
    pub(crate) fn new(engine: Redo, func_name: String, runner: Arc<dyn Runner>) -> Self {
        Self {
            engine,
            func_name,
            runner,
            kind: None,
            runner_name: None,
            namer: Arc::new(DefaultNamer),
            max_retry: None,
            form: FuncForm::default(),
            strategy: None,
        }
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Register under a name other than the function's own. Retries dispatch
    /// by this name, so a later registration under the same name takes over
    /// the task's re-execution.
    pub fn runner_name(mut self, name: impl Into<String>) -> Self {
        self.runner_name = Some(name.into());
        self
    }

    pub fn namer(mut self, namer: Arc<dyn Namer>) -> Self {
        self.namer = namer;
        self
    }

    pub fn max_retry(mut self, budget: RetryBudget) -> Self {
        self.max_retry = Some(budget);
        self
    }

    pub fn form(mut self, form: FuncForm) -> Self {
        self.form = form;
        self
    }

    /// Per-runner strategy, registered with the engine under the runner
    /// name.
    pub fn retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Resolve defaults, register the runner (and its strategy, when given)
    /// with the engine, and hand back the callable wrapper.
    pub fn register(self) -> Result<Retryable, crate::error::RedoError> {
        let runner_name = self.runner_name.unwrap_or_else(|| self.func_name.clone());
        if runner_name.is_empty() {
            return Err(crate::error::RedoError::Configure(
                "runner name must not be empty".into(),
            ));
        }
        let wrapped = Arc::new(Wrapped {
            runner: self.runner,
            func_name: self.func_name,
            runner_name: runner_name.clone(),
            kind: self.kind.unwrap_or_else(|| self.engine.default_kind()),
            max_retry: self
                .max_retry
                .unwrap_or_else(|| self.engine.default_max_retry()),
            form: self.form,
            namer: self.namer,
        });
        if let Some(strategy) = self.strategy {
            self.engine.register_strategy(&runner_name, strategy);
        }
        self.engine.register_runner(&runner_name, wrapped.clone());
        Ok(Retryable {
            inner: wrapped,
            engine: self.engine,
        })
    }
}

/// Wrapper state as stored in the runner registry.
pub(crate) struct Wrapped {
    runner: Arc<dyn Runner>,
    func_name: String,
    runner_name: String,
    kind: TaskKind,
    max_retry: RetryBudget,
    form: FuncForm,
    namer: Arc<dyn Namer>,
}

impl Wrapped {
    /// Build the record for a first invocation. Arguments are copied
    /// defensively; for methods the receiver is stripped from the persisted
    /// form (the namer still sees the full tuple).
    fn first_task(&self, args: &CallArgs) -> FailedTask {
        let name = self.namer.task_name(&self.func_name, args);
        let mut stored = args.clone();
        if self.form.strips_receiver() {
            stored = stored.strip_receiver();
        }
        FailedTask::new(name, self.runner_name.clone(), self.kind, stored, self.max_retry)
    }

    /// Run the user function and classify the outcome. Shared by the first
    /// call (task is fresh and unassigned) and the retry path (task came
    /// from the store).
    pub(crate) async fn invoke(
        &self,
        engine: &Redo,
        mut task: FailedTask,
        args: CallArgs,
    ) -> Result<Value, CallError> {
        match self.runner.run(args).await {
            Ok(value) => {
                info!(task = %task.name, "task succeeded");
                if !task.id.is_unassigned() {
                    engine.store().remove(task.id).await?;
                }
                Ok(value)
            }
            Err(RunError::RetryRequest(replacement)) => {
                let name = task.name.clone();
                task.args = replacement;
                info!(
                    task = %name,
                    attempt = task.retry_count + 1,
                    "task failed, retry requested with replacement arguments"
                );
                engine.handle_failed_task(task).await?;
                Err(CallError::RetryRequested(name))
            }
            Err(RunError::Fail(message)) => {
                if task.kind == TaskKind::Idempotent {
                    info!(
                        task = %task.name,
                        attempt = task.retry_count + 1,
                        "idempotent task failed"
                    );
                    engine.handle_failed_task(task).await?;
                } else {
                    info!(task = %task.name, "task is not idempotent, not retrying");
                    if !task.id.is_unassigned() {
                        // A retry that plain-fails must still leave the
                        // ready view; a first call was never persisted.
                        task.mark_stopped(Utc::now());
                        engine.store().put(&mut task).await?;
                    }
                }
                Err(CallError::User(message))
            }
        }
    }
}

/// The wrapper produced by [`Redo::wrap`]. Cheap to clone; call it in place
/// of the original function.
#[derive(Clone)]
pub struct Retryable {
    inner: Arc<Wrapped>,
    engine: Redo,
}

impl std::fmt::Debug for Retryable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retryable").finish_non_exhaustive()
    }
}

impl Retryable {
    /// First-invocation path: builds a fresh task, runs the function, and
    /// fails loudly on the caller's side while the retry is scheduled
    /// behind the scenes.
    pub async fn call(&self, args: CallArgs) -> Result<Value, CallError> {
        let task = self.inner.first_task(&args);
        self.inner.invoke(&self.engine, task, args).await
    }

    pub fn runner_name(&self) -> &str {
        &self.inner.runner_name
    }
}
