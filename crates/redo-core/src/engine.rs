//! The retry engine: configuration, registries, failure handling, and the
//! single background worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::{FailedTask, RetryBudget, TaskInfo, TaskKind};
use crate::error::RedoError;
use crate::store::{MemoryStore, TaskStore};
use crate::strategy::{ImmediateStrategy, RetryStrategy};
use crate::wrap::{Runner, WrapBuilder, Wrapped};

/// Assembles a [`Redo`] engine. Defaults: in-memory store, immediate
/// retries, idempotent tasks, unbounded budget.
///
/// Configuration is frozen at build time; build a new engine to
/// reconfigure. Wrappers capture the handle they were created from, so
/// configure before wrapping.
pub struct RedoBuilder {
    default_kind: TaskKind,
    default_max_retry: RetryBudget,
    store: Option<Arc<dyn TaskStore>>,
    default_strategy: Option<Arc<dyn RetryStrategy>>,
}

impl RedoBuilder {
    pub fn new() -> Self {
        Self {
            default_kind: TaskKind::Idempotent,
            default_max_retry: RetryBudget::Unbounded,
            store: None,
            default_strategy: None,
        }
    }

    /// Classification applied to wrappers that don't declare one.
    pub fn default_kind(mut self, kind: TaskKind) -> Self {
        self.default_kind = kind;
        self
    }

    /// Budget applied to wrappers that don't declare one.
    pub fn default_max_retry(mut self, budget: RetryBudget) -> Self {
        self.default_max_retry = budget;
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Strategy for runners without a registered one.
    pub fn default_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    pub fn build(self) -> Redo {
        Redo {
            inner: Arc::new(Inner {
                default_kind: self.default_kind,
                default_max_retry: self.default_max_retry,
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                default_strategy: self
                    .default_strategy
                    .unwrap_or_else(|| Arc::new(ImmediateStrategy)),
                runners: RwLock::new(HashMap::new()),
                strategies: RwLock::new(HashMap::new()),
                notify: Notify::new(),
                started: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }
}

impl Default for RedoBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    default_kind: TaskKind,
    default_max_retry: RetryBudget,
    store: Arc<dyn TaskStore>,
    default_strategy: Arc<dyn RetryStrategy>,

    /// runner_name -> wrapper. Last registration under a name wins.
    runners: RwLock<HashMap<String, Arc<Wrapped>>>,

    /// runner_name -> strategy, falling back to the default.
    strategies: RwLock<HashMap<String, Arc<dyn RetryStrategy>>>,

    /// Wakes the worker when a freshly-failed task lands in the store.
    notify: Notify,

    started: AtomicBool,
    worker: Mutex<Option<WorkerHandle>>,
}

struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

/// Handle to a retry engine. Cheap to clone; every wrapper produced by
/// [`Redo::wrap`] captures a clone, so one engine can serve many wrapped
/// functions.
#[derive(Clone)]
pub struct Redo {
    inner: Arc<Inner>,
}

impl Redo {
    /// Engine with the default configuration.
    pub fn new() -> Self {
        RedoBuilder::new().build()
    }

    pub fn builder() -> RedoBuilder {
        RedoBuilder::new()
    }

    /// Wrap a function for durable retry. `func_name` is the function's
    /// declared name; finish with [`WrapBuilder::register`].
    pub fn wrap(&self, func_name: impl Into<String>, runner: Arc<dyn Runner>) -> WrapBuilder {
        WrapBuilder::new(self.clone(), func_name.into(), runner)
    }

    /// Launch the background worker. Returns false when the worker was
    /// already running (a second start is a no-op).
    pub fn start(&self) -> bool {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = self.clone();
        let join = tokio::spawn(async move { engine.worker_loop(shutdown_rx).await });
        *self.inner.worker.lock().unwrap() = Some(WorkerHandle {
            shutdown_tx,
            join: Some(join),
        });
        true
    }

    /// Blocking variant of [`Redo::start`]: runs the worker loop on the
    /// caller's task until [`Redo::shutdown`] is invoked from elsewhere.
    pub async fn run(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.worker.lock().unwrap() = Some(WorkerHandle {
            shutdown_tx,
            join: None,
        });
        self.worker_loop(shutdown_rx).await;
    }

    /// Stop the worker and wait for it to finish its current dispatch.
    pub async fn shutdown(&self) {
        let handle = self.inner.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            // Ignore send errors: the worker may already be gone.
            let _ = handle.shutdown_tx.send(true);
            if let Some(join) = handle.join {
                let _ = join.await;
            }
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }

    /// Snapshot of every task known to the store, whatever its state.
    pub async fn task_info(&self) -> Result<Vec<TaskInfo>, RedoError> {
        let tasks = self.inner.store.all().await?;
        Ok(tasks.iter().map(TaskInfo::from).collect())
    }

    pub(crate) fn default_kind(&self) -> TaskKind {
        self.inner.default_kind
    }

    pub(crate) fn default_max_retry(&self) -> RetryBudget {
        self.inner.default_max_retry
    }

    pub(crate) fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    pub(crate) fn register_runner(&self, name: &str, wrapped: Arc<Wrapped>) {
        self.inner
            .runners
            .write()
            .unwrap()
            .insert(name.to_string(), wrapped);
    }

    pub(crate) fn register_strategy(&self, name: &str, strategy: Arc<dyn RetryStrategy>) {
        self.inner
            .strategies
            .write()
            .unwrap()
            .insert(name.to_string(), strategy);
    }

    fn strategy_for(&self, runner_name: &str) -> Arc<dyn RetryStrategy> {
        self.inner
            .strategies
            .read()
            .unwrap()
            .get(runner_name)
            .cloned()
            .unwrap_or_else(|| self.inner.default_strategy.clone())
    }

    /// Record a failure and wake the worker.
    ///
    /// The strategy picks the next run instant, the record applies its own
    /// budget transition, and the store write completes before the notify,
    /// so a woken worker always observes the task.
    pub(crate) async fn handle_failed_task(&self, mut task: FailedTask) -> Result<(), RedoError> {
        info!(task = %task, "handling failed task");
        let next_run_time = self.strategy_for(&task.runner_name).next_run_time(&task);
        task.register_failure(next_run_time, Utc::now());
        self.inner.store.put(&mut task).await?;
        self.inner.notify.notify_one();
        Ok(())
    }

    async fn worker_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.step(&mut shutdown).await {
                error!(%err, "worker loop crashed, continuing");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    /// One turn of the worker: dispatch the earliest ready task, or sleep
    /// until something becomes ready. The wait is bounded by the next
    /// scheduled instant when one exists and unbounded otherwise; a notify
    /// from `handle_failed_task` cuts either wait short.
    async fn step(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), RedoError> {
        let now = Utc::now();
        if let Some(task) = self.inner.store.take_ready().await? {
            self.dispatch(task).await;
            return Ok(());
        }
        match self.inner.store.peek_next().await? {
            Some(next) => {
                let until = next.next_run_time.unwrap_or(now);
                let wait = (until - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = self.inner.notify.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => {}
                }
            }
            None => {
                tokio::select! {
                    _ = self.inner.notify.notified() => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        Ok(())
    }

    /// Re-enter the wrapper for one retry. Failures here are logged and
    /// swallowed: the wrapper has already re-queued the task (or parked
    /// it), and the loop must not die.
    async fn dispatch(&self, mut task: FailedTask) {
        let wrapped = self
            .inner
            .runners
            .read()
            .unwrap()
            .get(&task.runner_name)
            .cloned();
        let Some(wrapped) = wrapped else {
            error!(task = %task, "runner not found, stopping retry");
            task.mark_interrupted(Utc::now());
            if let Err(err) = self.inner.store.put(&mut task).await {
                error!(%err, task = %task, "failed to record interrupted task");
            }
            return;
        };
        let args = task.args.clone();
        if let Err(err) = wrapped.invoke(self, task, args).await {
            warn!(%err, "retry attempt failed");
        }
    }
}

impl Default for Redo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CallArgs, TaskState};
    use crate::error::CallError;
    use crate::strategy::FixedIntervalStrategy;
    use crate::wrap::{RunError, Runner};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicU32;
    use tokio::time::sleep;

    /// Test runner that fails until its n-th invocation (0 = never succeed).
    struct Flaky {
        counter: Arc<AtomicU32>,
        succeed_at: u32,
    }

    impl Flaky {
        fn new(counter: Arc<AtomicU32>, succeed_at: u32) -> Arc<Self> {
            Arc::new(Self {
                counter,
                succeed_at,
            })
        }
    }

    #[async_trait]
    impl Runner for Flaky {
        async fn run(&self, _args: CallArgs) -> Result<Value, RunError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            if self.succeed_at != 0 && n >= self.succeed_at {
                Ok(json!(n))
            } else {
                Err(RunError::fail(format!("attempt {n} failed")))
            }
        }
    }

    #[tokio::test]
    async fn failing_task_eventually_succeeds() {
        let engine = Redo::new();
        let counter = Arc::new(AtomicU32::new(0));
        let wrapped = engine
            .wrap("get_66", Flaky::new(counter.clone(), 66))
            .register()
            .unwrap();
        engine.start();

        // The first call still fails loudly on the caller's side.
        let err = wrapped.call(CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, CallError::User(_)));

        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 66
                && engine.task_info().await.unwrap().is_empty()
            {
                engine.shutdown().await;
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("task did not reach its 66th invocation within the timeout");
    }

    #[tokio::test]
    async fn bounded_retry_stops_after_the_budget() {
        let engine = Redo::new();
        let counter = Arc::new(AtomicU32::new(0));
        let wrapped = engine
            .wrap("get_66", Flaky::new(counter.clone(), 66))
            .max_retry(RetryBudget::Limit(10))
            .register()
            .unwrap();
        engine.start();

        wrapped.call(CallArgs::new()).await.unwrap_err();

        for _ in 0..200 {
            let info = engine.task_info().await.unwrap();
            if info.len() == 1 && info[0].state == TaskState::Stopped {
                engine.shutdown().await;
                // 1 initial call + exactly 10 retries.
                assert_eq!(counter.load(Ordering::SeqCst), 11);
                assert_eq!(info[0].retry_count, 10);
                assert_eq!(info[0].max_retry, 10);
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("task was not stopped within the timeout");
    }

    #[tokio::test]
    async fn non_idempotent_plain_failure_is_not_retried() {
        let engine = Redo::new();
        let counter = Arc::new(AtomicU32::new(0));
        let wrapped = engine
            .wrap("no_redo", Flaky::new(counter.clone(), 0))
            .kind(TaskKind::NonIdempotent)
            .register()
            .unwrap();
        engine.start();

        let err = wrapped.call(CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, CallError::User(_)));

        sleep(Duration::from_millis(300)).await;
        engine.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(engine.task_info().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_dispatch_by_runner_name() {
        let engine = Redo::new();
        let a_counter = Arc::new(AtomicU32::new(0));
        let b_counter = Arc::new(AtomicU32::new(0));

        // A is registered under B's name; B's later registration takes the
        // name over, so A's failure is retried with B's body.
        let a = engine
            .wrap("func_a", Flaky::new(a_counter.clone(), 0))
            .runner_name("shared")
            .register()
            .unwrap();
        let _b = engine
            .wrap("shared", Flaky::new(b_counter.clone(), 3))
            .register()
            .unwrap();
        engine.start();

        a.call(CallArgs::new()).await.unwrap_err();

        for _ in 0..200 {
            if b_counter.load(Ordering::SeqCst) >= 3
                && engine.task_info().await.unwrap().is_empty()
            {
                engine.shutdown().await;
                assert_eq!(a_counter.load(Ordering::SeqCst), 1);
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("retries never reached the replacement runner");
    }

    #[tokio::test]
    async fn custom_namer_shows_up_in_task_info() {
        struct ConstNamer;
        impl crate::namer::Namer for ConstNamer {
            fn task_name(&self, _func_name: &str, _args: &CallArgs) -> String {
                "CustomTask".to_string()
            }
        }

        let engine = Redo::new();
        let plain = engine
            .wrap("never_succeeds", Flaky::new(Arc::new(AtomicU32::new(0)), 0))
            .max_retry(RetryBudget::Limit(1))
            .register()
            .unwrap();
        let named = engine
            .wrap("never_succeeds_custom", Flaky::new(Arc::new(AtomicU32::new(0)), 0))
            .namer(Arc::new(ConstNamer))
            .max_retry(RetryBudget::Limit(1))
            .register()
            .unwrap();
        engine.start();

        plain.call(CallArgs::new()).await.unwrap_err();
        named.call(CallArgs::new()).await.unwrap_err();

        for _ in 0..100 {
            let names: Vec<String> = engine
                .task_info()
                .await
                .unwrap()
                .into_iter()
                .map(|info| info.name)
                .collect();
            if names.contains(&"never_succeeds".to_string())
                && names.contains(&"CustomTask".to_string())
            {
                engine.shutdown().await;
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("task names were not reported");
    }

    #[tokio::test]
    async fn interval_strategy_paces_retries() {
        let engine = Redo::new();
        let fast_counter = Arc::new(AtomicU32::new(0));
        let slow_counter = Arc::new(AtomicU32::new(0));

        let fast = engine
            .wrap("fast", Flaky::new(fast_counter.clone(), 0))
            .register()
            .unwrap();
        let slow = engine
            .wrap("slow", Flaky::new(slow_counter.clone(), 0))
            .retry_strategy(Arc::new(FixedIntervalStrategy::new(Duration::from_millis(
                300,
            ))))
            .register()
            .unwrap();
        engine.start();

        fast.call(CallArgs::new()).await.unwrap_err();
        slow.call(CallArgs::new()).await.unwrap_err();

        sleep(Duration::from_millis(1500)).await;
        engine.shutdown().await;

        let fast_n = fast_counter.load(Ordering::SeqCst);
        let slow_n = slow_counter.load(Ordering::SeqCst);
        // The immediate task spins as fast as the worker can re-queue it;
        // the paced one lands roughly once per interval.
        assert!(fast_n > slow_n, "fast={fast_n} slow={slow_n}");
        assert!((2..=8).contains(&slow_n), "slow={slow_n}");
    }

    /// Succeeds only once called with the replacement arguments it asks for.
    struct Picky {
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Runner for Picky {
        async fn run(&self, args: CallArgs) -> Result<Value, RunError> {
            let first = args
                .positional
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            self.seen.lock().unwrap().push(first.clone());
            if first == "replacement" {
                Ok(json!("done"))
            } else {
                Err(RunError::RetryRequest(
                    CallArgs::new().arg(json!("replacement")),
                ))
            }
        }
    }

    #[tokio::test]
    async fn retry_request_swaps_the_arguments() {
        let engine = Redo::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let wrapped = engine
            .wrap("picky", Arc::new(Picky { seen: seen.clone() }))
            .kind(TaskKind::NonIdempotent)
            .register()
            .unwrap();
        engine.start();

        let err = wrapped
            .call(CallArgs::new().arg(json!("original")))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::RetryRequested(_)));

        for _ in 0..100 {
            if engine.task_info().await.unwrap().is_empty() {
                engine.shutdown().await;
                let seen = seen.lock().unwrap();
                assert_eq!(*seen, vec!["original", "replacement"]);
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("replacement retry never succeeded");
    }

    #[tokio::test]
    async fn non_idempotent_retry_failure_parks_the_task() {
        // First invocation requests a retry; the retry then plain-fails.
        struct OneShot {
            counter: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Runner for OneShot {
            async fn run(&self, _args: CallArgs) -> Result<Value, RunError> {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    Err(RunError::RetryRequest(CallArgs::new()))
                } else {
                    Err(RunError::fail("still broken"))
                }
            }
        }

        let engine = Redo::new();
        let counter = Arc::new(AtomicU32::new(0));
        let wrapped = engine
            .wrap("one_shot", Arc::new(OneShot { counter: counter.clone() }))
            .kind(TaskKind::NonIdempotent)
            .register()
            .unwrap();
        engine.start();

        wrapped.call(CallArgs::new()).await.unwrap_err();

        for _ in 0..100 {
            let info = engine.task_info().await.unwrap();
            if info.len() == 1 && info[0].state == TaskState::Stopped {
                engine.shutdown().await;
                assert_eq!(counter.load(Ordering::SeqCst), 2);
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("abandoned task was not parked");
    }

    #[tokio::test]
    async fn missing_runner_interrupts_the_task() {
        let engine = Redo::new();
        engine.start();

        let task = FailedTask::new(
            "ghost",
            "ghost",
            TaskKind::Idempotent,
            CallArgs::new(),
            RetryBudget::Unbounded,
        );
        engine.handle_failed_task(task).await.unwrap();

        for _ in 0..100 {
            let info = engine.task_info().await.unwrap();
            if info.len() == 1 && info[0].state == TaskState::Interrupted {
                engine.shutdown().await;
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("task with a missing runner was not interrupted");
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let engine = Redo::new();
        assert!(engine.start());
        assert!(!engine.start());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn blocking_run_exits_on_shutdown() {
        let engine = Redo::new();
        let worker = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        // Let the loop park itself before asking it to stop.
        sleep(Duration::from_millis(50)).await;
        engine.shutdown().await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn full_store_surfaces_a_data_error_to_the_caller() {
        let engine = Redo::builder()
            .store(Arc::new(crate::store::MemoryStore::with_capacity(0)))
            .build();
        let wrapped = engine
            .wrap("doomed", Flaky::new(Arc::new(AtomicU32::new(0)), 0))
            .register()
            .unwrap();

        let err = wrapped.call(CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, CallError::Data(RedoError::Data(_))));
    }

    #[tokio::test]
    async fn empty_runner_name_is_a_configure_error() {
        let engine = Redo::new();
        let err = engine
            .wrap("", Flaky::new(Arc::new(AtomicU32::new(0)), 1))
            .register()
            .unwrap_err();
        assert!(matches!(err, RedoError::Configure(_)));
    }

    #[tokio::test]
    async fn wrappers_inherit_engine_defaults() {
        let engine = Redo::builder()
            .default_kind(TaskKind::NonIdempotent)
            .default_max_retry(RetryBudget::Limit(2))
            .build();
        let counter = Arc::new(AtomicU32::new(0));
        let wrapped = engine
            .wrap("inherits", Flaky::new(counter.clone(), 0))
            .register()
            .unwrap();
        engine.start();

        // Non-idempotent default: the plain failure is not retried at all.
        wrapped.call(CallArgs::new()).await.unwrap_err();
        sleep(Duration::from_millis(200)).await;
        engine.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
