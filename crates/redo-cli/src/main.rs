use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};

use redo_core::{CallArgs, Redo, RunError, Runner, logging};

#[derive(Debug, Deserialize)]
struct GreetPayload {
    name: String,
}

/// Handler that fails twice on purpose before finally greeting.
struct GreetHandler {
    remaining_failures: AtomicU32,
}

impl GreetHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Runner for GreetHandler {
    async fn run(&self, args: CallArgs) -> Result<Value, RunError> {
        // Decode the first positional argument as the payload.
        let payload = args
            .positional
            .first()
            .cloned()
            .ok_or_else(|| RunError::fail("missing payload"))?;
        let p: GreetPayload = serde_json::from_value(payload)
            .map_err(|e| RunError::fail(format!("json decode: {e}")))?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(RunError::fail(format!("intentional failure (left={left})")));
        }

        println!("✓ Hello, {}!", p.name);
        Ok(json!(p.name))
    }
}

#[tokio::main]
async fn main() {
    println!("=== redo CLI example ===\n");

    logging::init(tracing::Level::INFO, None).expect("init logging");

    // (A) Engine with the default configuration: in-memory store, immediate
    // retries, unbounded budget.
    let engine = Redo::new();

    // (B) Wrap the flaky handler and launch the worker.
    let greet = engine
        .wrap("greet", Arc::new(GreetHandler::new(2)))
        .register()
        .expect("register runner");
    engine.start();

    // (C) First call fails on our side but leaves a task behind.
    let args = CallArgs::with_positional(vec![json!({ "name": "redo" })]);
    match greet.call(args).await {
        Ok(_) => println!("first call unexpectedly succeeded"),
        Err(err) => println!("📤 First call failed as expected: {err}"),
    }

    // (D) Poll until the worker drains the task.
    loop {
        let info = engine.task_info().await.expect("task info");
        if info.is_empty() {
            println!("\n✅ Task retried to completion!");
            break;
        }
        let task = &info[0];
        println!(
            "📊 Pending: name={} state={:?} retry_count={}",
            task.name, task.state, task.retry_count
        );
        sleep(Duration::from_millis(100)).await;
    }

    // (E) Graceful shutdown.
    engine.shutdown().await;
    println!("👋 Shutdown complete");
}
