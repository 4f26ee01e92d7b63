//! Integration tests for the dispatcher.
//!
//! These tests verify the complete dispatch workflow including:
//! - One call at a time per worker, fan-out across workers
//! - Priority ordering with niceness, do_next and do_last
//! - Update broadcasts and their replay on late workers
//! - Iterator results, failure containment and worker recovery
//! - Cancellation, detaching and draining on shutdown

use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskwire::dispatch::{
    DispatchError, DispatchEvent, Dispatcher, DispatcherConfig, Outcome, TaskQueue, TelemetrySink,
};
use taskwire::task::{Call, CallOptions};
use taskwire::universe::{arg_i64, arg_str, CallError, MethodTable};
use taskwire::worker::{LocalWorker, Reply, Worker, WorkerError, WorkerFuture};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Helpers
// =============================================================================

fn config() -> DispatcherConfig {
    DispatcherConfig {
        recovery_delay: Duration::from_millis(10),
        ..DispatcherConfig::default()
    }
}

/// A worker that doubles its argument after a delay and tracks how many of
/// its calls overlap.
struct SlowDoubler {
    name: String,
    delay: Duration,
    active: AtomicUsize,
    max_active: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl SlowDoubler {
    fn new(name: &str, delay_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::from_millis(delay_ms),
            active: AtomicUsize::new(0),
            max_active: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Worker for SlowDoubler {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, call: Call) -> WorkerFuture<'_> {
        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);

            let n = arg_i64(&call.args, 0).map_err(|e| WorkerError::Raised {
                method: call.method.clone(),
                message: e.to_string(),
            })?;
            Ok(Reply::Value(json!(n * 2)))
        })
    }
}

/// Methods used by most tests. `gate` blocks for the given milliseconds so
/// that later calls pile up in the queue.
fn universe(log: Arc<Mutex<Vec<String>>>) -> MethodTable {
    MethodTable::new()
        .method("gate", |args| {
            std::thread::sleep(Duration::from_millis(arg_i64(args, 0)? as u64));
            Ok(Value::Null)
        })
        .method("record", move |args| {
            let tag = arg_str(args, 0)?.to_string();
            log.lock().unwrap().push(tag.clone());
            Ok(json!(tag))
        })
        .method("square", |args| {
            let n = arg_i64(args, 0)?;
            Ok(json!(n * n))
        })
        .method("explode", |_| Err(CallError::new("boom")))
        .method("panic", |_| panic!("worker bug"))
        .iterator("range", |args| {
            let n = arg_i64(args, 0)?;
            Ok((0..n).map(|i| json!(i)))
        })
}

fn threaded_worker(log: &Arc<Mutex<Vec<String>>>) -> LocalWorker {
    LocalWorker::threaded(Arc::new(universe(Arc::clone(log))))
}

fn record(tag: &str) -> Call {
    Call::new("record", vec![json!(tag)])
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<DispatchEvent>>,
}

impl RecordingSink {
    fn event_types(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type())
            .collect()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: DispatchEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_worker_runs_one_call_at_a_time() {
    let queue = TaskQueue::spawn(config());
    let worker = SlowDoubler::new("slow", 5);
    let max_active = Arc::clone(&worker.max_active);
    queue.attach_worker(worker).await.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| queue.call(Call::new("double", vec![json!(i)])))
        .collect();
    let results = join_all(handles).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().into_value(), Some(json!(i * 2)));
    }
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fan_out_across_three_workers() {
    let queue = TaskQueue::spawn(config());
    let mut counters = Vec::new();
    for (name, delay) in [("fast", 1), ("medium", 3), ("slow", 7)] {
        let worker = SlowDoubler::new(name, delay);
        counters.push((Arc::clone(&worker.completed), Arc::clone(&worker.max_active)));
        queue.attach_worker(worker).await.unwrap();
    }

    let handles: Vec<_> = (0..100)
        .map(|i| queue.call(Call::new("double", vec![json!(i)])))
        .collect();
    let results = join_all(handles).await;

    assert_eq!(results.len(), 100);
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().into_value(), Some(json!(i * 2)));
    }

    let total: usize = counters.iter().map(|(c, _)| c.load(Ordering::SeqCst)).sum();
    assert_eq!(total, 100);
    for (completed, max_active) in &counters {
        assert!(completed.load(Ordering::SeqCst) > 0);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }
    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queued_calls_run_in_priority_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(config());
    queue.attach_worker(threaded_worker(&log)).await.unwrap();

    let gate = queue.call(Call::new("gate", vec![json!(100)]));
    let handles = vec![
        queue.call(record("plain")),
        queue.call_with(record("urgent"), CallOptions::new().niceness(-20)),
        queue.call_with(record("lazy"), CallOptions::new().niceness(20)),
        queue.call_with(record("next"), CallOptions::new().do_next()),
        queue.call_with(record("last"), CallOptions::new().do_last()),
    ];

    gate.await.unwrap();
    for result in join_all(handles).await {
        result.unwrap();
    }

    assert_eq!(
        *log.lock().unwrap(),
        vec!["next", "urgent", "plain", "lazy", "last"]
    );
    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_niceness_is_rejected() {
    let queue = TaskQueue::spawn(config());
    let result = queue
        .call_with(Call::bare("anything"), CallOptions::new().niceness(30))
        .await;
    assert_eq!(result.unwrap_err(), DispatchError::InvalidNiceness(30));
    queue.shutdown().await.unwrap();
}

// =============================================================================
// Updates
// =============================================================================

#[tokio::test]
async fn test_update_reaches_every_worker() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(config());
    for _ in 0..3 {
        queue.attach_worker(threaded_worker(&log)).await.unwrap();
    }

    let results = queue
        .update(Call::new("square", vec![json!(7)]))
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    for outcome in results {
        assert_eq!(outcome.into_value(), Some(json!(49)));
    }
    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_without_workers_is_empty() {
    let queue = TaskQueue::spawn(config());
    let results = queue.update_ephemeral(Call::bare("square")).await.unwrap();
    assert!(results.is_empty());
    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persistent_updates_replay_on_new_workers() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(config());
    queue.attach_worker(threaded_worker(&log)).await.unwrap();

    queue.update(record("persistent")).await.unwrap();
    queue.update_ephemeral(record("ephemeral")).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["persistent", "ephemeral"]);

    queue.attach_worker(threaded_worker(&log)).await.unwrap();
    queue.shutdown().await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["persistent", "ephemeral", "persistent"]
    );
}

// =============================================================================
// Results
// =============================================================================

#[tokio::test]
async fn test_iterator_results_stream_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(config());
    queue.attach_worker(threaded_worker(&log)).await.unwrap();

    for n in [0i64, 1, 10] {
        let outcome = queue
            .call(Call::new("range", vec![json!(n)]))
            .await
            .unwrap();
        let items = outcome.into_items().expect("iterator result");
        let values = items.collect().await.unwrap();
        let expected: Vec<Value> = (0..n).map(|i| json!(i)).collect();
        assert_eq!(values, expected);
    }
    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failures_are_contained() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(config());
    queue
        .attach_worker(LocalWorker::new(Arc::new(universe(Arc::clone(&log)))))
        .await
        .unwrap();

    let text = queue
        .call(Call::new("explode", vec![json!(1)]))
        .await
        .unwrap()
        .into_value()
        .unwrap();
    let text = text.as_str().unwrap();
    assert!(text.contains("boom"));
    assert!(text.contains("explode"));

    let failure = queue
        .call_with(Call::bare("explode"), CallOptions::new().failure_as_value())
        .await
        .unwrap()
        .into_failure()
        .unwrap();
    assert_eq!(
        failure,
        WorkerError::Raised {
            method: "explode".into(),
            message: "boom".into(),
        }
    );

    // Panics are contained too.
    let outcome = queue
        .call_with(Call::bare("panic"), CallOptions::new().failure_as_value())
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Failure(WorkerError::Panicked { .. })));

    // The dispatcher and worker are still usable.
    let outcome = queue.call(Call::new("square", vec![json!(3)])).await.unwrap();
    assert_eq!(outcome.into_value(), Some(json!(9)));
    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_wide_failure_as_value() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(DispatcherConfig {
        failure_as_value: true,
        ..config()
    });
    queue.attach_worker(threaded_worker(&log)).await.unwrap();

    let outcome = queue.call(Call::bare("explode")).await.unwrap();
    assert!(outcome.is_failure());
    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_worker_rests() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(DispatcherConfig {
        recovery_delay: Duration::from_millis(300),
        ..config()
    });
    queue.attach_worker(threaded_worker(&log)).await.unwrap();

    queue.call(Call::bare("explode")).await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.resting, 1);
    assert_eq!(stats.idle, 0);

    // Runs once the worker has recovered.
    let outcome = queue.call(Call::new("square", vec![json!(2)])).await.unwrap();
    assert_eq!(outcome.into_value(), Some(json!(4)));
    queue.shutdown().await.unwrap();
}

// =============================================================================
// Cancellation and Detaching
// =============================================================================

#[tokio::test]
async fn test_cancel_series_and_all() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(config());
    queue.attach_worker(threaded_worker(&log)).await.unwrap();

    let gate = queue.call(Call::new("gate", vec![json!(150)]));
    let batch: Vec<_> = (0..3)
        .map(|i| queue.call_with(record(&format!("batch-{i}")), CallOptions::new().series("batch")))
        .collect();
    let others: Vec<_> = (0..2)
        .map(|i| queue.call(record(&format!("other-{i}"))))
        .collect();

    assert_eq!(queue.cancel_series("batch").await.unwrap(), 3);
    assert_eq!(queue.cancel_series("batch").await.unwrap(), 0);
    assert_eq!(queue.cancel_all().await.unwrap(), 2);

    for result in join_all(batch).await.into_iter().chain(join_all(others).await) {
        assert_eq!(result.unwrap_err(), DispatchError::Cancelled);
    }
    gate.await.unwrap();
    assert!(log.lock().unwrap().is_empty());
    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_detach_worker() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(config());
    let first = queue.attach_worker(threaded_worker(&log)).await.unwrap();
    let second = queue.attach_worker(threaded_worker(&log)).await.unwrap();
    assert_ne!(first, second);

    queue.detach_worker(first).await.unwrap();
    assert_eq!(
        queue.detach_worker(first).await,
        Err(DispatchError::UnknownWorker(first))
    );

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.workers, 1);

    // Work still flows through the remaining worker.
    let outcome = queue.call(Call::new("square", vec![json!(5)])).await.unwrap();
    assert_eq!(outcome.into_value(), Some(json!(25)));
    queue.shutdown().await.unwrap();
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_drains_running_calls() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::spawn(config());
    queue.attach_worker(threaded_worker(&log)).await.unwrap();

    let long = queue.call(Call::new("gate", vec![json!(100)]));
    let queued = queue.call(record("queued"));
    let shutdown = queue.shutdown();
    let late = queue.call(record("late"));

    assert_eq!(late.await.unwrap_err(), DispatchError::ShuttingDown);
    shutdown.await.unwrap();

    assert_eq!(long.await.unwrap().into_value(), Some(Value::Null));
    assert_eq!(queued.await.unwrap().into_value(), Some(json!("queued")));
    assert_eq!(
        queue.call(record("after")).await.unwrap_err(),
        DispatchError::Closed
    );
}

#[tokio::test]
async fn test_shutdown_without_workers_cancels_queued_calls() {
    let queue = TaskQueue::spawn(config());
    let stranded = queue.call(Call::bare("nobody"));
    queue.shutdown().await.unwrap();
    assert_eq!(stranded.await.unwrap_err(), DispatchError::Cancelled);
}

#[tokio::test]
async fn test_cancellation_token_starts_drain() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (dispatcher, queue) = Dispatcher::new(config());
    let token = CancellationToken::new();
    let running = tokio::spawn(dispatcher.run(token.clone()));

    queue.attach_worker(threaded_worker(&log)).await.unwrap();
    let long = queue.call(Call::new("gate", vec![json!(50)]));
    queue.stats().await.unwrap();

    token.cancel();
    running.await.unwrap();

    assert!(long.await.is_ok());
    assert!(!queue.is_running());
}

#[tokio::test]
async fn test_telemetry_events() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(RecordingSink::default());
    let (dispatcher, queue) = Dispatcher::with_telemetry(config(), sink.clone());
    tokio::spawn(dispatcher.run(CancellationToken::new()));

    queue.attach_worker(threaded_worker(&log)).await.unwrap();
    queue.call(Call::bare("explode")).await.unwrap();
    queue.call(record("after")).await.unwrap();
    queue.shutdown().await.unwrap();

    let types = sink.event_types();
    for expected in [
        "worker_attached",
        "task_queued",
        "task_dispatched",
        "task_failed",
        "worker_resting",
        "worker_recovered",
        "task_completed",
        "worker_detached",
        "drained",
    ] {
        assert!(types.contains(&expected), "missing {expected} in {types:?}");
    }
    assert_eq!(types.last(), Some(&"drained"));
}
