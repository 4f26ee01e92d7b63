//! End-to-end tests against real `taskwire serve` processes.

use serde_json::json;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use taskwire::process::ServerManager;
use taskwire::task::Call;
use taskwire::wire::{ReconnectPolicy, WireWorker};
use taskwire::worker::{Reply, Worker};

const BIN: &str = env!("CARGO_BIN_EXE_taskwire");

fn manager() -> ServerManager {
    ServerManager::new(BIN, ["serve"]).unwrap()
}

fn policy() -> ReconnectPolicy {
    ReconnectPolicy {
        interval: Duration::from_millis(20),
        max_attempts: 500,
        max_resends: 3,
    }
}

fn value(reply: Reply) -> serde_json::Value {
    match reply {
        Reply::Value(value) => value,
        Reply::Items(items) => panic!("expected a value, got {items:?}"),
    }
}

#[tokio::test]
async fn test_serve_answers_calls() {
    let mut manager = manager();
    let descriptor = manager.new_descriptor();
    manager.spawn(&descriptor, true).await.unwrap();

    let worker = WireWorker::with_policy(descriptor, policy());
    let reply = worker.run(Call::new("double", vec![json!(21)])).await.unwrap();
    assert_eq!(value(reply), json!(42));

    let reply = worker.run(Call::new("blob", vec![json!(100_000)])).await.unwrap();
    assert_eq!(value(reply).as_str().map(str::len), Some(100_000));

    worker.stop().await;
    manager.done().await;
}

#[tokio::test]
async fn test_socket_readiness_without_stdio() {
    let mut manager = manager();
    let descriptor = manager.new_descriptor();
    manager.spawn(&descriptor, false).await.unwrap();

    let worker = WireWorker::with_policy(descriptor, policy());
    let reply = worker.run(Call::new("echo", vec![json!("hi")])).await.unwrap();
    assert_eq!(value(reply), json!("hi"));
    manager.done().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_survives_process_replacement() {
    let mut manager = manager();
    let descriptor = manager.new_descriptor();
    let first = manager.spawn(&descriptor, true).await.unwrap();

    let worker = Arc::new(WireWorker::with_policy(descriptor.clone(), policy()));
    let before = value(worker.run(Call::bare("whoami")).await.unwrap());
    assert_eq!(before, json!(first));

    let call = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run(Call::new("sleep_ms", vec![json!(400)])).await })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    manager.terminate(first).await.unwrap();
    let second = manager.spawn(&descriptor, true).await.unwrap();
    assert_ne!(first, second);

    let reply = call.await.unwrap().unwrap();
    assert_eq!(value(reply), json!(400));

    let after = value(worker.run(Call::bare("whoami")).await.unwrap());
    assert_eq!(after, json!(second));
    manager.done().await;
}

#[test]
fn test_demo_runs_locally() {
    let output = Command::new(BIN)
        .args(["demo", "--workers", "2", "--calls", "5"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("double(4) = 8"));
    assert!(stdout.contains("range(5) = [0, 1, 2, 3, 4]"));
    assert!(stdout.contains("on purpose"));
}

#[test]
fn test_demo_runs_remotely() {
    let output = Command::new(BIN)
        .args(["demo", "--workers", "2", "--calls", "3", "--remote"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("double(2) = 4"));
}

#[test]
fn test_bad_descriptor_fails() {
    let output = Command::new(BIN)
        .args(["serve", "tcp:localhost:1"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid descriptor"));
}
