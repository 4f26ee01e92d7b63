//! Demo command - dispatch a batch of calls and print what came back.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use taskwire::dispatch::{
    Dispatcher, DispatcherConfig, Outcome, TaskQueue, TracingTelemetrySink,
};
use taskwire::process::ServerManager;
use taskwire::task::{Call, CallOptions};
use taskwire::wire::{ReconnectPolicy, WireWorker};
use taskwire::worker::LocalWorker;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::CliError;
use crate::runner::CliRunner;
use crate::universe::demo_universe;

/// Arguments for the demo command.
pub struct DemoArgs {
    pub config: Option<PathBuf>,
    pub workers: usize,
    pub calls: usize,
    pub remote: bool,
}

/// Run the demo command.
pub fn run(args: DemoArgs) -> Result<(), CliError> {
    if args.workers == 0 {
        return Err(CliError::Usage("--workers must be at least 1".to_string()));
    }

    let runner = CliRunner::new(args.config.as_deref())?;
    runner.log_startup("demo");
    let config = runner.config().clone();

    let runtime = runner.runtime()?;
    runtime.block_on(async move {
        let (dispatcher, queue) = Dispatcher::with_telemetry(
            DispatcherConfig::from(&config.dispatcher),
            Arc::new(TracingTelemetrySink),
        );
        let dispatcher = tokio::spawn(dispatcher.run(CancellationToken::new()));

        let mut servers = None;
        if args.remote {
            let exe = std::env::current_exe().map_err(CliError::Runtime)?;
            let mut manager = ServerManager::new(exe, ["serve"]).map_err(CliError::Runtime)?;
            let policy = ReconnectPolicy::from(&config.wire);
            for i in 0..args.workers {
                let descriptor = manager.new_descriptor();
                let pid = manager.spawn(&descriptor, true).await?;
                info!(pid = pid, descriptor = %descriptor, "Remote worker started");
                let worker = WireWorker::with_policy(descriptor, policy.clone())
                    .with_name(format!("remote-{i}"));
                queue.attach_worker(worker).await?;
            }
            servers = Some(manager);
        } else {
            let universe = Arc::new(demo_universe());
            for i in 0..args.workers {
                let worker = LocalWorker::threaded(universe.clone()).with_name(format!("local-{i}"));
                queue.attach_worker(worker).await?;
            }
        }

        let result = exercise(&queue, args.calls).await;

        queue.shutdown().await?;
        if let Err(e) = dispatcher.await {
            tracing::warn!(error = %e, "Dispatcher task ended abnormally");
        }
        if let Some(mut manager) = servers {
            manager.done().await;
        }
        result
    })
}

async fn exercise(queue: &TaskQueue, calls: usize) -> Result<(), CliError> {
    let owners = queue.update_ephemeral(Call::bare("whoami")).await?;
    let owners: Vec<String> = owners.into_iter().map(describe).collect();
    println!("workers: {}", owners.join(", "));

    let handles: Vec<_> = (0..calls)
        .map(|i| {
            let niceness = (i % 41) as i32 - 20;
            queue.call_with(
                Call::new("double", vec![json!(i)]),
                CallOptions::new().niceness(niceness),
            )
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        println!("double({}) = {}", i, describe(handle.await?));
    }

    if let Some(items) = queue
        .call(Call::new("range", vec![json!(5)]))
        .await?
        .into_items()
    {
        let values: Vec<String> = items
            .collect()
            .await
            .map(|values| values.iter().map(ToString::to_string).collect())
            .unwrap_or_else(|e| vec![e.to_string()]);
        println!("range(5) = [{}]", values.join(", "));
    }

    let failure = queue.call(Call::new("fail", vec![json!("on purpose")])).await?;
    println!("fail = {}", describe(failure));
    Ok(())
}

fn describe(outcome: Outcome) -> String {
    match outcome {
        Outcome::Value(value) => value.to_string(),
        Outcome::Items(items) => format!("{items:?}"),
        Outcome::Failure(err) => format!("failure: {err}"),
    }
}
