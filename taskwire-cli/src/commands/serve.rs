//! Serve command - host the demo methods for remote workers.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use taskwire::wire::{Descriptor, WireRunner, WireServer, MAX_CHUNK_SIZE};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CliError;
use crate::runner::CliRunner;
use crate::universe::demo_universe;

/// Arguments for the serve command.
pub struct ServeArgs {
    pub config: Option<PathBuf>,
    pub descriptor: String,
    pub chunk_size: Option<usize>,
}

/// Run the serve command.
///
/// Prints one line containing `listening` to stdout once the socket is bound,
/// then serves until interrupted.
pub fn run(args: ServeArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(args.config.as_deref())?;
    runner.log_startup("serve");

    let descriptor: Descriptor = args.descriptor.parse()?;
    let chunk_size = args.chunk_size.unwrap_or(runner.config().wire.chunk_size);
    if chunk_size == 0 {
        return Err(CliError::Usage("--chunk-size must be at least 1".to_string()));
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(CliError::Usage(format!(
            "--chunk-size must not exceed {MAX_CHUNK_SIZE}"
        )));
    }

    let runtime = runner.runtime()?;
    runtime.block_on(async {
        let wire_runner = WireRunner::new(Arc::new(demo_universe())).with_chunk_size(chunk_size);
        let server = WireServer::bind(&descriptor, wire_runner).map_err(|error| CliError::Bind {
            descriptor: descriptor.to_string(),
            error,
        })?;

        println!("taskwire wire server listening at {}", descriptor);
        if let Err(e) = std::io::stdout().flush() {
            warn!(error = %e, "Failed to flush stdout");
        }

        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received"),
                Err(e) => warn!(error = %e, "Cannot listen for interrupts"),
            }
            on_signal.cancel();
        });

        server.run(shutdown).await;
        Ok(())
    })
}
