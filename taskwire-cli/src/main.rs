//! taskwire CLI - Command-line interface
//!
//! Hosts wire servers for other processes and runs a small dispatch demo.

mod commands;
mod error;
mod runner;
mod universe;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "taskwire")]
#[command(version = taskwire::VERSION)]
#[command(about = "Priority task dispatch over local and remote workers", long_about = None)]
struct Cli {
    /// Path to an INI configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo methods on a unix socket until interrupted
    Serve {
        /// Socket descriptor, e.g. unix:/tmp/worker.sock
        descriptor: String,

        /// Results larger than this many bytes are sent in chunks
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Dispatch a batch of calls over a pool of workers and print the results
    Demo {
        /// Number of workers to attach
        #[arg(long, default_value = "3")]
        workers: usize,

        /// Number of calls to dispatch
        #[arg(long, default_value = "20")]
        calls: usize,

        /// Run each worker as a separate `taskwire serve` process
        #[arg(long)]
        remote: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            descriptor,
            chunk_size,
        } => commands::serve::run(commands::serve::ServeArgs {
            config: cli.config,
            descriptor,
            chunk_size,
        }),
        Commands::Demo {
            workers,
            calls,
            remote,
        } => commands::demo::run(commands::demo::DemoArgs {
            config: cli.config,
            workers,
            calls,
            remote,
        }),
    };

    if let Err(e) = result {
        e.exit();
    }
}
