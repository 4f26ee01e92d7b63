//! taskwire - priority task dispatch over a pluggable worker pool
//!
//! Calls are queued with a priority, handed to whichever attached worker is
//! idle, and resolved through a [`ResultHandle`](dispatch::ResultHandle).
//! Workers run calls in-process ([`worker::LocalWorker`]) or in another
//! process over a unix socket ([`wire::WireWorker`] talking to a
//! [`wire::WireServer`]).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use taskwire::dispatch::{DispatcherConfig, TaskQueue};
//! use taskwire::task::Call;
//! use taskwire::universe::{arg_i64, MethodTable};
//! use taskwire::worker::LocalWorker;
//!
//! let table = MethodTable::new().method("double", |args| Ok((arg_i64(args, 0)? * 2).into()));
//! let queue = TaskQueue::spawn(DispatcherConfig::default());
//! queue.attach_worker(LocalWorker::new(Arc::new(table))).await?;
//!
//! let doubled = queue.call(Call::new("double", vec![21.into()])).await?;
//! ```

pub mod config;
pub mod dispatch;
pub mod logging;
pub mod process;
pub mod queue;
pub mod task;
pub mod universe;
pub mod wire;
pub mod worker;

/// Value model shared by calls, results and the wire codec.
pub use serde_json::Value;

/// Version of the taskwire library and CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
