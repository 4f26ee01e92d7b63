//! Execution backends.
//!
//! A [`Worker`] runs one [`Call`] at a time and reports either a [`Reply`] or
//! a [`WorkerError`]. The dispatcher never hands a worker a second call while
//! the first is still running, so implementations need no internal queueing.
//!
//! ```text
//!                 ┌──────────────┐
//!   Dispatcher ──▶│ dyn Worker   │
//!                 └──────┬───────┘
//!            ┌───────────┴────────────┐
//!            ▼                        ▼
//!     LocalWorker               WireWorker
//!   (inline / thread)     (socket to a WireRunner)
//! ```
//!
//! Iterator-shaped results come back as [`Items`], a lazy sequence that pulls
//! one value at a time from wherever the iterator actually lives.

mod items;
mod local;

pub use items::{ItemSource, Items, PullFuture};
pub use local::{ExecutionMode, LocalWorker};

use crate::task::Call;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Future returned by [`Worker::run`].
pub type WorkerFuture<'a> = Pin<Box<dyn Future<Output = Result<Reply, WorkerError>> + Send + 'a>>;

/// Successful result of running a call.
#[derive(Debug)]
pub enum Reply {
    Value(Value),
    Items(Items),
}

/// Identifier assigned to an attached worker.
///
/// Ids start at 1 and are never reused within one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl WorkerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Why a worker could not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The method itself reported an error.
    #[error("'{method}' raised: {message}")]
    Raised { method: String, message: String },

    /// The method panicked; the worker survived.
    #[error("'{method}' panicked")]
    Panicked { method: String },

    /// The worker could not reach its execution backend.
    #[error("'{method}' could not be delivered: {reason}")]
    Connection { method: String, reason: String },

    /// The backend answered with something that makes no sense for the call.
    #[error("'{method}' got a malformed reply: {reason}")]
    Protocol { method: String, reason: String },
}

impl WorkerError {
    /// Method name of the failed call.
    pub fn method(&self) -> &str {
        match self {
            WorkerError::Raised { method, .. }
            | WorkerError::Panicked { method }
            | WorkerError::Connection { method, .. }
            | WorkerError::Protocol { method, .. } => method,
        }
    }
}

/// An execution backend.
pub trait Worker: Send + Sync + 'static {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Runs one call to completion.
    fn run(&self, call: Call) -> WorkerFuture<'_>;

    /// Releases backend resources. Called once, after the last `run`.
    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(std::future::ready(()))
    }
}
