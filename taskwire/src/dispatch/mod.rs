//! Priority dispatcher matching queued calls to idle workers.
//!
//! The dispatcher runs as a single event loop that exclusively owns the
//! pending-call queue and the worker table. Callers talk to it through a
//! cloneable [`TaskQueue`] handle; every request gets a [`ResultHandle`] back
//! immediately and the loop resolves it later.
//!
//! # Architecture
//!
//! ```text
//!   TaskQueue (cloneable)                     Dispatcher loop
//!  ┌─────────────────────┐  commands   ┌──────────────────────────────┐
//!  │ call / update /     │────────────▶│ PriorityQueue<QueuedTask>    │
//!  │ attach / shutdown   │             │ workers: id → WorkerRecord   │
//!  └─────────────────────┘             │ recovering: DelayQueue       │
//!            ▲                         └──────┬────────────────▲──────┘
//!            │ ResultHandle                   │ spawn run()    │ Completion
//!            │                                ▼                │
//!            └──────────────────────────  worker task ─────────┘
//! ```
//!
//! # Rules
//!
//! - A worker runs at most one call at a time.
//! - Whenever a worker goes idle or a call is queued, idle workers are handed
//!   work: their own pending `update` calls first, then the smallest queued
//!   call.
//! - A failed call never reaches the loop as an error. The caller gets a text
//!   summary (or the failure itself when asked for) and the worker rests for
//!   [`DispatcherConfig::recovery_delay`] before taking more work.
//! - `shutdown` stops intake, lets queued and running calls finish, stops
//!   every worker, then resolves.
//!
//! # Example
//!
//! ```ignore
//! let (dispatcher, queue) = Dispatcher::new(DispatcherConfig::default());
//! tokio::spawn(dispatcher.run(CancellationToken::new()));
//!
//! queue.attach_worker(LocalWorker::new(universe)).await?;
//! let outcome = queue.call(Call::new("double", vec![json!(21)])).await?;
//! queue.shutdown().await?;
//! ```

mod config;
mod core;
mod handle;
mod lifecycle;
mod submitter;
mod telemetry;

pub use config::{DispatcherConfig, DEFAULT_RECOVERY_DELAY, DEFAULT_SPEW, DEFAULT_WARN};
pub use core::Dispatcher;
pub use handle::{Outcome, ResultHandle};
pub use submitter::TaskQueue;
pub use telemetry::{DispatchEvent, NullTelemetrySink, TelemetrySink, TracingTelemetrySink};

use crate::worker::WorkerId;
use thiserror::Error;

/// Why a dispatcher request was not carried out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The queue stopped accepting work.
    #[error("task queue is shutting down")]
    ShuttingDown,

    /// Niceness must lie in `-20..=20`.
    #[error("niceness {0} is outside -20..=20")]
    InvalidNiceness(i32),

    /// The call was removed from the queue before any worker ran it.
    #[error("call was cancelled before it ran")]
    Cancelled,

    /// The dispatcher loop is gone.
    #[error("dispatcher is no longer running")]
    Closed,

    /// No attached worker has this id.
    #[error("no attached worker with id {0}")]
    UnknownWorker(WorkerId),
}

/// Snapshot of the dispatcher's load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Calls waiting for a worker.
    pub queued: usize,
    /// Attached workers.
    pub workers: usize,
    /// Workers with nothing to do.
    pub idle: usize,
    /// Workers running a call.
    pub busy: usize,
    /// Workers sitting out a recovery delay.
    pub resting: usize,
    /// `true` once shutdown has begun.
    pub draining: bool,
}
