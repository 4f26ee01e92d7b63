//! Telemetry for dispatcher observability.
//!
//! The dispatcher emits structured [`DispatchEvent`]s through a
//! [`TelemetrySink`] and never decides how they are presented. The default
//! sink discards everything; [`TracingTelemetrySink`] turns events into DEBUG
//! records.
//!
//! # Example
//!
//! ```
//! use taskwire::dispatch::{DispatchEvent, TelemetrySink};
//!
//! struct CountingSink(std::sync::atomic::AtomicUsize);
//!
//! impl TelemetrySink for CountingSink {
//!     fn emit(&self, _event: DispatchEvent) {
//!         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!     }
//! }
//! ```

use crate::task::Priority;
use crate::worker::WorkerId;
use std::time::Duration;

// =============================================================================
// Dispatch Events
// =============================================================================

/// Events emitted while the dispatcher runs.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchEvent {
    // -------------------------------------------------------------------------
    // Worker Lifecycle Events
    // -------------------------------------------------------------------------
    /// A worker joined the pool.
    WorkerAttached { worker_id: WorkerId, name: String },

    /// A worker left the pool and was stopped.
    WorkerDetached { worker_id: WorkerId },

    /// A worker failed a call and is resting.
    WorkerResting {
        worker_id: WorkerId,
        delay: Duration,
    },

    /// A resting worker is available again.
    WorkerRecovered { worker_id: WorkerId },

    // -------------------------------------------------------------------------
    // Task Events
    // -------------------------------------------------------------------------
    /// A call was queued.
    TaskQueued {
        method: String,
        priority: Priority,
        queue_depth: usize,
    },

    /// A call was handed to a worker.
    TaskDispatched {
        worker_id: WorkerId,
        method: String,
        wait_time: Duration,
    },

    /// A call finished successfully.
    TaskCompleted {
        worker_id: WorkerId,
        method: String,
        duration: Duration,
    },

    /// A call failed; the failure was contained.
    TaskFailed {
        worker_id: WorkerId,
        method: String,
        error: String,
    },

    /// Queued calls were cancelled.
    TasksCancelled { count: usize },

    // -------------------------------------------------------------------------
    // Dispatcher Events
    // -------------------------------------------------------------------------
    /// The dispatcher finished draining and stopped its workers.
    Drained { workers: usize },
}

impl DispatchEvent {
    /// Returns the worker this event concerns, if any.
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            Self::WorkerAttached { worker_id, .. }
            | Self::WorkerDetached { worker_id }
            | Self::WorkerResting { worker_id, .. }
            | Self::WorkerRecovered { worker_id }
            | Self::TaskDispatched { worker_id, .. }
            | Self::TaskCompleted { worker_id, .. }
            | Self::TaskFailed { worker_id, .. } => Some(*worker_id),
            Self::TaskQueued { .. } | Self::TasksCancelled { .. } | Self::Drained { .. } => None,
        }
    }

    /// Returns a short name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkerAttached { .. } => "worker_attached",
            Self::WorkerDetached { .. } => "worker_detached",
            Self::WorkerResting { .. } => "worker_resting",
            Self::WorkerRecovered { .. } => "worker_recovered",
            Self::TaskQueued { .. } => "task_queued",
            Self::TaskDispatched { .. } => "task_dispatched",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TasksCancelled { .. } => "tasks_cancelled",
            Self::Drained { .. } => "drained",
        }
    }
}

// =============================================================================
// Telemetry Sink Trait
// =============================================================================

/// Receiver of dispatcher events.
///
/// `emit` is called from the dispatcher loop, so it should return quickly.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: DispatchEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn emit(&self, _event: DispatchEvent) {}
}

/// Logs every event at DEBUG.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, event: DispatchEvent) {
        match &event {
            DispatchEvent::WorkerAttached { worker_id, name } => {
                tracing::debug!(worker_id = %worker_id, name = %name, "Worker attached");
            }
            DispatchEvent::WorkerDetached { worker_id } => {
                tracing::debug!(worker_id = %worker_id, "Worker detached");
            }
            DispatchEvent::WorkerResting { worker_id, delay } => {
                tracing::debug!(
                    worker_id = %worker_id,
                    delay_ms = delay.as_millis(),
                    "Worker resting"
                );
            }
            DispatchEvent::WorkerRecovered { worker_id } => {
                tracing::debug!(worker_id = %worker_id, "Worker recovered");
            }
            DispatchEvent::TaskQueued {
                method,
                priority,
                queue_depth,
            } => {
                tracing::debug!(
                    method = %method,
                    priority = %priority,
                    queue_depth = queue_depth,
                    "Task queued"
                );
            }
            DispatchEvent::TaskDispatched {
                worker_id,
                method,
                wait_time,
            } => {
                tracing::debug!(
                    worker_id = %worker_id,
                    method = %method,
                    wait_ms = wait_time.as_millis(),
                    "Task dispatched"
                );
            }
            DispatchEvent::TaskCompleted {
                worker_id,
                method,
                duration,
            } => {
                tracing::debug!(
                    worker_id = %worker_id,
                    method = %method,
                    duration_ms = duration.as_millis(),
                    "Task completed"
                );
            }
            DispatchEvent::TaskFailed {
                worker_id,
                method,
                error,
            } => {
                tracing::debug!(
                    worker_id = %worker_id,
                    method = %method,
                    error = %error,
                    "Task failed"
                );
            }
            DispatchEvent::TasksCancelled { count } => {
                tracing::debug!(count = count, "Tasks cancelled");
            }
            DispatchEvent::Drained { workers } => {
                tracing::debug!(workers = workers, "Dispatcher drained");
            }
        }
    }
}
