//! Task queue handle.
//!
//! [`TaskQueue`] is the public interface to a running [`Dispatcher`]. It is
//! cheap to clone; every method sends one command and returns a
//! [`ResultHandle`] without waiting.

use super::config::DispatcherConfig;
use super::core::{CancelScope, Command, Dispatcher};
use super::handle::{Outcome, Resolver, ResultHandle};
use super::{DispatchError, DispatcherStats};
use crate::task::{Call, CallOptions, NICENESS_MAX, NICENESS_MIN};
use crate::worker::{Worker, WorkerId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Task Queue
// =============================================================================

/// Handle for submitting calls to the dispatcher.
///
/// If the dispatcher has exited, every returned handle resolves with
/// [`DispatchError::Closed`](super::DispatchError::Closed).
#[derive(Clone)]
pub struct TaskQueue {
    commands: mpsc::UnboundedSender<Command>,
}

impl TaskQueue {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Creates a dispatcher and spawns its loop on the current runtime.
    ///
    /// The loop drains and exits on [`shutdown`](Self::shutdown) or when every
    /// clone of the returned handle is dropped.
    pub fn spawn(config: DispatcherConfig) -> Self {
        let (dispatcher, queue) = Dispatcher::new(config);
        tokio::spawn(dispatcher.run(CancellationToken::new()));
        queue
    }

    fn request<T>(&self, command: impl FnOnce(Resolver<T>) -> Command) -> ResultHandle<T> {
        let (handle, resolver) = ResultHandle::channel();
        // A failed send drops the command and its resolver, which resolves
        // the handle as closed.
        let _ = self.commands.send(command(resolver));
        handle
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    /// Adds a worker to the pool and returns its id.
    ///
    /// Remembered updates run on the new worker before anything else.
    pub fn attach_worker(&self, worker: impl Worker) -> ResultHandle<WorkerId> {
        self.attach_shared(Arc::new(worker))
    }

    /// Adds an already shared worker to the pool.
    pub fn attach_shared(&self, worker: Arc<dyn Worker>) -> ResultHandle<WorkerId> {
        self.request(|reply| Command::Attach { worker, reply })
    }

    /// Removes a worker once its current call and pending updates finish,
    /// then stops it.
    pub fn detach_worker(&self, worker_id: WorkerId) -> ResultHandle<()> {
        self.request(|reply| Command::Detach { worker_id, reply })
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Queues a call with default options.
    pub fn call(&self, call: Call) -> ResultHandle<Outcome> {
        self.call_with(call, CallOptions::default())
    }

    /// Queues a call.
    ///
    /// A niceness outside `-20..=20` is rejected without reaching the
    /// dispatcher.
    pub fn call_with(&self, call: Call, options: CallOptions) -> ResultHandle<Outcome> {
        if !(NICENESS_MIN..=NICENESS_MAX).contains(&options.niceness) {
            return ResultHandle::rejected(DispatchError::InvalidNiceness(options.niceness));
        }
        self.request(|reply| Command::Call {
            call,
            options,
            reply,
        })
    }

    /// Runs a call on every attached worker, and on every worker attached
    /// later.
    ///
    /// Resolves with one outcome per current worker, in attachment order.
    pub fn update(&self, call: Call) -> ResultHandle<Vec<Outcome>> {
        self.request(|reply| Command::Update {
            call,
            ephemeral: false,
            reply,
        })
    }

    /// Runs a call on every attached worker without remembering it.
    pub fn update_ephemeral(&self, call: Call) -> ResultHandle<Vec<Outcome>> {
        self.request(|reply| Command::Update {
            call,
            ephemeral: true,
            reply,
        })
    }

    /// Cancels queued calls of one series; resolves with how many.
    pub fn cancel_series(&self, series: impl Into<String>) -> ResultHandle<usize> {
        let scope = CancelScope::Series(series.into());
        self.request(|reply| Command::Cancel { scope, reply })
    }

    /// Cancels every queued call; resolves with how many.
    ///
    /// Calls already running are unaffected.
    pub fn cancel_all(&self) -> ResultHandle<usize> {
        self.request(|reply| Command::Cancel {
            scope: CancelScope::All,
            reply,
        })
    }

    // -------------------------------------------------------------------------
    // Status and Shutdown
    // -------------------------------------------------------------------------

    /// Current load.
    pub fn stats(&self) -> ResultHandle<DispatcherStats> {
        self.request(|reply| Command::Stats { reply })
    }

    /// Stops intake, drains queued and running calls, stops every worker.
    pub fn shutdown(&self) -> ResultHandle<()> {
        self.request(|reply| Command::Shutdown { reply })
    }

    /// Returns `true` while the dispatcher loop is alive.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("running", &self.is_running())
            .finish()
    }
}
