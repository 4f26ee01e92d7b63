//! Dispatcher core - main struct, commands and run loop.
//!
//! Handler methods for completions, recovery and draining live in
//! `lifecycle`.

use super::config::DispatcherConfig;
use super::handle::{Outcome, Resolver};
use super::submitter::TaskQueue;
use super::telemetry::{DispatchEvent, NullTelemetrySink, TelemetrySink};
use super::{DispatchError, DispatcherStats};
use crate::queue::PriorityQueue;
use crate::task::{Call, CallOptions, Priority, PriorityFactory};
use crate::worker::{Reply, Worker, WorkerError, WorkerId};
use futures::StreamExt;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info};

// =============================================================================
// Commands
// =============================================================================

/// Requests sent from a [`TaskQueue`] to the dispatcher loop.
pub(crate) enum Command {
    Attach {
        worker: Arc<dyn Worker>,
        reply: Resolver<WorkerId>,
    },
    Detach {
        worker_id: WorkerId,
        reply: Resolver<()>,
    },
    Call {
        call: Call,
        options: CallOptions,
        reply: Resolver<Outcome>,
    },
    Update {
        call: Call,
        ephemeral: bool,
        reply: Resolver<Vec<Outcome>>,
    },
    Cancel {
        scope: CancelScope,
        reply: Resolver<usize>,
    },
    Stats {
        reply: Resolver<DispatcherStats>,
    },
    Shutdown {
        reply: Resolver<()>,
    },
}

/// Which queued calls a cancel request removes.
pub(crate) enum CancelScope {
    All,
    Series(String),
}

impl CancelScope {
    fn matches(&self, task: &QueuedTask) -> bool {
        match self {
            CancelScope::All => true,
            CancelScope::Series(series) => task.series.as_deref() == Some(series.as_str()),
        }
    }
}

// =============================================================================
// Queued Work
// =============================================================================

/// A call waiting in the shared queue.
pub(crate) struct QueuedTask {
    pub(crate) priority: Priority,
    pub(crate) series: Option<String>,
    pub(crate) call: Call,
    pub(crate) failure_as_value: bool,
    pub(crate) reply: Resolver<Outcome>,
    pub(crate) queued_at: Instant,
}

impl QueuedTask {
    pub(crate) fn into_assignment(self) -> Assignment {
        Assignment {
            call: self.call,
            delivery: Delivery::Caller {
                reply: self.reply,
                failure_as_value: self.failure_as_value,
            },
            queued_at: self.queued_at,
        }
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

/// A call bound to one particular worker.
pub(crate) struct Assignment {
    pub(crate) call: Call,
    pub(crate) delivery: Delivery,
    pub(crate) queued_at: Instant,
}

/// Where the outcome of an [`Assignment`] goes.
pub(crate) enum Delivery {
    /// Back to the caller of `call`.
    Caller {
        reply: Resolver<Outcome>,
        failure_as_value: bool,
    },
    /// Into one slot of a pending `update` broadcast.
    Broadcast { update: u64, slot: usize },
    /// A remembered update replayed on a newly attached worker.
    Replay,
}

/// Result of one assignment, sent back to the loop by the worker task.
pub(crate) struct Completion {
    pub(crate) worker_id: WorkerId,
    pub(crate) assignment: Assignment,
    pub(crate) result: Result<Reply, WorkerError>,
    pub(crate) duration: Duration,
}

// =============================================================================
// Worker Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Idle,
    Busy,
    Resting,
}

pub(crate) struct WorkerRecord {
    pub(crate) worker: Arc<dyn Worker>,
    pub(crate) state: WorkerState,
    /// Calls only this worker may run, ahead of the shared queue.
    pub(crate) assignments: VecDeque<Assignment>,
    /// Set once detach was requested; resolved when the worker is stopped.
    pub(crate) detach: Option<Resolver<()>>,
}

/// An `update` broadcast waiting for every worker's result.
pub(crate) struct PendingUpdate {
    pub(crate) results: Vec<Option<Outcome>>,
    pub(crate) remaining: usize,
    pub(crate) reply: Resolver<Vec<Outcome>>,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// The dispatcher event loop.
///
/// Create one with [`Dispatcher::new`], spawn [`Dispatcher::run`], and talk to
/// it through the returned [`TaskQueue`].
pub struct Dispatcher {
    /// Receiver for requests from task queue handles.
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,

    /// `false` once every task queue handle is gone.
    pub(crate) commands_open: bool,

    /// Sender for assignment completions.
    pub(crate) completion_tx: mpsc::UnboundedSender<Completion>,

    /// Receiver for assignment completions.
    pub(crate) completion_rx: mpsc::UnboundedReceiver<Completion>,

    /// Calls waiting for any worker.
    pub(crate) queue: PriorityQueue<QueuedTask>,

    /// Priority minting with per-series serials.
    pub(crate) priorities: PriorityFactory,

    /// Attached workers in attachment order.
    pub(crate) workers: BTreeMap<WorkerId, WorkerRecord>,

    /// Next id handed to an attached worker.
    pub(crate) next_worker_id: u64,

    /// Updates replayed on every newly attached worker.
    pub(crate) persistent_updates: Vec<Call>,

    /// Broadcasts still collecting results.
    pub(crate) updates: HashMap<u64, PendingUpdate>,

    /// Next broadcast id.
    pub(crate) next_update_id: u64,

    /// Recovery timers of resting workers.
    pub(crate) recovering: DelayQueue<WorkerId>,

    /// Telemetry sink for emitting events.
    pub(crate) telemetry: Arc<dyn TelemetrySink>,

    /// Configuration.
    pub(crate) config: DispatcherConfig,

    /// `true` once shutdown has begun.
    pub(crate) draining: bool,

    /// Callers waiting for shutdown to finish.
    pub(crate) shutdown_waiters: Vec<Resolver<()>>,
}

impl Dispatcher {
    /// Creates a dispatcher and the handle used to feed it.
    pub fn new(config: DispatcherConfig) -> (Self, TaskQueue) {
        Self::with_telemetry(config, Arc::new(NullTelemetrySink))
    }

    /// Creates a dispatcher that reports to `telemetry`.
    pub fn with_telemetry(
        config: DispatcherConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> (Self, TaskQueue) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let dispatcher = Self {
            commands: command_rx,
            commands_open: true,
            completion_tx,
            completion_rx,
            queue: PriorityQueue::new(),
            priorities: PriorityFactory::new(),
            workers: BTreeMap::new(),
            next_worker_id: 1,
            persistent_updates: Vec::new(),
            updates: HashMap::new(),
            next_update_id: 0,
            recovering: DelayQueue::new(),
            telemetry,
            config,
            draining: false,
            shutdown_waiters: Vec::new(),
        };

        (dispatcher, TaskQueue::new(command_tx))
    }

    /// Runs the loop until shutdown has drained all work.
    ///
    /// Shutdown starts on [`TaskQueue::shutdown`], on cancellation of
    /// `shutdown`, or once every [`TaskQueue`] handle has been dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            recovery_delay_ms = self.config.recovery_delay.as_millis(),
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled(), if !self.draining => {
                    info!("Dispatcher shutdown requested");
                    self.draining = true;
                }

                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion);
                }

                Some(expired) = self.recovering.next() => {
                    self.handle_recovered(expired.into_inner());
                }

                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!("All task queue handles dropped");
                            self.commands_open = false;
                            self.draining = true;
                        }
                    }
                }
            }

            self.assign_work();
            self.finish_detaches();

            if self.try_finish_drain().await {
                break;
            }
        }

        info!("Dispatcher stopped");
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach { worker, reply } => {
                let _ = reply.send(self.attach(worker));
            }
            Command::Detach { worker_id, reply } => self.detach(worker_id, reply),
            Command::Call {
                call,
                options,
                reply,
            } => self.enqueue(call, options, reply),
            Command::Update {
                call,
                ephemeral,
                reply,
            } => self.broadcast(call, ephemeral, reply),
            Command::Cancel { scope, reply } => {
                let count = self.cancel(scope);
                let _ = reply.send(Ok(count));
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.stats()));
            }
            Command::Shutdown { reply } => {
                if !self.draining {
                    info!(
                        queued = self.queue.len(),
                        workers = self.workers.len(),
                        "Dispatcher draining"
                    );
                }
                self.draining = true;
                self.shutdown_waiters.push(reply);
            }
        }
    }

    fn attach(&mut self, worker: Arc<dyn Worker>) -> Result<WorkerId, DispatchError> {
        if self.draining {
            return Err(DispatchError::ShuttingDown);
        }

        let worker_id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;

        let now = Instant::now();
        let assignments = self
            .persistent_updates
            .iter()
            .map(|call| Assignment {
                call: call.clone(),
                delivery: Delivery::Replay,
                queued_at: now,
            })
            .collect();

        info!(worker_id = %worker_id, name = %worker.name(), "Worker attached");
        self.telemetry.emit(DispatchEvent::WorkerAttached {
            worker_id,
            name: worker.name().to_string(),
        });

        self.workers.insert(
            worker_id,
            WorkerRecord {
                worker,
                state: WorkerState::Idle,
                assignments,
                detach: None,
            },
        );
        Ok(worker_id)
    }

    fn detach(&mut self, worker_id: WorkerId, reply: Resolver<()>) {
        match self.workers.get_mut(&worker_id) {
            Some(record) if record.detach.is_none() => {
                debug!(worker_id = %worker_id, "Worker detach requested");
                record.detach = Some(reply);
            }
            Some(_) | None => {
                let _ = reply.send(Err(DispatchError::UnknownWorker(worker_id)));
            }
        }
    }

    fn enqueue(&mut self, call: Call, options: CallOptions, reply: Resolver<Outcome>) {
        if self.draining {
            let _ = reply.send(Err(DispatchError::ShuttingDown));
            return;
        }
        let Some(priority) = self.priorities.next(&options) else {
            let _ = reply.send(Err(DispatchError::InvalidNiceness(options.niceness)));
            return;
        };

        let method = call.method.clone();
        self.queue.put(QueuedTask {
            priority,
            series: options.series,
            call,
            failure_as_value: options.wants_failure_as_value || self.config.failure_as_value,
            reply,
            queued_at: Instant::now(),
        });

        self.telemetry.emit(DispatchEvent::TaskQueued {
            method,
            priority,
            queue_depth: self.queue.len(),
        });
    }

    fn broadcast(&mut self, call: Call, ephemeral: bool, reply: Resolver<Vec<Outcome>>) {
        if self.draining {
            let _ = reply.send(Err(DispatchError::ShuttingDown));
            return;
        }
        if !ephemeral {
            self.persistent_updates.push(call.clone());
        }

        let targets: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, record)| record.detach.is_none())
            .map(|(id, _)| *id)
            .collect();
        if targets.is_empty() {
            let _ = reply.send(Ok(Vec::new()));
            return;
        }

        let update = self.next_update_id;
        self.next_update_id += 1;
        self.updates.insert(
            update,
            PendingUpdate {
                results: targets.iter().map(|_| None).collect(),
                remaining: targets.len(),
                reply,
            },
        );

        let now = Instant::now();
        for (slot, worker_id) in targets.into_iter().enumerate() {
            if let Some(record) = self.workers.get_mut(&worker_id) {
                record.assignments.push_back(Assignment {
                    call: call.clone(),
                    delivery: Delivery::Broadcast { update, slot },
                    queued_at: now,
                });
            }
        }

        debug!(call = %call, ephemeral = ephemeral, "Update broadcast");
    }

    fn cancel(&mut self, scope: CancelScope) -> usize {
        let removed = self.queue.cancel(|task| scope.matches(task));
        let count = removed.len();
        for task in removed {
            let _ = task.reply.send(Err(DispatchError::Cancelled));
        }
        if count > 0 {
            debug!(count = count, "Queued calls cancelled");
            self.telemetry.emit(DispatchEvent::TasksCancelled { count });
        }
        count
    }

    pub(crate) fn stats(&self) -> DispatcherStats {
        let mut stats = DispatcherStats {
            queued: self.queue.len(),
            workers: self.workers.len(),
            draining: self.draining,
            ..DispatcherStats::default()
        };
        for record in self.workers.values() {
            match record.state {
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Resting => stats.resting += 1,
            }
        }
        stats
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .field("workers", &self.workers.len())
            .field("draining", &self.draining)
            .finish_non_exhaustive()
    }
}
