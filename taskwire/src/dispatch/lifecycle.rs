//! Assignment lifecycle: dispatching work, collecting completions, resting
//! failed workers, detaching and draining.

use super::core::{Assignment, Completion, Delivery, Dispatcher, WorkerState};
use super::handle::Outcome;
use super::telemetry::DispatchEvent;
use super::DispatchError;
use crate::task::Call;
use crate::worker::{Reply, WorkerError, WorkerId};
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Text handed to callers in place of a failure.
pub(crate) fn failure_summary(call: &Call, err: &WorkerError) -> String {
    format!("Task {call} failed: {err}")
}

/// INFO record for a successful call. Iterator results are not consumed.
fn spew(worker_id: WorkerId, call: &Call, reply: &Reply) {
    let args = Value::Array(call.args.clone());
    match reply {
        Reply::Value(value) => info!(
            worker_id = %worker_id,
            method = %call.method,
            args = %args,
            result = %value,
            "Call result"
        ),
        Reply::Items(_) => info!(
            worker_id = %worker_id,
            method = %call.method,
            args = %args,
            result = "lazy item sequence",
            "Call result"
        ),
    }
}

impl Dispatcher {
    // =========================================================================
    // Dispatching
    // =========================================================================

    /// Hands work to every idle worker that can take some.
    ///
    /// A worker's own assignments go first; a worker being detached takes
    /// nothing from the shared queue.
    pub(crate) fn assign_work(&mut self) {
        let idle: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, record)| record.state == WorkerState::Idle)
            .map(|(id, _)| *id)
            .collect();

        for worker_id in idle {
            let Some(record) = self.workers.get_mut(&worker_id) else {
                continue;
            };
            let assignment = match record.assignments.pop_front() {
                Some(assignment) => assignment,
                None if record.detach.is_some() => continue,
                None => match self.queue.try_get() {
                    Some(task) => task.into_assignment(),
                    None => continue,
                },
            };
            self.start(worker_id, assignment);
        }
    }

    /// Marks the worker busy and runs the assignment on its own task.
    fn start(&mut self, worker_id: WorkerId, assignment: Assignment) {
        let Some(record) = self.workers.get_mut(&worker_id) else {
            return;
        };
        record.state = WorkerState::Busy;
        let worker = Arc::clone(&record.worker);

        self.telemetry.emit(DispatchEvent::TaskDispatched {
            worker_id,
            method: assignment.call.method.clone(),
            wait_time: assignment.queued_at.elapsed(),
        });

        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let call = assignment.call.clone();
            let method = call.method.clone();
            let result = AssertUnwindSafe(worker.run(call))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(WorkerError::Panicked { method }));

            // The loop owns the receiver until it exits; a failed send only
            // means the dispatcher is gone.
            let _ = completion_tx.send(Completion {
                worker_id,
                assignment,
                result,
                duration: started.elapsed(),
            });
        });
    }

    // =========================================================================
    // Completions
    // =========================================================================

    /// Routes a finished assignment's outcome and frees or rests the worker.
    pub(crate) fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            worker_id,
            assignment,
            result,
            duration,
        } = completion;
        let Assignment { call, delivery, .. } = assignment;

        let outcome = match result {
            Ok(reply) => {
                self.telemetry.emit(DispatchEvent::TaskCompleted {
                    worker_id,
                    method: call.method.clone(),
                    duration,
                });
                self.mark_idle(worker_id);
                if self.config.spew {
                    spew(worker_id, &call, &reply);
                }
                match reply {
                    Reply::Value(value) => Outcome::Value(value),
                    Reply::Items(items) => Outcome::Items(items),
                }
            }
            Err(err) => {
                if self.config.warn {
                    warn!(
                        worker_id = %worker_id,
                        method = %call.method,
                        call = %call,
                        error = %err,
                        "Task failed"
                    );
                } else {
                    debug!(
                        worker_id = %worker_id,
                        method = %call.method,
                        call = %call,
                        error = %err,
                        "Task failed"
                    );
                }
                self.telemetry.emit(DispatchEvent::TaskFailed {
                    worker_id,
                    method: call.method.clone(),
                    error: err.to_string(),
                });
                self.rest(worker_id);

                let as_value = match &delivery {
                    Delivery::Caller {
                        failure_as_value, ..
                    } => *failure_as_value,
                    Delivery::Broadcast { .. } | Delivery::Replay => self.config.failure_as_value,
                };
                if as_value {
                    Outcome::Failure(err)
                } else {
                    Outcome::Value(Value::String(failure_summary(&call, &err)))
                }
            }
        };

        self.deliver(delivery, outcome);
    }

    fn mark_idle(&mut self, worker_id: WorkerId) {
        if let Some(record) = self.workers.get_mut(&worker_id) {
            record.state = WorkerState::Idle;
        }
    }

    /// Parks a worker that just failed for the recovery delay.
    fn rest(&mut self, worker_id: WorkerId) {
        let Some(record) = self.workers.get_mut(&worker_id) else {
            return;
        };
        let delay = self.config.recovery_delay;
        if delay.is_zero() {
            record.state = WorkerState::Idle;
            return;
        }
        record.state = WorkerState::Resting;
        self.recovering.insert(worker_id, delay);
        self.telemetry.emit(DispatchEvent::WorkerResting { worker_id, delay });
    }

    fn deliver(&mut self, delivery: Delivery, outcome: Outcome) {
        match delivery {
            Delivery::Caller { reply, .. } => {
                // The caller may have dropped its handle.
                let _ = reply.send(Ok(outcome));
            }
            Delivery::Broadcast { update, slot } => {
                let Entry::Occupied(mut entry) = self.updates.entry(update) else {
                    return;
                };
                let pending = entry.get_mut();
                pending.results[slot] = Some(outcome);
                pending.remaining -= 1;
                if pending.remaining == 0 {
                    let pending = entry.remove();
                    let results = pending.results.into_iter().flatten().collect();
                    let _ = pending.reply.send(Ok(results));
                }
            }
            Delivery::Replay => {
                debug!(outcome = ?outcome, "Replayed update finished");
            }
        }
    }

    /// Returns a rested worker to the idle pool.
    pub(crate) fn handle_recovered(&mut self, worker_id: WorkerId) {
        let Some(record) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if record.state == WorkerState::Resting {
            record.state = WorkerState::Idle;
            debug!(worker_id = %worker_id, "Worker recovered");
            self.telemetry.emit(DispatchEvent::WorkerRecovered { worker_id });
        }
    }

    // =========================================================================
    // Detach and Drain
    // =========================================================================

    /// Stops workers whose detach was requested once they have nothing left
    /// to run.
    pub(crate) fn finish_detaches(&mut self) {
        let ready: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, record)| {
                record.detach.is_some()
                    && record.state != WorkerState::Busy
                    && record.assignments.is_empty()
            })
            .map(|(id, _)| *id)
            .collect();

        for worker_id in ready {
            let Some(record) = self.workers.remove(&worker_id) else {
                continue;
            };
            info!(worker_id = %worker_id, "Worker detached");
            self.telemetry.emit(DispatchEvent::WorkerDetached { worker_id });

            let worker = record.worker;
            let reply = record.detach;
            tokio::spawn(async move {
                worker.stop().await;
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            });
        }
    }

    /// Completes shutdown once every queued and running call has finished.
    ///
    /// Returns `true` when the loop should exit.
    pub(crate) async fn try_finish_drain(&mut self) -> bool {
        if !self.draining {
            return false;
        }

        // Without workers nothing queued can ever run.
        if self.workers.is_empty() && !self.queue.is_empty() {
            let stranded = self.queue.close();
            warn!(count = stranded.len(), "No workers left; cancelling queued calls");
            for task in stranded {
                let _ = task.reply.send(Err(DispatchError::Cancelled));
            }
        }

        let settled = self.queue.is_empty()
            && self
                .workers
                .values()
                .all(|record| record.state != WorkerState::Busy && record.assignments.is_empty());
        if !settled {
            return false;
        }

        let records = std::mem::take(&mut self.workers);
        let count = records.len();
        join_all(records.values().map(|record| record.worker.stop())).await;
        for (worker_id, record) in records {
            self.telemetry.emit(DispatchEvent::WorkerDetached { worker_id });
            if let Some(reply) = record.detach {
                let _ = reply.send(Ok(()));
            }
        }

        self.queue.close();
        self.recovering.clear();
        self.telemetry.emit(DispatchEvent::Drained { workers: count });
        info!(workers = count, "Dispatcher drained");

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        true
    }
}
