//! In-process worker.

use super::items::{ItemSource, Items, PullFuture};
use super::{Reply, Worker, WorkerError, WorkerFuture};
use crate::task::Call;
use crate::universe::{CallError, ItemIter, Returned, Universe};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Where a [`LocalWorker`] runs its calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// On the dispatcher's async task, blocking it for the call's duration.
    #[default]
    Inline,
    /// On tokio's blocking thread pool. Iterator pulls also run there.
    Thread,
}

/// Runs calls against a [`Universe`] in this process.
pub struct LocalWorker {
    name: String,
    universe: Arc<dyn Universe>,
    mode: ExecutionMode,
}

impl LocalWorker {
    /// Inline worker.
    pub fn new(universe: Arc<dyn Universe>) -> Self {
        Self {
            name: "local".to_string(),
            universe,
            mode: ExecutionMode::Inline,
        }
    }

    /// Worker that runs on the blocking thread pool.
    pub fn threaded(universe: Arc<dyn Universe>) -> Self {
        Self::new(universe).with_mode(ExecutionMode::Thread)
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

impl Worker for LocalWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, call: Call) -> WorkerFuture<'_> {
        Box::pin(async move {
            let method = call.method;
            let returned = match self.mode {
                ExecutionMode::Inline => self.universe.invoke(&method, &call.args),
                ExecutionMode::Thread => {
                    let universe = Arc::clone(&self.universe);
                    let name = method.clone();
                    tokio::task::spawn_blocking(move || universe.invoke(&name, &call.args))
                        .await
                        .map_err(|_| WorkerError::Panicked {
                            method: method.clone(),
                        })?
                }
            };

            match returned {
                Ok(Returned::Value(value)) => Ok(Reply::Value(value)),
                Ok(Returned::Iter(iter)) => Ok(Reply::Items(match self.mode {
                    ExecutionMode::Inline => Items::new(InlineSource {
                        method,
                        iter: Some(iter),
                    }),
                    ExecutionMode::Thread => Items::new(BlockingSource {
                        method,
                        iter: Some(iter),
                    }),
                })),
                Err(err) => Err(WorkerError::Raised {
                    method,
                    message: err.message().to_string(),
                }),
            }
        })
    }
}

impl std::fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorker")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Maps one pulled item to what [`Items`] expects.
fn item_result(
    method: &str,
    item: Option<Result<Value, CallError>>,
) -> Result<Option<Value>, WorkerError> {
    match item {
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(err)) => Err(WorkerError::Raised {
            method: method.to_string(),
            message: err.message().to_string(),
        }),
        None => Ok(None),
    }
}

/// Pulls each item on the caller's task.
struct InlineSource {
    method: String,
    iter: Option<ItemIter>,
}

impl ItemSource for InlineSource {
    fn pull(&mut self) -> PullFuture<'_> {
        let result = match self.iter.as_mut() {
            None => Ok(None),
            Some(iter) => match std::panic::catch_unwind(AssertUnwindSafe(|| iter.next())) {
                Ok(item) => item_result(&self.method, item),
                Err(_) => Err(WorkerError::Panicked {
                    method: self.method.clone(),
                }),
            },
        };
        if !matches!(result, Ok(Some(_))) {
            self.iter = None;
        }
        Box::pin(std::future::ready(result))
    }
}

/// Pulls each item of an iterator on the blocking pool.
struct BlockingSource {
    method: String,
    iter: Option<ItemIter>,
}

impl ItemSource for BlockingSource {
    fn pull(&mut self) -> PullFuture<'_> {
        Box::pin(async move {
            let Some(mut iter) = self.iter.take() else {
                return Ok(None);
            };
            let (iter, item) = tokio::task::spawn_blocking(move || {
                let item = iter.next();
                (iter, item)
            })
            .await
            .map_err(|_| WorkerError::Panicked {
                method: self.method.clone(),
            })?;

            let result = item_result(&self.method, item);
            if matches!(result, Ok(Some(_))) {
                self.iter = Some(iter);
            }
            result
        })
    }
}
