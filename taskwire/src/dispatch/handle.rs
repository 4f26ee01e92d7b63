//! Result handles returned to callers.
//!
//! Every call submitted through a [`TaskQueue`](super::TaskQueue) gets a
//! [`ResultHandle`]: a single-assignment future the dispatcher resolves exactly
//! once. Handles can be awaited directly or through [`ResultHandle::wait`].
//!
//! ```ignore
//! let handle = queue.call(Call::new("double", vec![json!(4)]));
//! match handle.await? {
//!     Outcome::Value(v) => assert_eq!(v, json!(8)),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

use super::DispatchError;
use crate::worker::{Items, WorkerError};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Sending half of a [`ResultHandle`], held by the dispatcher.
pub(crate) type Resolver<T> = oneshot::Sender<Result<T, DispatchError>>;

/// What a finished call produced.
#[derive(Debug)]
pub enum Outcome {
    /// A single value. Also carries the text summary of a failure when the
    /// caller did not ask for failures as values.
    Value(Value),
    /// Per-item results of an iterator call, in order.
    Items(Items),
    /// The failure itself, for callers that asked for it.
    Failure(WorkerError),
}

impl Outcome {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_items(self) -> Option<Items> {
        match self {
            Outcome::Items(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_failure(self) -> Option<WorkerError> {
        match self {
            Outcome::Failure(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }
}

/// Single-assignment future for a dispatched call.
///
/// Resolves with [`DispatchError::Closed`] if the dispatcher went away without
/// answering.
#[derive(Debug)]
pub struct ResultHandle<T = Outcome> {
    rx: oneshot::Receiver<Result<T, DispatchError>>,
}

impl<T> ResultHandle<T> {
    pub(crate) fn channel() -> (Self, Resolver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { rx }, tx)
    }

    /// A handle that is already resolved with `err`.
    pub(crate) fn rejected(err: DispatchError) -> Self {
        let (handle, resolver) = Self::channel();
        let _ = resolver.send(Err(err));
        handle
    }

    /// Waits for the result.
    pub async fn wait(self) -> Result<T, DispatchError> {
        self.await
    }

    /// Returns the result if it is already available.
    ///
    /// Returns `None` while the call is still pending.
    pub fn try_wait(&mut self) -> Option<Result<T, DispatchError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DispatchError::Closed)),
        }
    }
}

impl<T> Future for ResultHandle<T> {
    type Output = Result<T, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(DispatchError::Closed)))
    }
}
