//! Lazy item sequences for iterator-shaped results.

use super::WorkerError;
use futures::stream::{self, Stream};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Future returned by [`ItemSource::pull`].
pub type PullFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Value>, WorkerError>> + Send + 'a>>;

/// Where the items of an [`Items`] sequence come from.
///
/// `pull` yields `Ok(None)` once the sequence is exhausted.
pub trait ItemSource: Send + 'static {
    fn pull(&mut self) -> PullFuture<'_>;
}

/// In-order, one-at-a-time results of an iterator call.
///
/// Nothing is fetched ahead: each [`next`](Items::next) pulls exactly one item
/// from the source. After the sequence ends, or after the first error, every
/// further `next` returns `None`.
pub struct Items {
    source: Option<Box<dyn ItemSource>>,
    delivered: usize,
}

impl Items {
    pub fn new(source: impl ItemSource) -> Self {
        Self {
            source: Some(Box::new(source)),
            delivered: 0,
        }
    }

    /// Items drawn from an in-process iterator.
    pub fn from_iterator<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::new(IterSource(items.into_iter()))
    }

    /// Next item, or `None` when the sequence is over.
    pub async fn next(&mut self) -> Option<Result<Value, WorkerError>> {
        let source = self.source.as_mut()?;
        let pulled = source.pull().await;
        match pulled {
            Ok(Some(value)) => {
                self.delivered += 1;
                Some(Ok(value))
            }
            Ok(None) => {
                self.source = None;
                None
            }
            Err(err) => {
                self.source = None;
                Some(Err(err))
            }
        }
    }

    /// Pulls every remaining item.
    pub async fn collect(mut self) -> Result<Vec<Value>, WorkerError> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }

    /// Converts the sequence into a stream of per-item results.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value, WorkerError>> + Send {
        stream::unfold(self, |mut items| async move {
            let item = items.next().await?;
            Some((item, items))
        })
    }

    /// Number of items handed out so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Returns `true` once the source is exhausted or failed.
    pub fn is_finished(&self) -> bool {
        self.source.is_none()
    }
}

impl fmt::Debug for Items {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Items")
            .field("delivered", &self.delivered)
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct IterSource<I>(I);

impl<I> ItemSource for IterSource<I>
where
    I: Iterator<Item = Value> + Send + 'static,
{
    fn pull(&mut self) -> PullFuture<'_> {
        Box::pin(std::future::ready(Ok(self.0.next())))
    }
}
