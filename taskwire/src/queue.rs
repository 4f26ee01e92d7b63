//! Priority queue with get-before-put waiters.
//!
//! [`PriorityQueue`] is a min-heap: the smallest item is always handed out
//! first, and items that compare equal leave in the order they were put.
//!
//! A [`get`](PriorityQueue::get) issued while the queue is empty returns a
//! [`Claim`] that resolves on a later [`put`](PriorityQueue::put). Waiters are
//! served oldest-first, and a waiter whose claim was dropped is skipped.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use taskwire::queue::PriorityQueue;
//!
//! let mut queue = PriorityQueue::new();
//! let claim = queue.get();
//! queue.put(7);
//! queue.put(3);
//!
//! assert_eq!(claim.await.unwrap(), 7);
//! assert_eq!(queue.try_get(), Some(3));
//! # }
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// The queue was closed while a claim was still waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no more items forthcoming")]
pub struct QueueClosed;

// =============================================================================
// Heap Entry
// =============================================================================

/// An item plus its insertion sequence number.
///
/// Ordering is reversed so that `BinaryHeap` (a max-heap) pops the smallest
/// item first, and among equal items the one with the lowest sequence.
struct Entry<T> {
    item: T,
    sequence: u64,
}

impl<T: Ord> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for Entry<T> {}

impl<T: Ord> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .item
            .cmp(&self.item)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

// =============================================================================
// Claim
// =============================================================================

/// Pending result of [`PriorityQueue::get`].
///
/// Resolves with the item handed to this claim, or [`QueueClosed`] if the
/// queue was closed first.
#[derive(Debug)]
pub struct Claim<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Claim<T> {
    type Output = Result<T, QueueClosed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.map_err(|_| QueueClosed))
    }
}

// =============================================================================
// Priority Queue
// =============================================================================

/// Min-priority queue, FIFO among equal items.
pub struct PriorityQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    waiters: VecDeque<oneshot::Sender<T>>,
    next_sequence: u64,
}

impl<T: Ord> PriorityQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            waiters: VecDeque::new(),
            next_sequence: 0,
        }
    }

    /// Adds an item, handing it straight to the oldest live waiter if any.
    pub fn put(&mut self, item: T) {
        let mut item = item;
        // Waiters only exist while the heap is empty, so the new item is
        // necessarily the smallest one available.
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return,
                Err(returned) => item = returned,
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Entry { item, sequence });
    }

    /// Claims the smallest item, now or when one is put.
    pub fn get(&mut self) -> Claim<T> {
        let (tx, rx) = oneshot::channel();
        match self.heap.pop() {
            Some(entry) => {
                // The receiver is alive, so this cannot fail.
                let _ = tx.send(entry.item);
            }
            None => self.waiters.push_back(tx),
        }
        Claim { rx }
    }

    /// Removes and returns the smallest item without waiting.
    pub fn try_get(&mut self) -> Option<T> {
        self.heap.pop().map(|entry| entry.item)
    }

    /// Returns a reference to the smallest item.
    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|entry| &entry.item)
    }

    /// Removes every queued item matching `predicate` and returns them.
    ///
    /// The relative order of the remaining items is unchanged.
    pub fn cancel<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.heap.len());
        for entry in std::mem::take(&mut self.heap).into_vec() {
            if predicate(&entry.item) {
                removed.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.heap = BinaryHeap::from(kept);

        removed.sort_by(|a, b| b.cmp(a));
        removed.into_iter().map(|entry| entry.item).collect()
    }

    /// Fails every waiting claim with [`QueueClosed`] and returns the items
    /// still queued, smallest first.
    pub fn close(&mut self) -> Vec<T> {
        self.waiters.clear();
        let mut remaining = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            remaining.push(entry.item);
        }
        remaining
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of claims waiting for an item, including abandoned ones not yet
    /// skipped by a `put`.
    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }
}

impl<T: Ord> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.heap.len())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}
