//! Live result streams, addressed by id.
//!
//! The registry is an arena: each chunked value or iterator a call produced
//! gets an entry, and the entry's id is the only thing the client ever sees.
//! Entries disappear when exhausted, when they fail, or when the connection
//! that created them goes away.

use super::chunker::ChunkStream;
use crate::universe::ItemIter;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Opaque handle for one registered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(StreamId)
    }
}

/// One server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a registry entry yields.
pub enum Stream {
    Chunks(ChunkStream),
    Items(ItemIter),
}

/// Result of [`StreamRegistry::take`].
pub enum Taken {
    Stream(Stream),
    /// Another pull of the same stream is still running.
    Busy,
    Unknown,
}

enum Slot {
    Idle(Stream),
    Busy,
}

struct Entry {
    owner: ConnectionId,
    slot: Slot,
}

/// Arena of live streams.
///
/// A stream is taken out while one element is produced and put back with
/// [`restore`](StreamRegistry::restore) afterwards, so producing an element
/// never has to happen while the registry is borrowed.
#[derive(Default)]
pub struct StreamRegistry {
    entries: HashMap<StreamId, Entry>,
    next_id: u64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `stream` on behalf of `owner` and returns its id.
    pub fn register(&mut self, owner: ConnectionId, stream: Stream) -> StreamId {
        self.next_id += 1;
        let id = StreamId(self.next_id);
        self.entries.insert(
            id,
            Entry {
                owner,
                slot: Slot::Idle(stream),
            },
        );
        id
    }

    /// Checks a stream out. The entry stays registered, marked busy.
    pub fn take(&mut self, id: StreamId) -> Taken {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Taken::Unknown;
        };
        match std::mem::replace(&mut entry.slot, Slot::Busy) {
            Slot::Idle(stream) => Taken::Stream(stream),
            Slot::Busy => Taken::Busy,
        }
    }

    /// Returns a taken stream. Returns `false` and drops the stream if its
    /// entry was released in the meantime.
    pub fn restore(&mut self, id: StreamId, stream: Stream) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if matches!(entry.slot, Slot::Busy) => {
                entry.slot = Slot::Idle(stream);
                true
            }
            _ => false,
        }
    }

    /// Forgets a stream, busy or not.
    pub fn remove(&mut self, id: StreamId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Drops every stream created by `owner`; returns how many.
    pub fn release_owner(&mut self, owner: ConnectionId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.owner != owner);
        before - self.entries.len()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let busy = self
            .entries
            .values()
            .filter(|entry| matches!(entry.slot, Slot::Busy))
            .count();
        f.debug_struct("StreamRegistry")
            .field("live", &self.entries.len())
            .field("busy", &busy)
            .finish()
    }
}
