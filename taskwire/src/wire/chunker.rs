//! Splitting oversized encoded values into bounded chunks.
//!
//! A value whose encoding is larger than the chunk size is not sent in one
//! response. The server registers a [`ChunkStream`] instead and the client
//! pulls it one chunk per request, concatenating until the stream runs dry.

use bytes::Bytes;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 15;

/// Splits `encoded` into slices of at most `chunk_size` bytes.
///
/// A chunk size of zero is treated as one. The slices share `encoded`'s
/// buffer; nothing is copied.
pub fn split(encoded: Bytes, chunk_size: usize) -> ChunkStream {
    ChunkStream {
        remaining: encoded,
        chunk_size: chunk_size.max(1),
    }
}

/// Forward-only iterator over the chunks of one value.
///
/// Holds the unsent tail only; each chunk is released once yielded.
#[derive(Debug)]
pub struct ChunkStream {
    remaining: Bytes,
    chunk_size: usize,
}

impl ChunkStream {
    /// Bytes not yet yielded.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl Iterator for ChunkStream {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.remaining.is_empty() {
            return None;
        }
        let n = self.chunk_size.min(self.remaining.len());
        Some(self.remaining.split_to(n))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.len().div_ceil(self.chunk_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for ChunkStream {}
