//! Append-only byte buffers sliced into size-bounded payloads.

use std::mem;

// Buffer capacity is grown in whole blocks so repeated small items don't
// reallocate on every write.
const BLOCK_LEN: usize = 4096;

/// A per-payload-type byte buffer.
///
/// Serialized items are appended back to back; whenever an item pushes the
/// open chunk past the payload size limit, the chunk is sealed at the
/// previous item boundary and the item starts the next chunk. Flushing
/// detaches the accumulated bytes and boundaries wholesale, so writers can
/// keep appending while the detached payloads are being sent.
pub struct PayloadBuffer {
    buf: Vec<u8>,
    offsets: Vec<usize>,
    items: usize,
    item_start: usize,
}

/// Outcome of committing one serialized item.
#[derive(Debug, Eq, PartialEq)]
pub enum CommitError {
    /// The item alone exceeds the payload size limit; it has been rolled
    /// back and the buffer is exactly as it was before `begin_item`.
    Oversized,
}

impl PayloadBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        PayloadBuffer { buf: Vec::new(), offsets: Vec::new(), items: 0, item_start: 0 }
    }

    /// Number of committed items since the last detach.
    pub fn items(&self) -> usize {
        self.items
    }

    /// Whether any bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    fn last_offset(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Starts a new item, returning the buffer to serialize into.
    ///
    /// Must be paired with [`PayloadBuffer::commit_item`] or
    /// [`PayloadBuffer::abort_item`].
    pub fn begin_item(&mut self) -> &mut Vec<u8> {
        if self.buf.capacity() - self.buf.len() < BLOCK_LEN / 8 {
            self.buf.reserve(BLOCK_LEN);
        }
        self.item_start = self.buf.len();
        &mut self.buf
    }

    /// Rolls back the in-progress item.
    pub fn abort_item(&mut self) {
        self.buf.truncate(self.item_start);
    }

    /// Commits the in-progress item, sealing a chunk boundary if the item
    /// pushed the open chunk past `max_payload_size`.
    ///
    /// Returns the number of bytes the item occupies.
    pub fn commit_item(&mut self, max_payload_size: usize) -> Result<usize, CommitError> {
        let item_len = self.buf.len() - self.item_start;
        if item_len > max_payload_size {
            self.buf.truncate(self.item_start);
            return Err(CommitError::Oversized);
        }

        if self.buf.len() - self.last_offset() > max_payload_size {
            // The previous items fill their chunk; this item opens the next.
            self.offsets.push(self.item_start);
        }

        self.items += 1;
        self.item_start = self.buf.len();
        Ok(item_len)
    }

    /// Detaches all buffered bytes and chunk boundaries, resetting the
    /// buffer for subsequent writes.
    pub fn detach(&mut self) -> DetachedPayloads {
        let detached = DetachedPayloads {
            buf: mem::take(&mut self.buf),
            offsets: mem::take(&mut self.offsets),
        };
        self.items = 0;
        self.item_start = 0;
        detached
    }
}

impl Default for PayloadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The byte sequence detached from a [`PayloadBuffer`] at flush time,
/// sliced into payload-sized chunks.
pub struct DetachedPayloads {
    buf: Vec<u8>,
    offsets: Vec<usize>,
}

impl DetachedPayloads {
    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        if self.buf.is_empty() {
            0
        } else {
            self.offsets.len() + 1
        }
    }

    /// The chunk at `index`, or `None` past the end.
    pub fn chunk(&self, index: usize) -> Option<&[u8]> {
        if index >= self.chunk_count() {
            return None;
        }

        let start = if index == 0 { 0 } else { self.offsets[index - 1] };
        let end = self.offsets.get(index).copied().unwrap_or(self.buf.len());
        Some(&self.buf[start..end])
    }

    /// Iterates over all chunks in append order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        (0..self.chunk_count()).map(move |i| self.chunk(i).unwrap())
    }
}
