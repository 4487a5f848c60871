//! Bounds-checked views over pool-owned memory.
//!
//! A segment covers one region of the pool:
//!
//! ```text
//! start_offset          offset                 start_offset+count   start_offset+capacity
//! |---- consumed -------|------ unread --------|------ writable --------|
//!                       |------------------ unallocated ----------------|
//! ```
//!
//! `offset` is the read cursor; `count` is the number of valid bytes written
//! into the region. Offsets are absolute so that a segment carved from the
//! middle of the pool slab reports its real position.

use crate::error::BufferError;
use bytes::BytesMut;

/// A contiguous byte region checked out of a [`BufferPool`](crate::BufferPool).
#[derive(Debug)]
pub struct BufferSegment {
    id: u64,
    pool_id: u64,
    region: BytesMut,
    start_offset: usize,
    offset: usize,
    count: usize,
}

impl BufferSegment {
    pub(crate) fn from_region(id: u64, pool_id: u64, region: BytesMut, start_offset: usize) -> Self {
        Self {
            id,
            pool_id,
            region,
            start_offset,
            offset: start_offset,
            count: 0,
        }
    }

    /// Creates a segment that does not belong to any pool.
    ///
    /// Useful for clients and tests that want the segment API without a pool.
    /// Releasing it into a pool is rejected.
    pub fn standalone(capacity: usize) -> Self {
        Self::from_region(0, 0, BytesMut::zeroed(capacity), 0)
    }

    pub(crate) fn into_region(self) -> (u64, BytesMut, usize) {
        (self.id, self.region, self.start_offset)
    }

    /// Returns the segment ID (stable for the lifetime of the underlying region).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Returns the size of the region.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Returns the fixed start of the region.
    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    /// Returns the current read cursor.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the number of valid bytes in the region.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Unread bytes between the cursor and the end of the valid data.
    pub fn bytes_left(&self) -> usize {
        (self.start_offset + self.count).saturating_sub(self.offset)
    }

    /// Capacity from the read cursor to the end of the region: the most a
    /// frame starting at the cursor can occupy.
    pub fn unallocated_bytes(&self) -> usize {
        self.capacity() - self.relative_offset()
    }

    /// Free capacity after the valid data, available for the next receive.
    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.count
    }

    /// Returns whether no more bytes can be received without compacting.
    pub fn is_full(&self) -> bool {
        self.writable_bytes() == 0
    }

    fn relative_offset(&self) -> usize {
        self.offset - self.start_offset
    }

    /// Returns the unread bytes.
    pub fn unread(&self) -> &[u8] {
        &self.region[self.relative_offset()..self.count]
    }

    /// Returns all valid bytes, including already consumed ones.
    pub fn as_slice(&self) -> &[u8] {
        &self.region[..self.count]
    }

    /// Returns the free tail of the region for a transport to fill.
    ///
    /// Call [`commit`](Self::commit) with the number of bytes written.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        let count = self.count;
        &mut self.region[count..]
    }

    /// Marks `n` more bytes as valid after a transport wrote into
    /// [`unfilled_mut`](Self::unfilled_mut).
    pub fn commit(&mut self, n: usize) -> Result<(), BufferError> {
        self.set_count(self.count + n)
    }

    /// Sets the number of valid bytes.
    pub fn set_count(&mut self, count: usize) -> Result<(), BufferError> {
        if count > self.capacity() {
            return Err(BufferError::CountOutOfRange {
                count,
                capacity: self.capacity(),
            });
        }
        self.count = count;
        if self.offset > self.start_offset + count {
            self.offset = self.start_offset + count;
        }
        Ok(())
    }

    /// Moves the read cursor forward by `n` bytes.
    pub fn advance(&mut self, n: usize) -> Result<(), BufferError> {
        self.set_offset(self.offset + n)
    }

    /// Moves the read cursor to an absolute offset.
    ///
    /// The cursor may not pass the end of the valid data.
    pub fn set_offset(&mut self, offset: usize) -> Result<(), BufferError> {
        let end = self.start_offset + self.count;
        if offset < self.start_offset || offset > end {
            return Err(BufferError::OffsetOutOfRange {
                offset,
                start: self.start_offset,
                end,
            });
        }
        self.offset = offset;
        Ok(())
    }

    /// Appends as much of `data` as fits and returns the number of bytes copied.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.writable_bytes());
        let count = self.count;
        self.region[count..count + n].copy_from_slice(&data[..n]);
        self.count += n;
        n
    }

    /// Moves unread bytes to the start of the region, freeing the consumed prefix.
    pub fn compact(&mut self) {
        let rel = self.relative_offset();
        if rel == 0 {
            return;
        }
        let left = self.bytes_left();
        self.region.copy_within(rel..self.count, 0);
        self.count = left;
        self.offset = self.start_offset;
    }

    /// Resets the cursor and discards all valid bytes.
    pub fn reset(&mut self) {
        self.offset = self.start_offset;
        self.count = 0;
    }
}
