//! Buffer error types.

use thiserror::Error;

/// Errors raised by the buffer pool and its segments.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer pool exhausted: {outstanding} bytes outstanding, threshold {threshold} (buffers are probably not being released)")]
    PoolExhausted { outstanding: usize, threshold: usize },

    #[error("segment {0} is not checked out of this pool")]
    NotCheckedOut(u64),

    #[error("segment {segment} belongs to another pool")]
    ForeignSegment { segment: u64 },

    #[error("offset {offset} outside segment bounds [{start}, {end}]")]
    OffsetOutOfRange {
        offset: usize,
        start: usize,
        end: usize,
    },

    #[error("count {count} exceeds segment capacity {capacity}")]
    CountOutOfRange { count: usize, capacity: usize },
}

impl BufferError {
    /// Returns whether this error means the pool refused to hand out memory.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, BufferError::PoolExhausted { .. })
    }
}
