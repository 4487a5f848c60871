//! Shared pool of fixed-size buffer regions.
//!
//! The pool carves `preallocated` regions out of a single slab at startup and
//! allocates further regions individually once the slab is used up. Released
//! regions go back on a free list and are reused.
//!
//! Every checkout adds the region size to a running total of outstanding
//! bytes. When that total would pass the pain threshold, checkout fails with
//! [`BufferError::PoolExhausted`] instead of growing without bound: in
//! practice that only happens when a caller forgets to release buffers.

use crate::error::BufferError;
use crate::segment::BufferSegment;
use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_PAIN_THRESHOLD, DEFAULT_PREALLOCATED};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Pool IDs start at 1; 0 marks standalone segments.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Size of each region in bytes.
    pub buffer_size: usize,
    /// Number of regions sliced from the initial slab.
    pub preallocated: usize,
    /// Maximum outstanding bytes before checkout fails.
    pub pain_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            preallocated: DEFAULT_PREALLOCATED,
            pain_threshold: DEFAULT_PAIN_THRESHOLD,
        }
    }
}

impl PoolConfig {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..Default::default()
        }
    }

    pub fn with_preallocated(mut self, count: usize) -> Self {
        self.preallocated = count;
        self
    }

    pub fn with_pain_threshold(mut self, bytes: usize) -> Self {
        self.pain_threshold = bytes;
        self
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub buffer_size: usize,
    pub regions_allocated: usize,
    pub free_regions: usize,
    pub checked_out: usize,
    pub outstanding_bytes: usize,
    pub pain_threshold: usize,
}

struct FreeRegion {
    id: u64,
    bytes: BytesMut,
    start_offset: usize,
}

/// A thread-safe pool of reusable buffer regions.
pub struct BufferPool {
    id: u64,
    config: PoolConfig,
    free: Mutex<Vec<FreeRegion>>,
    checked_out: Mutex<HashSet<u64>>,
    outstanding: AtomicUsize,
    regions_allocated: AtomicUsize,
    next_region_id: AtomicU64,
}

impl BufferPool {
    /// Creates a pool and slices its preallocated regions.
    pub fn new(config: PoolConfig) -> Self {
        let mut slab = BytesMut::zeroed(config.buffer_size * config.preallocated);
        let mut free = Vec::with_capacity(config.preallocated);
        for i in 0..config.preallocated {
            free.push(FreeRegion {
                id: i as u64 + 1,
                bytes: slab.split_to(config.buffer_size),
                start_offset: i * config.buffer_size,
            });
        }
        // pop() hands out the lowest offsets first
        free.reverse();

        tracing::debug!(
            "Buffer pool created: {} x {} bytes, pain threshold {} bytes",
            config.preallocated,
            config.buffer_size,
            config.pain_threshold
        );

        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            regions_allocated: AtomicUsize::new(config.preallocated),
            next_region_id: AtomicU64::new(config.preallocated as u64 + 1),
            free: Mutex::new(free),
            checked_out: Mutex::new(HashSet::new()),
            outstanding: AtomicUsize::new(0),
            config,
        }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the region size.
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Hands out a segment, allocating a new region if the free list is empty.
    pub fn checkout(&self) -> Result<BufferSegment, BufferError> {
        let size = self.config.buffer_size;
        let previous = self.outstanding.fetch_add(size, Ordering::AcqRel);
        if previous + size > self.config.pain_threshold {
            self.outstanding.fetch_sub(size, Ordering::AcqRel);
            tracing::error!(
                "Buffer pool exhausted: {} bytes outstanding (threshold {})",
                previous,
                self.config.pain_threshold
            );
            return Err(BufferError::PoolExhausted {
                outstanding: previous,
                threshold: self.config.pain_threshold,
            });
        }

        let region = self.free.lock().pop();
        let region = match region {
            Some(region) => region,
            None => {
                self.regions_allocated.fetch_add(1, Ordering::Relaxed);
                FreeRegion {
                    id: self.next_region_id.fetch_add(1, Ordering::Relaxed),
                    bytes: BytesMut::zeroed(size),
                    start_offset: 0,
                }
            }
        };

        self.checked_out.lock().insert(region.id);
        Ok(BufferSegment::from_region(
            region.id,
            self.id,
            region.bytes,
            region.start_offset,
        ))
    }

    /// Returns a segment to the pool.
    ///
    /// Fails if the segment came from another pool or is not currently
    /// checked out.
    pub fn release(&self, segment: BufferSegment) -> Result<(), BufferError> {
        if segment.pool_id() != self.id {
            return Err(BufferError::ForeignSegment {
                segment: segment.id(),
            });
        }
        if !self.checked_out.lock().remove(&segment.id()) {
            return Err(BufferError::NotCheckedOut(segment.id()));
        }

        let (id, mut bytes, start_offset) = segment.into_region();
        // Regions are always handed out at full length.
        bytes.resize(self.config.buffer_size, 0);
        self.free.lock().push(FreeRegion {
            id,
            bytes,
            start_offset,
        });
        self.outstanding
            .fetch_sub(self.config.buffer_size, Ordering::AcqRel);
        Ok(())
    }

    /// Returns the number of bytes currently checked out.
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Returns pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buffer_size: self.config.buffer_size,
            regions_allocated: self.regions_allocated.load(Ordering::Relaxed),
            free_regions: self.free.lock().len(),
            checked_out: self.checked_out.lock().len(),
            outstanding_bytes: self.outstanding_bytes(),
            pain_threshold: self.config.pain_threshold,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("outstanding", &self.outstanding_bytes())
            .finish()
    }
}
