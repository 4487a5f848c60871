//! # rstomp-buffer
//!
//! Pooled I/O buffers for rstomp.
//!
//! This crate provides:
//! - A shared pool of fixed-size regions, pre-sliced from one slab
//! - Bounds-checked segments with read cursor and valid-byte count
//! - Leak detection through a configurable "pain threshold"

pub mod error;
pub mod pool;
pub mod segment;

pub use error::BufferError;
pub use pool::{BufferPool, PoolConfig, PoolStats};
pub use segment::BufferSegment;

/// Default region size (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of regions carved out of the initial slab.
pub const DEFAULT_PREALLOCATED: usize = 64;

/// Default pain threshold (256 MiB outstanding).
pub const DEFAULT_PAIN_THRESHOLD: usize = 256 * 1024 * 1024;
