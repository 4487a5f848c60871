//! Outbound delivery seam between queues and connections.

use rstomp_protocol::Frame;
use thiserror::Error;

/// Why a sink did not take a frame.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The connection is alive but its outbound buffer is full. The queue
    /// keeps the message and retries on the next dispatch.
    #[error("outbound buffer full")]
    Full,

    /// The connection is gone.
    #[error("connection closed")]
    Closed,
}

/// Delivers MESSAGE frames to a connection.
///
/// Implementations must not block: queues call `deliver` while holding
/// their lock.
pub trait MessageSink: Send + Sync {
    /// Hands a frame to the connection.
    fn deliver(&self, frame: Frame) -> Result<(), SinkError>;
}
