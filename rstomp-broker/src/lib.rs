//! # rstomp-broker
//!
//! Message broker engine for rstomp.
//!
//! This crate provides:
//! - Named FIFO queues with round-robin delivery to subscribers
//! - Subscriptions with auto, client and client-individual acknowledgement
//! - Per-session transactions that buffer SEND/ACK/NACK until COMMIT
//! - A shared queue registry

pub mod error;
pub mod queue;
pub mod registry;
pub mod sink;
pub mod subscription;
pub mod transaction;

pub use error::BrokerError;
pub use queue::{Queue, QueueStats, QueuedMessage};
pub use registry::{QueueRegistry, QueueRepository};
pub use sink::{MessageSink, SinkError};
pub use subscription::{AckMode, Subscription, SubscriptionSet};
pub use transaction::{Transaction, TransactionAction, TransactionManager};
