//! Broker error types.

use rstomp_protocol::ErrorCode;
use thiserror::Error;

/// Protocol violations detected by the broker. These are reported to the
/// client as ERROR frames; the connection stays open.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("subscription id already in use: {0}")]
    DuplicateSubscription(String),

    #[error("no subscription with id: {0}")]
    UnknownSubscription(String),

    #[error("no pending message with id: {0}")]
    UnknownMessage(String),

    #[error("invalid ack mode: {0}")]
    InvalidAckMode(String),

    #[error("invalid prefetch-count: {0}")]
    InvalidPrefetch(String),

    #[error("no transaction with id: {0}")]
    UnknownTransaction(String),

    #[error("transaction already started: {0}")]
    TransactionExists(String),
}

impl BrokerError {
    /// Returns the error code carried in the ERROR frame.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            BrokerError::DuplicateSubscription(_) => ErrorCode::DuplicateSubscription,
            BrokerError::UnknownSubscription(_) => ErrorCode::UnknownSubscription,
            BrokerError::UnknownMessage(_) => ErrorCode::UnknownMessage,
            BrokerError::InvalidAckMode(_) => ErrorCode::InvalidAckMode,
            BrokerError::InvalidPrefetch(_) => ErrorCode::InvalidAckMode,
            BrokerError::UnknownTransaction(_) => ErrorCode::UnknownTransaction,
            BrokerError::TransactionExists(_) => ErrorCode::TransactionExists,
        }
    }
}
