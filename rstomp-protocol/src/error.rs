//! Protocol error types and error codes.

use rstomp_buffer::BufferError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding or encoding STOMP frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("header section too large: {size} bytes (max {max})")]
    HeaderTooLarge { size: usize, max: usize },

    #[error("frame body too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    #[error("expected NUL frame terminator, got {0:#04x}")]
    MissingTerminator(u8),

    #[error("invalid UTF-8 in frame header")]
    InvalidUtf8,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
}

/// Errors raised by the WebSocket codec.
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("invalid upgrade request: {0}")]
    Handshake(String),

    #[error("malformed upgrade request: {0}")]
    HandshakeHeader(#[from] ProtocolError),

    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("reserved bits set without a negotiated extension: {0:#x}")]
    ReservedBits(u8),

    #[error("control frames must not be fragmented")]
    FragmentedControl,

    #[error("control frame payload too large: {0} bytes (max 125)")]
    ControlTooLarge(u64),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("payload length is not minimally encoded")]
    NonMinimalLength,

    #[error("frame must be masked")]
    UnmaskedFrame,

    #[error("frame must not be masked")]
    UnexpectedMask,

    #[error("frame is already masked")]
    AlreadyMasked,

    #[error("frame cut short: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,
}

/// Stable error codes carried in the `code` header of ERROR frames.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    UnsupportedProtocol,
    MalformedFrame,
    UnknownCommand,
    MissingHeader,

    // Session errors
    NotConnected,
    AlreadyConnected,
    AuthFailed,

    // Subscription errors
    DuplicateSubscription,
    UnknownSubscription,
    InvalidAckMode,
    UnknownMessage,

    // Transaction errors
    UnknownTransaction,
    TransactionExists,
    TransactionsOpen,

    // System errors
    ResourceExhausted,
    InternalError,
}

impl ErrorCode {
    /// Returns whether this error terminates the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::MalformedFrame | ErrorCode::ResourceExhausted | ErrorCode::InternalError
        )
    }

    /// Returns the wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::MalformedFrame => "MALFORMED_FRAME",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::MissingHeader => "MISSING_HEADER",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::AlreadyConnected => "ALREADY_CONNECTED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::DuplicateSubscription => "DUPLICATE_SUBSCRIPTION",
            ErrorCode::UnknownSubscription => "UNKNOWN_SUBSCRIPTION",
            ErrorCode::InvalidAckMode => "INVALID_ACK_MODE",
            ErrorCode::UnknownMessage => "UNKNOWN_MESSAGE",
            ErrorCode::UnknownTransaction => "UNKNOWN_TRANSACTION",
            ErrorCode::TransactionExists => "TRANSACTION_EXISTS",
            ErrorCode::TransactionsOpen => "TRANSACTIONS_OPEN",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_fatal() {
        assert!(ErrorCode::MalformedFrame.is_fatal());
        assert!(ErrorCode::ResourceExhausted.is_fatal());
        assert!(ErrorCode::InternalError.is_fatal());

        assert!(!ErrorCode::MissingHeader.is_fatal());
        assert!(!ErrorCode::UnknownCommand.is_fatal());
        assert!(!ErrorCode::DuplicateSubscription.is_fatal());
        assert!(!ErrorCode::UnknownMessage.is_fatal());
        assert!(!ErrorCode::TransactionsOpen.is_fatal());
    }

    #[test]
    fn test_error_code_display_matches_serde() {
        for code in [
            ErrorCode::UnsupportedProtocol,
            ErrorCode::MissingHeader,
            ErrorCode::DuplicateSubscription,
            ErrorCode::TransactionsOpen,
            ErrorCode::ResourceExhausted,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code));
        }

        let parsed: ErrorCode = serde_json::from_str("\"UNKNOWN_MESSAGE\"").unwrap();
        assert_eq!(parsed, ErrorCode::UnknownMessage);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::MissingTerminator(b'X');
        assert!(err.to_string().contains("0x58"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::InvalidContentLength("abc".to_string());
        assert!(err.to_string().contains("abc"));

        let err = WebSocketError::Truncated { needed: 7 };
        assert!(err.to_string().contains('7'));
    }
}
