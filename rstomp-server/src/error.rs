//! Server error types.

use rstomp_broker::BrokerError;
use rstomp_buffer::BufferError;
use rstomp_protocol::{ErrorCode, ProtocolError, WebSocketError};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WebSocketError),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("{0}")]
    Broker(#[from] BrokerError),

    #[error("unsupported protocol version, supported versions are {0}")]
    UnsupportedProtocol(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("cannot disconnect with open transactions: {0}")]
    TransactionsOpen(String),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::InternalError,
            ServerError::Protocol(ProtocolError::Buffer(e)) | ServerError::Buffer(e)
                if e.is_exhaustion() =>
            {
                ErrorCode::ResourceExhausted
            }
            ServerError::Protocol(_) => ErrorCode::MalformedFrame,
            ServerError::WebSocket(_) => ErrorCode::MalformedFrame,
            ServerError::Buffer(_) => ErrorCode::InternalError,
            ServerError::Broker(e) => e.error_code(),
            ServerError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ServerError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            ServerError::MissingHeader(_) => ErrorCode::MissingHeader,
            ServerError::NotConnected => ErrorCode::NotConnected,
            ServerError::AlreadyConnected => ErrorCode::AlreadyConnected,
            ServerError::AuthFailed(_) => ErrorCode::AuthFailed,
            ServerError::TransactionsOpen(_) => ErrorCode::TransactionsOpen,
            ServerError::ShuttingDown => ErrorCode::InternalError,
            ServerError::TlsConfig(_) => ErrorCode::InternalError,
            ServerError::TlsHandshake(_) => ErrorCode::InternalError,
        }
    }

    /// Returns whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        self.error_code().is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ServerError::MissingHeader("destination").error_code(),
            ErrorCode::MissingHeader
        );
        assert_eq!(
            ServerError::from(BrokerError::UnknownMessage("7".into())).error_code(),
            ErrorCode::UnknownMessage
        );
        assert_eq!(
            ServerError::from(ProtocolError::MalformedFrame("x")).error_code(),
            ErrorCode::MalformedFrame
        );
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let err = ServerError::from(BufferError::PoolExhausted {
            outstanding: 10,
            threshold: 8,
        });
        assert_eq!(err.error_code(), ErrorCode::ResourceExhausted);
        assert!(err.is_fatal());

        assert!(!ServerError::NotConnected.is_fatal());
        assert!(ServerError::from(ProtocolError::InvalidUtf8).is_fatal());
    }
}
