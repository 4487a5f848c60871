//! Client error types.

use rstomp_protocol::headers::header;
use rstomp_protocol::Frame;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] rstomp_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server error: {code} - {message}")]
    ServerError { code: String, message: String },

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
}

impl ClientError {
    /// Builds a server error from an ERROR frame.
    pub fn from_error_frame(frame: &Frame) -> Self {
        ClientError::ServerError {
            code: frame.header(header::CODE).unwrap_or("UNKNOWN").to_string(),
            message: frame
                .header(header::MESSAGE)
                .or_else(|| frame.body_str())
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Returns the broker's error code, if the broker rejected the request.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::ServerError { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }
}
