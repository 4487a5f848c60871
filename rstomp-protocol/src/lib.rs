//! # rstomp-protocol
//!
//! Wire protocol implementation for rstomp.
//!
//! This crate provides:
//! - A resumable STOMP header parser and frame decoder/encoder
//! - Case-insensitive, first-write-wins frame headers
//! - WebSocket framing (RFC 6455) with upgrade handshake, masking and fragmentation
//! - Pluggable message body serialization
//! - Error codes and protocol constants

pub mod command;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod headers;
pub mod parser;
pub mod serializer;
pub mod websocket;

pub use command::Command;
pub use decoder::FrameDecoder;
pub use encoder::FrameEncoder;
pub use error::{ErrorCode, ProtocolError, WebSocketError};
pub use frame::Frame;
pub use headers::Headers;
pub use parser::{HeaderHandler, HeaderParser};
pub use serializer::{JsonSerializer, MessageSerializer};

/// STOMP protocol versions supported by this implementation, lowest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0", "1.1", "1.2"];

/// Default port for the STOMP listener.
pub const DEFAULT_PORT: u16 = 61613;

/// Default port for the STOMP-over-WebSocket listener.
pub const DEFAULT_WEBSOCKET_PORT: u16 = 61614;

/// Maximum size of a frame's header section (64 KiB).
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum frame body size (16 MiB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Byte terminating every frame.
pub const FRAME_TERMINATOR: u8 = 0;
