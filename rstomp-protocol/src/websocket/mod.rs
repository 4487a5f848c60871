//! WebSocket transport framing (RFC 6455).
//!
//! STOMP frames travel as text or binary WebSocket messages. The server-side
//! decoder reads the HTTP upgrade request with the same header parser used
//! for STOMP frames, then switches to binary framing on the same stream.

pub mod codec;
pub mod frame;
pub mod handshake;

pub use codec::{Message, MessageAssembler, Role, WebSocketDecoder, WebSocketEncoder, WebSocketEvent};
pub use frame::{apply_mask, Opcode, WebSocketFrame};
pub use handshake::{accept_key, UpgradeRequest, STOMP_SUBPROTOCOLS};
