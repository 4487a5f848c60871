//! WebSocket frames (RFC 6455 section 5.2).
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |                  Masking-key, if MASK set to 1                |
//! +---------------------------------------------------------------+
//! |                         Payload Data                          |
//! +---------------------------------------------------------------+
//! ```

use crate::error::WebSocketError;
use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload that fits the 7-bit length field.
pub const MAX_INLINE_LEN: usize = 125;

/// Largest payload that fits the 16-bit extended length.
pub const MAX_U16_LEN: usize = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, WebSocketError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WebSocketError::InvalidOpcode(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Control frames: close, ping and pong.
    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// XORs `payload` with the repeating 4-byte key. Applying it twice restores
/// the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, b) in payload.iter_mut().enumerate() {
        *b ^= key[i % 4];
    }
}

/// Returns the size of the frame header for a payload length.
pub fn header_len(payload_len: usize, masked: bool) -> usize {
    let ext = match payload_len {
        0..=MAX_INLINE_LEN => 0,
        126..=MAX_U16_LEN => 2,
        _ => 8,
    };
    2 + ext + if masked { 4 } else { 0 }
}

/// One WebSocket frame.
///
/// The masking key is present exactly when the payload is masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketFrame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    masking_key: Option<[u8; 4]>,
    pub payload: BytesMut,
}

impl WebSocketFrame {
    /// Creates a final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl AsRef<[u8]>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masking_key: None,
            payload: BytesMut::from(payload.as_ref()),
        }
    }

    /// Wraps a payload exactly as received; `masking_key` is the key the
    /// payload is still masked with.
    pub(crate) fn from_wire(
        fin: bool,
        rsv: u8,
        opcode: Opcode,
        masking_key: Option<[u8; 4]>,
        payload: BytesMut,
    ) -> Self {
        Self {
            fin,
            rsv1: rsv & 0b100 != 0,
            rsv2: rsv & 0b010 != 0,
            rsv3: rsv & 0b001 != 0,
            opcode,
            masking_key,
            payload,
        }
    }

    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Creates a close frame with a status code and reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(Opcode::Close, payload)
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn is_masked(&self) -> bool {
        self.masking_key.is_some()
    }

    pub fn masking_key(&self) -> Option<[u8; 4]> {
        self.masking_key
    }

    /// Masks the payload with `key`.
    pub fn mask(&mut self, key: [u8; 4]) -> Result<(), WebSocketError> {
        if self.masking_key.is_some() {
            return Err(WebSocketError::AlreadyMasked);
        }
        apply_mask(&mut self.payload, key);
        self.masking_key = Some(key);
        Ok(())
    }

    /// Masks the payload with `key`, replacing any mask already applied.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.unmask();
        apply_mask(&mut self.payload, key);
        self.masking_key = Some(key);
        self
    }

    /// Removes the mask and clears the key. Does nothing on an unmasked frame.
    pub fn unmask(&mut self) {
        if let Some(key) = self.masking_key.take() {
            apply_mask(&mut self.payload, key);
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Returns the status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.is_masked() || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    pub fn encoded_len(&self) -> usize {
        header_len(self.payload.len(), self.is_masked()) + self.payload.len()
    }

    /// Writes the frame using the shortest length encoding.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        let mask_bit = if self.is_masked() { 0x80 } else { 0 };
        let len = self.payload.len();

        buf.reserve(self.encoded_len());
        buf.put_u8(b0);
        match len {
            0..=MAX_INLINE_LEN => buf.put_u8(mask_bit | len as u8),
            126..=MAX_U16_LEN => {
                buf.put_u8(mask_bit | 126);
                buf.put_u16(len as u16);
            }
            _ => {
                buf.put_u8(mask_bit | 127);
                buf.put_u64(len as u64);
            }
        }
        if let Some(key) = self.masking_key {
            buf.put_slice(&key);
        }
        buf.put_slice(&self.payload);
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Consumes the frame, returning the payload. The frame is unmasked first.
    pub fn into_payload(mut self) -> Bytes {
        self.unmask();
        self.payload.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_length_encoding_inline() {
        let encoded = WebSocketFrame::binary([7u8]).encode();
        assert_eq!(&encoded[..], &[0x82, 0x01, 0x07]);
    }

    #[test]
    fn test_length_encoding_u16() {
        let encoded = WebSocketFrame::binary(vec![0u8; 126]).encode();
        assert_eq!(encoded[1], 126);
        assert_eq!(&encoded[2..4], &126u16.to_be_bytes());
        assert_eq!(encoded.len(), 4 + 126);

        let encoded = WebSocketFrame::binary(vec![0u8; 65535]).encode();
        assert_eq!(encoded[1], 126);
        assert_eq!(&encoded[2..4], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_length_encoding_u64() {
        let encoded = WebSocketFrame::binary(vec![0u8; 65536]).encode();
        assert_eq!(encoded[1], 127);
        assert_eq!(&encoded[2..10], &65536u64.to_be_bytes());
        assert_eq!(encoded.len(), 10 + 65536);
    }

    #[test]
    fn test_masked_header() {
        let mut frame = WebSocketFrame::text("Hello");
        frame.mask([0x37, 0xfa, 0x21, 0x3d]).unwrap();
        // RFC 6455 section 5.7 example
        assert_eq!(
            &frame.encode()[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_unmask_twice_is_noop() {
        let mut frame = WebSocketFrame::text("payload");
        frame.mask([1, 2, 3, 4]).unwrap();
        assert!(frame.is_masked());

        frame.unmask();
        assert!(!frame.is_masked());
        assert_eq!(frame.masking_key(), None);
        assert_eq!(&frame.payload[..], b"payload");

        frame.unmask();
        assert_eq!(&frame.payload[..], b"payload");
    }

    #[test]
    fn test_mask_twice_fails() {
        let mut frame = WebSocketFrame::binary([1, 2, 3]);
        frame.mask([9, 9, 9, 9]).unwrap();
        assert!(matches!(
            frame.mask([9, 9, 9, 9]),
            Err(WebSocketError::AlreadyMasked)
        ));
    }

    #[test]
    fn test_with_mask_replaces_existing_mask() {
        let mut frame = WebSocketFrame::binary([1, 2, 3]);
        frame.mask([9, 9, 9, 9]).unwrap();
        let frame = frame.with_mask([0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(frame.masking_key(), Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(&frame.into_payload()[..], &[1, 2, 3]);
    }

    #[test]
    fn test_close_frame() {
        let frame = WebSocketFrame::close(1000, "bye");
        assert_eq!(frame.close_code(), Some(1000));
        assert_eq!(&frame.payload[2..], b"bye");
        assert!(Opcode::Close.is_control());
        assert!(!Opcode::Text.is_control());
    }

    #[test]
    fn test_invalid_opcode() {
        assert!(matches!(
            Opcode::from_u8(0x3),
            Err(WebSocketError::InvalidOpcode(0x3))
        ));
    }

    proptest! {
        #[test]
        fn prop_mask_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512), key in any::<[u8; 4]>()) {
            let mut frame = WebSocketFrame::binary(&payload);
            frame.mask(key).unwrap();
            frame.unmask();
            prop_assert_eq!(&frame.payload[..], &payload[..]);

            let mut raw = payload.clone();
            apply_mask(&mut raw, key);
            apply_mask(&mut raw, key);
            prop_assert_eq!(raw, payload);
        }
    }
}
