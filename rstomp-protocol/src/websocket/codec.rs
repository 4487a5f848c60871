//! Streaming WebSocket decoder, fragmenting encoder and message reassembly.

use super::frame::{Opcode, WebSocketFrame, MAX_INLINE_LEN, MAX_U16_LEN};
use super::handshake::UpgradeRequest;
use crate::error::WebSocketError;
use crate::parser::HeaderParser;
use bytes::{Buf, Bytes, BytesMut};

/// Default largest accepted payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Largest accepted upgrade request.
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Which end of the connection the codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Receives masked frames from clients.
    Server,
    /// Receives unmasked frames from a server.
    Client,
}

/// Output of [`WebSocketDecoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketEvent {
    Upgrade(UpgradeRequest),
    Frame(WebSocketFrame),
}

#[derive(Debug, Clone, Copy)]
struct Head {
    fin: bool,
    rsv: u8,
    opcode: Opcode,
    masked: bool,
}

/// The first two bytes of a frame, not yet validated.
#[derive(Debug, Clone, Copy)]
struct RawHead {
    b0: u8,
    b1: u8,
}

impl RawHead {
    fn masked(&self) -> bool {
        self.b1 & 0x80 != 0
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Handshake,
    Header,
    ExtendedLength { raw: RawHead, width: usize },
    MaskingKey { head: Head, len: usize },
    Payload { head: Head, len: usize, key: Option<[u8; 4]> },
    /// Skipping the rest of a rejected frame.
    Discard { remaining: u64 },
}

/// Decodes a byte stream into an optional upgrade request followed by frames.
#[derive(Debug)]
pub struct WebSocketDecoder {
    role: Role,
    buffer: BytesMut,
    state: State,
    handshake: HeaderParser,
    request: UpgradeRequest,
    max_payload: u64,
}

impl WebSocketDecoder {
    /// Server-side decoder that reads the upgrade request first.
    pub fn server() -> Self {
        Self::new(Role::Server, true)
    }

    /// Client-side decoder that starts directly with frames.
    pub fn client() -> Self {
        Self::new(Role::Client, false)
    }

    pub fn new(role: Role, expect_handshake: bool) -> Self {
        Self {
            role,
            buffer: BytesMut::with_capacity(8192),
            state: if expect_handshake {
                State::Handshake
            } else {
                State::Header
            },
            handshake: HeaderParser::new(MAX_HANDSHAKE_SIZE),
            request: UpgradeRequest::default(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_max_payload(mut self, max: u64) -> Self {
        self.max_payload = max;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of buffered, undecoded bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether the upgrade request has been read.
    pub fn is_upgraded(&self) -> bool {
        !matches!(self.state, State::Handshake)
    }

    /// Decodes the next event from the buffered bytes.
    ///
    /// A rejected frame is reported once; its remaining bytes are skipped
    /// and frames buffered behind it still decode. A failed upgrade request
    /// drops all buffered input.
    pub fn decode(&mut self) -> Result<Option<WebSocketEvent>, WebSocketError> {
        let result = self.decode_inner();
        if result.is_err() && !self.is_upgraded() {
            self.buffer.clear();
            self.handshake.reset();
            self.request = UpgradeRequest::default();
        }
        result
    }

    /// Decodes at end of stream: a partially buffered frame is an error.
    pub fn decode_eof(&mut self) -> Result<Option<WebSocketEvent>, WebSocketError> {
        if let Some(event) = self.decode()? {
            return Ok(Some(event));
        }
        let needed = self.needed();
        if needed == 0 {
            return Ok(None);
        }
        self.buffer.clear();
        if self.is_upgraded() {
            self.state = State::Header;
        }
        Err(WebSocketError::Truncated { needed })
    }

    fn needed(&self) -> usize {
        let have = self.buffer.len();
        match self.state {
            State::Handshake => usize::from(!self.handshake.is_idle() || have > 0),
            State::Header if have == 0 => 0,
            State::Header => 2 - have,
            State::ExtendedLength { width, .. } => width - have,
            State::MaskingKey { .. } => 4 - have,
            State::Payload { len, .. } => len - have,
            State::Discard { .. } => 0,
        }
    }

    fn decode_inner(&mut self) -> Result<Option<WebSocketEvent>, WebSocketError> {
        loop {
            match self.state {
                State::Handshake => {
                    match self.handshake.parse(&self.buffer[..], &mut self.request)? {
                        Some(n) => {
                            self.buffer.advance(n);
                            self.state = State::Header;
                            let request = std::mem::take(&mut self.request);
                            return Ok(Some(WebSocketEvent::Upgrade(request)));
                        }
                        None => {
                            self.buffer.clear();
                            return Ok(None);
                        }
                    }
                }
                State::Header => {
                    if self.buffer.len() < 2 {
                        return Ok(None);
                    }
                    let raw = RawHead {
                        b0: self.buffer.get_u8(),
                        b1: self.buffer.get_u8(),
                    };
                    match raw.b1 & 0x7F {
                        126 => self.state = State::ExtendedLength { raw, width: 2 },
                        127 => self.state = State::ExtendedLength { raw, width: 8 },
                        len => self.start_payload(raw, u64::from(len), true)?,
                    }
                }
                State::ExtendedLength { raw, width } => {
                    if self.buffer.len() < width {
                        return Ok(None);
                    }
                    let len = if width == 2 {
                        u64::from(self.buffer.get_u16())
                    } else {
                        self.buffer.get_u64()
                    };
                    let minimal = if width == 2 {
                        len > MAX_INLINE_LEN as u64
                    } else {
                        len > MAX_U16_LEN as u64
                    };
                    self.start_payload(raw, len, minimal)?;
                }
                State::MaskingKey { head, len } => {
                    if self.buffer.len() < 4 {
                        return Ok(None);
                    }
                    let mut key = [0u8; 4];
                    self.buffer.copy_to_slice(&mut key);
                    self.state = State::Payload {
                        head,
                        len,
                        key: Some(key),
                    };
                }
                State::Payload { head, len, key } => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(len);
                    self.state = State::Header;
                    let frame =
                        WebSocketFrame::from_wire(head.fin, head.rsv, head.opcode, key, payload);
                    return Ok(Some(WebSocketEvent::Frame(frame)));
                }
                State::Discard { remaining } => {
                    let n = usize::try_from(remaining)
                        .map_or(self.buffer.len(), |r| r.min(self.buffer.len()));
                    self.buffer.advance(n);
                    let remaining = remaining - n as u64;
                    if remaining > 0 {
                        self.state = State::Discard { remaining };
                        return Ok(None);
                    }
                    self.state = State::Header;
                }
            }
        }
    }

    /// Validates a frame once its payload length is known. A rejected frame
    /// moves the decoder to skip its masking key and payload.
    fn start_payload(&mut self, raw: RawHead, len: u64, minimal: bool) -> Result<(), WebSocketError> {
        match self.check(raw, len, minimal) {
            Ok((head, len)) => {
                self.state = if head.masked {
                    State::MaskingKey { head, len }
                } else {
                    State::Payload {
                        head,
                        len,
                        key: None,
                    }
                };
                Ok(())
            }
            Err(e) => {
                let key_len = if raw.masked() { 4 } else { 0 };
                self.state = State::Discard {
                    remaining: len.saturating_add(key_len),
                };
                Err(e)
            }
        }
    }

    fn check(&self, raw: RawHead, len: u64, minimal: bool) -> Result<(Head, usize), WebSocketError> {
        let rsv = (raw.b0 >> 4) & 0x07;
        if rsv != 0 {
            return Err(WebSocketError::ReservedBits(rsv));
        }
        let head = Head {
            fin: raw.b0 & 0x80 != 0,
            rsv,
            opcode: Opcode::from_u8(raw.b0 & 0x0F)?,
            masked: raw.masked(),
        };
        if head.opcode.is_control() {
            if !head.fin {
                return Err(WebSocketError::FragmentedControl);
            }
            if len > MAX_INLINE_LEN as u64 {
                return Err(WebSocketError::ControlTooLarge(len));
            }
        }
        if !minimal {
            return Err(WebSocketError::NonMinimalLength);
        }
        match (self.role, head.masked) {
            (Role::Server, false) => return Err(WebSocketError::UnmaskedFrame),
            (Role::Client, true) => return Err(WebSocketError::UnexpectedMask),
            _ => {}
        }
        if len > self.max_payload {
            return Err(WebSocketError::PayloadTooLarge {
                size: len,
                max: self.max_payload,
            });
        }
        let len = usize::try_from(len).map_err(|_| WebSocketError::PayloadTooLarge {
            size: len,
            max: self.max_payload,
        })?;
        Ok((head, len))
    }
}

/// Encodes messages, splitting payloads larger than the fragment size.
#[derive(Debug, Clone)]
pub struct WebSocketEncoder {
    fragment_size: usize,
    masking_key: Option<[u8; 4]>,
}

impl WebSocketEncoder {
    pub fn new(fragment_size: usize) -> Self {
        Self {
            fragment_size: fragment_size.max(1),
            masking_key: None,
        }
    }

    /// Masks every outgoing frame with `key` (client side).
    pub fn with_masking_key(mut self, key: [u8; 4]) -> Self {
        self.masking_key = Some(key);
        self
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Splits a message into frames.
    ///
    /// The first frame carries `opcode`, later ones are continuations, and
    /// only the last has `fin` set. Control frames are never split.
    pub fn fragment(&self, opcode: Opcode, payload: &[u8]) -> Vec<WebSocketFrame> {
        if opcode.is_control() || payload.len() <= self.fragment_size {
            return vec![self.finish(WebSocketFrame::new(opcode, payload))];
        }
        let count = payload.len().div_ceil(self.fragment_size);
        payload
            .chunks(self.fragment_size)
            .enumerate()
            .map(|(i, chunk)| {
                let op = if i == 0 { opcode } else { Opcode::Continuation };
                self.finish(WebSocketFrame::new(op, chunk).with_fin(i + 1 == count))
            })
            .collect()
    }

    fn finish(&self, frame: WebSocketFrame) -> WebSocketFrame {
        match self.masking_key {
            Some(key) => frame.with_mask(key),
            None => frame,
        }
    }

    /// Encodes a message into `buf` and returns the number of frames written.
    pub fn encode(&self, opcode: Opcode, payload: &[u8], buf: &mut BytesMut) -> usize {
        let frames = self.fragment(opcode, payload);
        for frame in &frames {
            frame.encode_into(buf);
        }
        frames.len()
    }
}

/// A complete application or control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<u16>),
}

/// Reassembles fragmented messages. Control frames may arrive between
/// fragments and are passed through immediately.
#[derive(Debug)]
pub struct MessageAssembler {
    opcode: Option<Opcode>,
    buffer: BytesMut,
    max_size: u64,
}

impl MessageAssembler {
    pub fn new(max_size: u64) -> Self {
        Self {
            opcode: None,
            buffer: BytesMut::new(),
            max_size,
        }
    }

    /// Returns whether a fragmented message is in progress.
    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    /// Adds a frame; returns a message when one completes.
    pub fn push(&mut self, mut frame: WebSocketFrame) -> Result<Option<Message>, WebSocketError> {
        frame.unmask();
        match frame.opcode {
            Opcode::Ping => Ok(Some(Message::Ping(frame.payload.freeze()))),
            Opcode::Pong => Ok(Some(Message::Pong(frame.payload.freeze()))),
            Opcode::Close => Ok(Some(Message::Close(frame.close_code()))),
            Opcode::Continuation => {
                let opcode = self.opcode.ok_or(WebSocketError::UnexpectedContinuation)?;
                self.append(&frame.payload)?;
                if !frame.fin {
                    return Ok(None);
                }
                self.opcode = None;
                let payload = self.buffer.split().freeze();
                Ok(Some(data_message(opcode, payload)))
            }
            Opcode::Text | Opcode::Binary => {
                if self.opcode.is_some() {
                    return Err(WebSocketError::InterleavedMessage);
                }
                if frame.fin {
                    return Ok(Some(data_message(frame.opcode, frame.payload.freeze())));
                }
                self.append(&frame.payload)?;
                self.opcode = Some(frame.opcode);
                Ok(None)
            }
        }
    }

    fn append(&mut self, data: &[u8]) -> Result<(), WebSocketError> {
        let size = (self.buffer.len() + data.len()) as u64;
        if size > self.max_size {
            self.opcode = None;
            self.buffer.clear();
            return Err(WebSocketError::PayloadTooLarge {
                size,
                max: self.max_size,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

fn data_message(opcode: Opcode, payload: Bytes) -> Message {
    if opcode == Opcode::Text {
        Message::Text(payload)
    } else {
        Message::Binary(payload)
    }
}
