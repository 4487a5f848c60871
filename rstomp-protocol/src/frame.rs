//! STOMP text frames.
//!
//! Wire layout:
//!
//! ```text
//! COMMAND\n
//! name:value\n
//! ...
//! \n
//! body\0
//! ```
//!
//! A frame with an empty name is a heart-beat and is written as a lone EOL.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::headers::{self, header, Headers};
use crate::FRAME_TERMINATOR;
use bytes::{BufMut, Bytes, BytesMut};

/// A decoded or outgoing frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub name: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Frame {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn from_command(command: Command) -> Self {
        Self::new(command.as_str())
    }

    /// Creates a heart-beat frame.
    pub fn heartbeat() -> Self {
        Self::default()
    }

    pub fn is_heartbeat(&self) -> bool {
        self.name.is_empty()
    }

    /// Returns the parsed command, or `None` for unknown names and heart-beats.
    pub fn command(&self) -> Option<Command> {
        Command::parse(&self.name)
    }

    /// Adds a header (first write wins) and returns the frame.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Sets the body and a matching `content-length` header.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.set_body(body);
        self
    }

    /// Sets the body and a matching `content-length` header.
    ///
    /// An empty body is stored as `None`, the way the decoder reports it.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        self.headers
            .set(header::CONTENT_LENGTH, body.len().to_string());
        self.body = (!body.is_empty()).then_some(body);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns the content length: the explicit header if it parses, else
    /// the body length, else zero.
    pub fn content_length(&self) -> usize {
        if let Ok(Some(len)) = self.declared_content_length() {
            return len;
        }
        self.body.as_ref().map_or(0, |b| b.len())
    }

    /// Returns the `content-length` header, if present.
    pub fn declared_content_length(&self) -> Result<Option<usize>, ProtocolError> {
        match self.headers.get(header::CONTENT_LENGTH) {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| ProtocolError::InvalidContentLength(raw.to_string())),
            None => Ok(None),
        }
    }

    /// Returns the body as UTF-8 text, if any.
    pub fn body_str(&self) -> Option<&str> {
        self.body.as_deref().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns the size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        if self.is_heartbeat() {
            return 1;
        }
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(n, v)| headers::header_len(n, v))
            .sum();
        self.name.len() + 1 + header_bytes + 1 + self.body.as_ref().map_or(0, |b| b.len()) + 1
    }

    /// Encodes the whole frame, terminator included, into a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        if self.is_heartbeat() {
            buf.put_u8(b'\n');
            return buf;
        }
        self.encode_head(&mut buf);
        if let Some(body) = &self.body {
            buf.put_slice(body);
        }
        buf.put_u8(FRAME_TERMINATOR);
        buf
    }

    /// Writes the command line, headers and blank separator line.
    pub fn encode_head(&self, buf: &mut BytesMut) {
        buf.put_slice(self.name.as_bytes());
        buf.put_u8(b'\n');
        for (name, value) in self.headers.iter() {
            headers::put_header(buf, name, value);
        }
        buf.put_u8(b'\n');
    }
}
