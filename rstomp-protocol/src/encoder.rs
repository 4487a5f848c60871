//! Resumable frame encoder.
//!
//! A prepared frame is copied into outgoing segments with [`FrameEncoder::fill`].
//! The transport reports how many bytes actually left with
//! [`FrameEncoder::on_send_completed`]; unsent bytes are written again by the
//! next `fill`. The body is held as shared [`Bytes`] and copied only into the
//! outgoing segment.

use crate::frame::Frame;
use crate::headers::{self, header};
use crate::FRAME_TERMINATOR;
use bytes::{BufMut, Bytes, BytesMut};
use rstomp_buffer::BufferSegment;

/// Encodes one frame at a time into buffer segments.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    head: BytesMut,
    body: Bytes,
    terminator: bool,
    sent: usize,
    total: usize,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts encoding `frame`, discarding anything still unsent.
    ///
    /// A `content-length` header is added when the frame has a body and does
    /// not declare one.
    pub fn prepare(&mut self, frame: &Frame) {
        self.head.clear();
        self.sent = 0;

        if frame.is_heartbeat() {
            self.head.put_u8(b'\n');
            self.body = Bytes::new();
            self.terminator = false;
            self.total = 1;
            return;
        }

        self.head.put_slice(frame.name.as_bytes());
        self.head.put_u8(b'\n');
        for (name, value) in frame.headers.iter() {
            self.put_header(name, value);
        }
        self.body = frame.body.clone().unwrap_or_default();
        if frame.body.is_some() && !frame.headers.contains(header::CONTENT_LENGTH) {
            let len = self.body.len().to_string();
            self.put_header(header::CONTENT_LENGTH, &len);
        }
        self.head.put_u8(b'\n');
        self.terminator = true;
        self.total = self.head.len() + self.body.len() + 1;
    }

    fn put_header(&mut self, name: &str, value: &str) {
        headers::put_header(&mut self.head, name, value);
    }

    /// Copies unsent bytes into the free space of `segment`.
    ///
    /// Returns the number of bytes written. Does not mark them as sent.
    pub fn fill(&self, segment: &mut BufferSegment) -> usize {
        let head_len = self.head.len();
        let body_end = head_len + self.body.len();
        let mut pos = self.sent;
        let mut written = 0;

        if pos < head_len {
            let n = segment.write(&self.head[pos..]);
            pos += n;
            written += n;
            if pos < head_len {
                return written;
            }
        }
        if pos < body_end {
            let n = segment.write(&self.body[pos - head_len..]);
            pos += n;
            written += n;
            if pos < body_end {
                return written;
            }
        }
        if self.terminator && pos == body_end {
            written += segment.write(&[FRAME_TERMINATOR]);
        }
        written
    }

    /// Records that `n` bytes were sent.
    ///
    /// Returns `true` once every byte of the frame, terminator included, has
    /// been sent.
    pub fn on_send_completed(&mut self, n: usize) -> bool {
        self.sent = (self.sent + n).min(self.total);
        if self.sent < self.total {
            return false;
        }
        self.head.clear();
        self.body = Bytes::new();
        self.terminator = false;
        self.sent = 0;
        self.total = 0;
        true
    }

    /// Returns the number of bytes not yet sent.
    pub fn remaining(&self) -> usize {
        self.total - self.sent
    }

    pub fn is_idle(&self) -> bool {
        self.remaining() == 0
    }
}
