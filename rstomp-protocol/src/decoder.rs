//! Incremental frame decoder.
//!
//! Decoding runs in three phases: the header section (through
//! [`HeaderParser`]), the body, and the NUL terminator. With a
//! `content-length` header the body is exactly that many bytes and may
//! contain NULs; without one it runs up to the first NUL. Input can stop at
//! any byte, including right before the terminator.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::parser::{HeaderHandler, HeaderParser};
use crate::{FRAME_TERMINATOR, MAX_BODY_SIZE, MAX_HEADER_SIZE};
use bytes::{Buf, BytesMut};
use rstomp_buffer::BufferSegment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    Body { remaining: Option<usize> },
    Terminator,
}

/// Frame under construction.
#[derive(Debug, Default)]
struct PendingFrame {
    frame: Frame,
}

impl HeaderHandler for PendingFrame {
    fn frame_name(&mut self, name: String) {
        self.frame.name = name;
    }

    fn header(&mut self, name: String, value: String) {
        self.frame.headers.add(name, value);
    }

    fn headers_complete(&mut self) {}
}

/// Decodes frames from a byte stream delivered in arbitrary chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    parser: HeaderParser,
    pending: PendingFrame,
    phase: Phase,
    body: BytesMut,
    max_body_size: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limits(MAX_HEADER_SIZE, MAX_BODY_SIZE)
    }

    pub fn with_limits(max_header_size: usize, max_body_size: usize) -> Self {
        Self {
            parser: HeaderParser::new(max_header_size),
            pending: PendingFrame::default(),
            phase: Phase::Headers,
            body: BytesMut::new(),
            max_body_size,
        }
    }

    /// Returns whether the decoder holds no partial frame.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Headers && self.parser.is_idle()
    }

    /// Discards any partially decoded frame.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.pending = PendingFrame::default();
        self.phase = Phase::Headers;
        self.body.clear();
    }

    /// Feeds bytes to the decoder.
    ///
    /// Returns the number of bytes consumed and the frame completed by them,
    /// if any. At most one frame is produced per call; call again with the
    /// remaining input to continue. Any error resets the decoder.
    pub fn feed(&mut self, input: &[u8]) -> Result<(usize, Option<Frame>), ProtocolError> {
        let result = self.feed_inner(input);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn feed_inner(&mut self, input: &[u8]) -> Result<(usize, Option<Frame>), ProtocolError> {
        let mut pos = 0;
        loop {
            match self.phase {
                Phase::Headers => match self.parser.parse(&input[pos..], &mut self.pending)? {
                    Some(n) => {
                        pos += n;
                        self.start_body()?;
                    }
                    None => return Ok((input.len(), None)),
                },
                Phase::Body {
                    remaining: Some(remaining),
                } => {
                    let take = remaining.min(input.len() - pos);
                    self.body.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    if take < remaining {
                        self.phase = Phase::Body {
                            remaining: Some(remaining - take),
                        };
                        return Ok((pos, None));
                    }
                    self.phase = Phase::Terminator;
                }
                Phase::Body { remaining: None } => {
                    let rest = &input[pos..];
                    let end = rest.iter().position(|&b| b == FRAME_TERMINATOR);
                    let chunk = &rest[..end.unwrap_or(rest.len())];
                    if self.body.len() + chunk.len() > self.max_body_size {
                        return Err(ProtocolError::FrameTooLarge {
                            size: self.body.len() + chunk.len(),
                            max: self.max_body_size,
                        });
                    }
                    self.body.extend_from_slice(chunk);
                    pos += chunk.len();
                    if end.is_none() {
                        return Ok((pos, None));
                    }
                    self.phase = Phase::Terminator;
                }
                Phase::Terminator => {
                    let Some(&b) = input.get(pos) else {
                        return Ok((pos, None));
                    };
                    if b != FRAME_TERMINATOR {
                        return Err(ProtocolError::MissingTerminator(b));
                    }
                    return Ok((pos + 1, Some(self.finish())));
                }
            }
        }
    }

    fn start_body(&mut self) -> Result<(), ProtocolError> {
        let declared = self.pending.frame.declared_content_length()?;
        if let Some(len) = declared {
            if len > self.max_body_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: len,
                    max: self.max_body_size,
                });
            }
            self.body.reserve(len);
        }
        self.phase = match declared {
            Some(0) => Phase::Terminator,
            remaining => Phase::Body { remaining },
        };
        Ok(())
    }

    fn finish(&mut self) -> Frame {
        let mut frame = std::mem::take(&mut self.pending).frame;
        if !self.body.is_empty() {
            frame.body = Some(self.body.split().freeze());
        }
        self.phase = Phase::Headers;
        frame
    }

    /// Decodes from a segment, advancing its cursor past the consumed bytes.
    pub fn decode(&mut self, segment: &mut BufferSegment) -> Result<Option<Frame>, ProtocolError> {
        let (consumed, frame) = self.feed(segment.unread())?;
        segment.advance(consumed)?;
        Ok(frame)
    }

    /// Decodes from a growable buffer, consuming the bytes read.
    pub fn decode_buf(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let (consumed, frame) = self.feed(&buf[..])?;
        buf.advance(consumed);
        Ok(frame)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
