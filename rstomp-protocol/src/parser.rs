//! Resumable parser for the command line and header section of a frame.
//!
//! The parser is a byte-at-a-time state machine. It may be fed input split
//! at any position; everything it has seen so far lives in its own fields,
//! so a frame arriving one byte per read parses the same as one arriving
//! whole. The same parser reads HTTP upgrade requests, whose request line
//! takes the place of the frame name.
//!
//! Rules:
//! - EOLs before the command line are heart-beats and are skipped.
//! - A header name ends at `:`; CR or LF inside a name is malformed.
//! - A line starting with a space or tab continues the previous value; the
//!   fold collapses to one space.
//! - Inside `"..."` a value may contain `:`, CR and LF. Quoted segments are
//!   kept verbatim, quotes and backslash escapes included. A blank line
//!   inside a quoted segment is malformed.
//! - Outside quotes, names and values decode `\n`, `\r`, `\c` (`:`) and
//!   `\\`; a backslash before any other byte yields that byte. Escaped bytes
//!   are never trimmed or taken as separators.
//! - Unquoted values are trimmed at the end; CR before LF is dropped.

use crate::error::ProtocolError;

/// Receives the pieces of a frame head as they are recognized.
pub trait HeaderHandler {
    /// Called once with the frame name (or HTTP request line).
    fn frame_name(&mut self, name: String);

    /// Called for each complete header.
    fn header(&mut self, name: String, value: String);

    /// Called when the blank line ending the header section is read.
    fn headers_complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    BeforeFirstLine,
    FirstLine,
    NameBeforeWhitespace,
    Name,
    AfterName,
    ValueBeforeWhitespace,
    Value,
    ValueCompletedOrMultiline,
}

/// Incremental header parser.
#[derive(Debug)]
pub struct HeaderParser {
    state: State,
    name: Vec<u8>,
    value: Vec<u8>,
    quoted: bool,
    escaped: bool,
    quoted_eol: bool,
    unescaping: bool,
    kept: usize,
    size: usize,
    max_size: usize,
}

impl HeaderParser {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: State::BeforeFirstLine,
            name: Vec::new(),
            value: Vec::new(),
            quoted: false,
            escaped: false,
            quoted_eol: false,
            unescaping: false,
            kept: 0,
            size: 0,
            max_size,
        }
    }

    /// Returns the configured header section limit.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns whether the parser is between frames.
    pub fn is_idle(&self) -> bool {
        self.state == State::BeforeFirstLine && self.size == 0
    }

    /// Discards all partial state.
    pub fn reset(&mut self) {
        self.state = State::BeforeFirstLine;
        self.name.clear();
        self.value.clear();
        self.quoted = false;
        self.escaped = false;
        self.quoted_eol = false;
        self.unescaping = false;
        self.kept = 0;
        self.size = 0;
    }

    /// Consumes input until the header section completes.
    ///
    /// Returns `Some(n)` once the blank line after the headers has been read,
    /// where `n` is the number of bytes consumed from `input`; the parser is
    /// then ready for the next frame. Returns `None` when all of `input` was
    /// consumed without completing. On error the parser resets itself.
    pub fn parse<H: HeaderHandler + ?Sized>(
        &mut self,
        input: &[u8],
        handler: &mut H,
    ) -> Result<Option<usize>, ProtocolError> {
        for (i, &b) in input.iter().enumerate() {
            match self.step(b, handler) {
                Ok(true) => {
                    self.reset();
                    return Ok(Some(i + 1));
                }
                Ok(false) => {}
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    fn step<H: HeaderHandler + ?Sized>(
        &mut self,
        b: u8,
        handler: &mut H,
    ) -> Result<bool, ProtocolError> {
        if self.state == State::BeforeFirstLine && (b == b'\n' || b == b'\r') {
            return Ok(false);
        }

        self.size += 1;
        if self.size > self.max_size {
            return Err(ProtocolError::HeaderTooLarge {
                size: self.size,
                max: self.max_size,
            });
        }

        match self.state {
            State::BeforeFirstLine => {
                self.name.push(b);
                self.state = State::FirstLine;
            }
            State::FirstLine => match b {
                b'\n' => {
                    trim_end(&mut self.name);
                    let name = take_string(&mut self.name)?;
                    handler.frame_name(name);
                    self.state = State::NameBeforeWhitespace;
                }
                _ => self.name.push(b),
            },
            State::NameBeforeWhitespace => match b {
                b'\n' => {
                    handler.headers_complete();
                    return Ok(true);
                }
                b'\r' | b' ' | b'\t' => {}
                _ => self.start_name(b)?,
            },
            State::Name if self.unescaping => {
                self.unescaping = false;
                self.name.push(unescape(b)?);
            }
            State::Name => match b {
                b'\\' => self.unescaping = true,
                b':' => self.state = State::ValueBeforeWhitespace,
                b' ' | b'\t' => self.state = State::AfterName,
                b'\r' | b'\n' => {
                    return Err(ProtocolError::MalformedFrame("line break in header name"))
                }
                _ => self.name.push(b),
            },
            State::AfterName => match b {
                b':' => self.state = State::ValueBeforeWhitespace,
                b' ' | b'\t' => {}
                _ => return Err(ProtocolError::MalformedFrame("whitespace in header name")),
            },
            State::ValueBeforeWhitespace => match b {
                b' ' | b'\t' | b'\r' => {}
                b'\n' => self.state = State::ValueCompletedOrMultiline,
                _ => {
                    self.state = State::Value;
                    self.push_value(b)?;
                }
            },
            State::Value => {
                if !self.quoted && !self.unescaping && b == b'\n' {
                    self.state = State::ValueCompletedOrMultiline;
                } else {
                    self.push_value(b)?;
                }
            }
            State::ValueCompletedOrMultiline => match b {
                b' ' | b'\t' => {
                    self.trim_value();
                    if !self.value.is_empty() {
                        self.value.push(b' ');
                    }
                    self.state = State::ValueBeforeWhitespace;
                }
                b'\r' => {}
                b'\n' => {
                    self.emit_header(handler)?;
                    handler.headers_complete();
                    return Ok(true);
                }
                _ => {
                    self.emit_header(handler)?;
                    self.start_name(b)?;
                }
            },
        }
        Ok(false)
    }

    fn start_name(&mut self, b: u8) -> Result<(), ProtocolError> {
        match b {
            b':' => return Err(ProtocolError::MalformedFrame("empty header name")),
            b'\\' => self.unescaping = true,
            _ => self.name.push(b),
        }
        self.state = State::Name;
        Ok(())
    }

    fn push_value(&mut self, b: u8) -> Result<(), ProtocolError> {
        if self.quoted {
            if b == b'\n' {
                if self.quoted_eol {
                    return Err(ProtocolError::MalformedFrame("unterminated quoted value"));
                }
                self.quoted_eol = true;
            } else if b != b'\r' {
                self.quoted_eol = false;
            }
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.quoted = false;
                self.quoted_eol = false;
            }
        } else if self.unescaping {
            self.unescaping = false;
            self.value.push(unescape(b)?);
            self.kept = self.value.len();
            return Ok(());
        } else if b == b'\\' {
            self.unescaping = true;
            return Ok(());
        } else if b == b'"' {
            self.quoted = true;
        }
        self.value.push(b);
        Ok(())
    }

    /// Trims trailing whitespace, stopping at the last escaped byte.
    fn trim_value(&mut self) {
        while self.value.len() > self.kept
            && matches!(self.value.last(), Some(b' ' | b'\t' | b'\r'))
        {
            self.value.pop();
        }
    }

    fn emit_header<H: HeaderHandler + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), ProtocolError> {
        self.trim_value();
        self.kept = 0;
        let name = take_string(&mut self.name)?;
        let value = take_string(&mut self.value)?;
        handler.header(name, value);
        Ok(())
    }
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new(crate::MAX_HEADER_SIZE)
    }
}

fn trim_end(buf: &mut Vec<u8>) {
    while matches!(buf.last(), Some(b' ' | b'\t' | b'\r')) {
        buf.pop();
    }
}

fn unescape(b: u8) -> Result<u8, ProtocolError> {
    match b {
        b'n' => Ok(b'\n'),
        b'r' => Ok(b'\r'),
        b'c' => Ok(b':'),
        b'\r' | b'\n' => Err(ProtocolError::MalformedFrame("escape at end of line")),
        other => Ok(other),
    }
}

fn take_string(buf: &mut Vec<u8>) -> Result<String, ProtocolError> {
    String::from_utf8(std::mem::take(buf)).map_err(|_| ProtocolError::InvalidUtf8)
}
