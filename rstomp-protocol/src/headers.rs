//! Ordered frame headers with case-insensitive lookup.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// Well-known header names.
pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const CODE: &str = "code";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const LOGIN: &str = "login";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const PASSCODE: &str = "passcode";
    pub const PREFETCH_COUNT: &str = "prefetch-count";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const TRANSACTION: &str = "transaction";
    pub const VERSION: &str = "version";
}

/// Frame headers.
///
/// Entries keep their arrival order and original spelling for encoding.
/// Lookups use the lower-cased name. [`add`](Headers::add) keeps the first
/// value seen for a name, which is how repeated headers on the wire are
/// resolved; [`set`](Headers::set) replaces it and is meant for frames the
/// broker builds itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header unless one with the same name exists.
    ///
    /// Returns `false` if the header was ignored.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key, self.entries.len());
        self.entries.push((name, value.into()));
        true
    }

    /// Sets a header, replacing any existing value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        match self.index.get(&key) {
            Some(&i) => self.entries[i] = (name, value.into()),
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((name, value.into()));
            }
        }
    }

    /// Returns the value of a header, matching the name case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        let i = match self.index.get(name) {
            Some(&i) => i,
            None => *self.index.get(&name.to_ascii_lowercase())?,
        };
        Some(self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes a header and returns its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let i = self.index.remove(&name.to_ascii_lowercase())?;
        let (_, value) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(value)
    }

    /// Iterates headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.add(name, value);
        }
        headers
    }
}

/// Writes a header line, escaping the name and value so they decode to
/// the same strings.
pub(crate) fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    put_escaped(buf, name, true);
    buf.put_u8(b':');
    put_escaped(buf, value, false);
    buf.put_u8(b'\n');
}

/// Returns the encoded size of a header line.
pub(crate) fn header_len(name: &str, value: &str) -> usize {
    escaped_len(name, true) + 1 + escaped_len(value, false) + 1
}

fn put_escaped(buf: &mut BytesMut, s: &str, is_name: bool) {
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match escape(b, i == 0 || i + 1 == bytes.len(), is_name) {
            Some(e) => buf.put_slice(&[b'\\', e]),
            None => buf.put_u8(b),
        }
    }
}

fn escaped_len(s: &str, is_name: bool) -> usize {
    let bytes = s.as_bytes();
    bytes.len()
        + bytes
            .iter()
            .enumerate()
            .filter(|&(i, &b)| escape(b, i == 0 || i + 1 == bytes.len(), is_name).is_some())
            .count()
}

/// Returns the byte to write after a backslash, or `None` to write `b` as is.
///
/// Whitespace is escaped anywhere in a name but only at the edges of a value,
/// where the parser would otherwise skip or trim it.
fn escape(b: u8, at_edge: bool, is_name: bool) -> Option<u8> {
    match b {
        b'\\' => Some(b'\\'),
        b'\n' => Some(b'n'),
        b'\r' => Some(b'r'),
        b':' => Some(b'c'),
        b'"' if !is_name => Some(b'"'),
        b' ' | b'\t' if at_edge || is_name => Some(b),
        _ => None,
    }
}
