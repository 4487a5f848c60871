//! HTTP upgrade handshake (RFC 6455 section 4).

use crate::error::WebSocketError;
use crate::headers::Headers;
use crate::parser::HeaderHandler;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};

/// GUID appended to the client key when computing the accept key.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version defined by RFC 6455.
pub const WEBSOCKET_VERSION: &str = "13";

/// STOMP subprotocols, newest first.
pub const STOMP_SUBPROTOCOLS: &[&str] = &["v12.stomp", "v11.stomp", "v10.stomp"];

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A parsed upgrade request: request line plus headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub request_line: String,
    pub headers: Headers,
}

impl HeaderHandler for UpgradeRequest {
    fn frame_name(&mut self, name: String) {
        self.request_line = name;
    }

    fn header(&mut self, name: String, value: String) {
        self.headers.add(name, value);
    }

    fn headers_complete(&mut self) {}
}

impl UpgradeRequest {
    pub fn method(&self) -> &str {
        self.request_line.split_whitespace().next().unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.request_line.split_whitespace().nth(1).unwrap_or("")
    }

    pub fn key(&self) -> Option<&str> {
        self.headers.get("sec-websocket-key")
    }

    /// Subprotocols offered by the client, in its order of preference.
    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.headers
            .get("sec-websocket-protocol")
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /// Picks the first offered subprotocol that is also in `supported`.
    pub fn select_protocol<'a>(&self, supported: &[&'a str]) -> Option<&'a str> {
        self.protocols().find_map(|offered| {
            supported
                .iter()
                .find(|s| s.eq_ignore_ascii_case(offered))
                .copied()
        })
    }

    /// Checks the request and returns the client key.
    pub fn validate(&self) -> Result<&str, WebSocketError> {
        let mut parts = self.request_line.split_whitespace();
        let (method, _path, version) = (parts.next(), parts.next(), parts.next());
        if method != Some("GET") {
            return Err(WebSocketError::Handshake(format!(
                "expected GET, got {:?}",
                method.unwrap_or("")
            )));
        }
        match version {
            Some("HTTP/1.1") | Some("HTTP/2") | Some("HTTP/2.0") => {}
            other => {
                return Err(WebSocketError::Handshake(format!(
                    "unsupported HTTP version {:?}",
                    other.unwrap_or("")
                )))
            }
        }

        if !has_token(self.headers.get("upgrade"), "websocket") {
            return Err(WebSocketError::Handshake("missing Upgrade: websocket".into()));
        }
        if !has_token(self.headers.get("connection"), "upgrade") {
            return Err(WebSocketError::Handshake("missing Connection: Upgrade".into()));
        }
        if self.headers.get("sec-websocket-version").map(str::trim) != Some(WEBSOCKET_VERSION) {
            return Err(WebSocketError::Handshake(format!(
                "unsupported Sec-WebSocket-Version (expected {})",
                WEBSOCKET_VERSION
            )));
        }

        let key = self
            .key()
            .map(str::trim)
            .ok_or_else(|| WebSocketError::Handshake("missing Sec-WebSocket-Key".into()))?;
        match STANDARD.decode(key) {
            Ok(nonce) if nonce.len() == 16 => Ok(key),
            _ => Err(WebSocketError::Handshake("invalid Sec-WebSocket-Key".into())),
        }
    }
}

fn has_token(value: Option<&str>, token: &str) -> bool {
    value
        .unwrap_or("")
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Builds the `101 Switching Protocols` response.
pub fn upgrade_response(key: &str, protocol: Option<&str>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(192);
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(format!("Sec-WebSocket-Accept: {}\r\n", accept_key(key)).as_bytes());
    if let Some(protocol) = protocol {
        buf.put_slice(format!("Sec-WebSocket-Protocol: {}\r\n", protocol).as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf
}

/// Builds a `400 Bad Request` response for a failed handshake.
pub fn reject_response(reason: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + reason.len());
    buf.put_slice(b"HTTP/1.1 400 Bad Request\r\n");
    buf.put_slice(format!("Sec-WebSocket-Version: {}\r\n", WEBSOCKET_VERSION).as_bytes());
    buf.put_slice(b"Content-Type: text/plain\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", reason.len()).as_bytes());
    buf.put_slice(b"Connection: close\r\n\r\n");
    buf.put_slice(reason.as_bytes());
    buf
}

/// Builds a client upgrade request.
pub fn client_request(host: &str, path: &str, key: &str, protocols: &[&str]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(format!("GET {} HTTP/1.1\r\n", path).as_bytes());
    buf.put_slice(format!("Host: {}\r\n", host).as_bytes());
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(format!("Sec-WebSocket-Key: {}\r\n", key).as_bytes());
    buf.put_slice(format!("Sec-WebSocket-Version: {}\r\n", WEBSOCKET_VERSION).as_bytes());
    if !protocols.is_empty() {
        buf.put_slice(format!("Sec-WebSocket-Protocol: {}\r\n", protocols.join(", ")).as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::HeaderParser;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn parse(raw: &[u8]) -> UpgradeRequest {
        let mut request = UpgradeRequest::default();
        let n = HeaderParser::new(8192).parse(raw, &mut request).unwrap();
        assert_eq!(n, Some(raw.len()));
        request
    }

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_validate_client_request() {
        let raw = client_request("localhost:61614", "/stomp", SAMPLE_KEY, &["v12.stomp"]);
        let request = parse(&raw);
        assert_eq!(request.method(), "GET");
        assert_eq!(request.path(), "/stomp");
        assert_eq!(request.validate().unwrap(), SAMPLE_KEY);
    }

    #[test]
    fn test_connection_header_token_list() {
        let raw = format!(
            "GET / HTTP/1.1\r\nHost: h\r\nUpgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
            SAMPLE_KEY
        );
        assert!(parse(raw.as_bytes()).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let cases = [
            "POST / HTTP/1.1\r\n\r\n",
            "GET / HTTP/1.0\r\n\r\n",
            "GET / HTTP/1.1\r\nConnection: Upgrade\r\n\r\n",
            "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 8\r\n\r\n",
            "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n",
            "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: c2hvcnQ=\r\n\r\n",
        ];
        for raw in cases {
            assert!(
                matches!(parse(raw.as_bytes()).validate(), Err(WebSocketError::Handshake(_))),
                "accepted {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_select_protocol() {
        let raw = "GET / HTTP/1.1\r\nSec-WebSocket-Protocol: v10.stomp, v12.stomp\r\n\r\n";
        let request = parse(raw.as_bytes());
        assert_eq!(request.select_protocol(STOMP_SUBPROTOCOLS), Some("v10.stomp"));
        assert_eq!(request.select_protocol(&["mqtt"]), None);

        let request = parse(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(request.select_protocol(STOMP_SUBPROTOCOLS), None);
    }

    #[test]
    fn test_upgrade_response() {
        let response = upgrade_response(SAMPLE_KEY, Some("v12.stomp"));
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: v12.stomp\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_reject_response() {
        let response = reject_response("bad key");
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\nbad key"));
    }
}
