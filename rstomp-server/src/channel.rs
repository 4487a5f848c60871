//! Byte transports a session runs over.
//!
//! A [`Channel`] moves raw STOMP bytes. The TCP channel passes them straight
//! through; the WebSocket channel performs the HTTP upgrade, unwraps incoming
//! text and binary messages and wraps outgoing bytes in frames.

use crate::error::ServerError;
use crate::stream::MaybeTlsStream;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use rstomp_buffer::BufferSegment;
use rstomp_protocol::websocket::handshake::{reject_response, upgrade_response};
use rstomp_protocol::websocket::{
    Message, MessageAssembler, Opcode, WebSocketDecoder, WebSocketEncoder, WebSocketEvent,
    WebSocketFrame, STOMP_SUBPROTOCOLS,
};
use rstomp_protocol::WebSocketError;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Close code sent when the broker ends a WebSocket session normally.
const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when the peer breaks WebSocket framing rules.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// A bidirectional byte transport.
///
/// `receive_more` must be cancel-safe: the server polls it inside
/// `tokio::select!` and may drop the future when another branch wins. Each
/// await inside it either completes or leaves the channel unchanged.
#[async_trait]
pub trait Channel: Send {
    /// Completes any transport-level handshake before STOMP traffic starts.
    async fn open(&mut self) -> Result<(), ServerError>;

    /// Appends received STOMP bytes to the free space of `segment`.
    ///
    /// Returns the number of bytes added; 0 means the peer closed the stream.
    async fn receive_more(&mut self, segment: &mut BufferSegment) -> Result<usize, ServerError>;

    /// Queues `data` for the peer.
    async fn send(&mut self, data: &[u8]) -> Result<(), ServerError>;

    /// Writes everything queued so far.
    async fn flush(&mut self) -> Result<(), ServerError>;

    /// Ends the transport.
    async fn close(&mut self) -> Result<(), ServerError>;

    /// Transport label used in logs and metrics.
    fn transport(&self) -> &'static str;

    fn remote_addr(&self) -> SocketAddr;
}

fn receive_buffer_full() -> ServerError {
    ServerError::Io(io::Error::new(
        io::ErrorKind::OutOfMemory,
        "receive buffer has no free space",
    ))
}

/// STOMP directly over TCP or TLS.
pub struct TcpChannel {
    stream: MaybeTlsStream,
    addr: SocketAddr,
}

impl TcpChannel {
    pub fn new(stream: MaybeTlsStream, addr: SocketAddr) -> Self {
        Self { stream, addr }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn open(&mut self) -> Result<(), ServerError> {
        Ok(())
    }

    async fn receive_more(&mut self, segment: &mut BufferSegment) -> Result<usize, ServerError> {
        let free = segment.unfilled_mut();
        if free.is_empty() {
            return Err(receive_buffer_full());
        }
        let n = self.stream.read(free).await?;
        segment.commit(n)?;
        Ok(n)
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ServerError> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ServerError> {
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ServerError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn transport(&self) -> &'static str {
        if self.stream.is_tls() {
            "tls"
        } else {
            "tcp"
        }
    }

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// STOMP carried in WebSocket messages.
pub struct WebSocketChannel {
    stream: MaybeTlsStream,
    addr: SocketAddr,
    decoder: WebSocketDecoder,
    assembler: MessageAssembler,
    encoder: WebSocketEncoder,
    /// Unwrapped message payload not yet handed to the caller.
    inbound: BytesMut,
    /// Encoded frames waiting to be written.
    outbound: BytesMut,
    read_buf: Box<[u8]>,
    protocol: Option<&'static str>,
    close_sent: bool,
    close_received: bool,
}

impl WebSocketChannel {
    pub fn new(stream: MaybeTlsStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            decoder: WebSocketDecoder::server(),
            assembler: MessageAssembler::default(),
            encoder: WebSocketEncoder::new(64 * 1024),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            read_buf: vec![0u8; 8192].into_boxed_slice(),
            protocol: None,
            close_sent: false,
            close_received: false,
        }
    }

    /// Caps the size of a single incoming message.
    pub fn with_max_message_size(mut self, max: u64) -> Self {
        self.decoder = WebSocketDecoder::server().with_max_payload(max);
        self.assembler = MessageAssembler::new(max);
        self
    }

    /// Sets the payload size at which outgoing messages are fragmented.
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.encoder = WebSocketEncoder::new(size);
        self
    }

    /// Subprotocol agreed during the upgrade, if any.
    pub fn protocol(&self) -> Option<&'static str> {
        self.protocol
    }

    fn queue_close(&mut self, code: u16, reason: &str) {
        if !self.close_sent {
            WebSocketFrame::close(code, reason).encode_into(&mut self.outbound);
            self.close_sent = true;
        }
    }

    async fn write_queued(&mut self) -> Result<(), ServerError> {
        if !self.outbound.is_empty() {
            self.stream.write_all(&self.outbound).await?;
            self.outbound.clear();
        }
        Ok(())
    }

    /// Moves decoded messages into `inbound` until it holds data, the peer
    /// closes, or the decoder needs more bytes. Returns `false` on close.
    fn process_buffered(&mut self, eof: bool) -> Result<bool, ServerError> {
        while self.inbound.is_empty() && !self.close_received {
            let event = if eof {
                self.decoder.decode_eof()
            } else {
                self.decoder.decode()
            };
            let frame = match event {
                Ok(Some(WebSocketEvent::Frame(frame))) => frame,
                Ok(Some(WebSocketEvent::Upgrade(_))) => {
                    return Err(WebSocketError::Handshake("repeated upgrade request".into()).into())
                }
                Ok(None) => break,
                Err(e) => {
                    self.queue_close(CLOSE_PROTOCOL_ERROR, "protocol error");
                    return Err(e.into());
                }
            };
            match self.assembler.push(frame)? {
                Some(Message::Text(payload)) | Some(Message::Binary(payload)) => {
                    self.inbound.extend_from_slice(&payload);
                }
                Some(Message::Ping(payload)) => {
                    WebSocketFrame::pong(payload).encode_into(&mut self.outbound);
                }
                Some(Message::Pong(_)) => {}
                Some(Message::Close(code)) => {
                    tracing::debug!("[{}] WebSocket close received: {:?}", self.addr, code);
                    self.close_received = true;
                    self.queue_close(CLOSE_NORMAL, "");
                }
                None => {}
            }
        }
        Ok(!self.close_received || !self.inbound.is_empty())
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn open(&mut self) -> Result<(), ServerError> {
        let request = loop {
            match self.decoder.decode() {
                Ok(Some(WebSocketEvent::Upgrade(request))) => break request,
                Ok(Some(WebSocketEvent::Frame(_))) => {
                    return Err(WebSocketError::Handshake("frame before upgrade".into()).into())
                }
                Ok(None) => {}
                Err(e) => {
                    self.stream.write_all(&reject_response(&e.to_string())).await?;
                    return Err(e.into());
                }
            }
            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ServerError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            self.decoder.extend(&self.read_buf[..n]);
        };

        let key = match request.validate() {
            Ok(key) => key.to_string(),
            Err(e) => {
                tracing::debug!("[{}] WebSocket upgrade rejected: {}", self.addr, e);
                self.stream.write_all(&reject_response(&e.to_string())).await?;
                return Err(e.into());
            }
        };
        self.protocol = request.select_protocol(STOMP_SUBPROTOCOLS);
        self.stream
            .write_all(&upgrade_response(&key, self.protocol))
            .await?;
        tracing::debug!(
            "[{}] WebSocket upgrade complete (path={}, protocol={:?})",
            self.addr,
            request.path(),
            self.protocol
        );
        Ok(())
    }

    async fn receive_more(&mut self, segment: &mut BufferSegment) -> Result<usize, ServerError> {
        if segment.unfilled_mut().is_empty() {
            return Err(receive_buffer_full());
        }
        loop {
            let open = self.process_buffered(false)?;
            if !self.inbound.is_empty() {
                let n = segment.write(&self.inbound);
                self.inbound.advance(n);
                return Ok(n);
            }
            if !open {
                return Ok(0);
            }

            // pong replies; a single write either completes or leaves the queue untouched
            if !self.outbound.is_empty() {
                let n = self.stream.write(&self.outbound).await?;
                self.outbound.advance(n);
                continue;
            }

            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                self.process_buffered(true)?;
                let n = segment.write(&self.inbound);
                self.inbound.advance(n);
                return Ok(n);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ServerError> {
        if self.close_sent {
            return Err(ServerError::Io(io::ErrorKind::BrokenPipe.into()));
        }
        let opcode = if std::str::from_utf8(data).is_ok() {
            Opcode::Text
        } else {
            Opcode::Binary
        };
        self.encoder.encode(opcode, data, &mut self.outbound);
        self.write_queued().await
    }

    async fn flush(&mut self) -> Result<(), ServerError> {
        self.write_queued().await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ServerError> {
        self.queue_close(CLOSE_NORMAL, "");
        self.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    fn transport(&self) -> &'static str {
        "websocket"
    }

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstomp_protocol::websocket::handshake::client_request;
    use tokio::net::{TcpListener, TcpStream};

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    async fn pair() -> (TcpStream, MaybeTlsStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (socket, peer) = listener.accept().await.unwrap();
        let stream = MaybeTlsStream::accept(socket, None, peer).await.unwrap();
        (client, stream, peer)
    }

    fn client_frame(opcode: Opcode, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        WebSocketEncoder::new(1024)
            .with_masking_key(MASK)
            .encode(opcode, payload, &mut buf);
        buf
    }

    /// Reads the HTTP response head, returning it and any bytes after it.
    async fn read_response(client: &mut TcpStream) -> (String, Vec<u8>) {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed during handshake");
            data.extend_from_slice(&buf[..n]);
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let rest = data.split_off(pos + 4);
                return (String::from_utf8(data).unwrap(), rest);
            }
        }
    }

    async fn next_server_frame(
        client: &mut TcpStream,
        decoder: &mut WebSocketDecoder,
    ) -> WebSocketFrame {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(WebSocketEvent::Frame(frame)) = decoder.decode().unwrap() {
                return frame;
            }
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0);
            decoder.extend(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_tcp_channel_receive_and_send() {
        let (mut client, stream, peer) = pair().await;
        let mut channel = TcpChannel::new(stream, peer);
        channel.open().await.unwrap();
        assert_eq!(channel.transport(), "tcp");
        assert_eq!(channel.remote_addr(), peer);

        client.write_all(b"SEND\n\n\0").await.unwrap();
        let mut segment = BufferSegment::standalone(64);
        let mut total = 0;
        while total < 7 {
            total += channel.receive_more(&mut segment).await.unwrap();
        }
        assert_eq!(segment.unread(), b"SEND\n\n\0");

        channel.send(b"RECEIPT\n\n\0").await.unwrap();
        channel.flush().await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"RECEIPT\n\n\0");

        drop(client);
        assert_eq!(channel.receive_more(&mut segment).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_websocket_upgrade_and_messages() {
        let (mut client, stream, peer) = pair().await;
        let mut channel = WebSocketChannel::new(stream, peer);

        let mut request = client_request("localhost", "/stomp", SAMPLE_KEY, &["v11.stomp"]);
        // a fragmented text message sent right behind the upgrade request
        let mut first = WebSocketFrame::text("CONN").with_fin(false);
        first.mask(MASK).unwrap();
        first.encode_into(&mut request);
        let mut second = WebSocketFrame::new(Opcode::Continuation, "ECT\n\n\0");
        second.mask(MASK).unwrap();
        second.encode_into(&mut request);
        client.write_all(&request).await.unwrap();

        channel.open().await.unwrap();
        assert_eq!(channel.protocol(), Some("v11.stomp"));
        let (head, rest) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(head.contains("Sec-WebSocket-Protocol: v11.stomp"));
        assert!(rest.is_empty());

        let mut segment = BufferSegment::standalone(64);
        let n = channel.receive_more(&mut segment).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(segment.unread(), b"CONNECT\n\n\0");

        channel.send(b"CONNECTED\n\n\0").await.unwrap();
        let mut decoder = WebSocketDecoder::client();
        let frame = next_server_frame(&mut client, &mut decoder).await;
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(!frame.is_masked());
        assert_eq!(&frame.payload[..], b"CONNECTED\n\n\0");

        channel.send(&[0xff, 0x00]).await.unwrap();
        let frame = next_server_frame(&mut client, &mut decoder).await;
        assert_eq!(frame.opcode, Opcode::Binary);
    }

    #[tokio::test]
    async fn test_websocket_ping_and_close() {
        let (mut client, stream, peer) = pair().await;
        let mut channel = WebSocketChannel::new(stream, peer);
        client
            .write_all(&client_request("localhost", "/", SAMPLE_KEY, &[]))
            .await
            .unwrap();
        channel.open().await.unwrap();
        assert_eq!(channel.protocol(), None);
        let (_, rest) = read_response(&mut client).await;
        let mut decoder = WebSocketDecoder::client();
        decoder.extend(&rest);

        let mut data = client_frame(Opcode::Ping, b"hi");
        data.extend_from_slice(&client_frame(Opcode::Close, &[0x03, 0xe8]));
        client.write_all(&data).await.unwrap();

        let mut segment = BufferSegment::standalone(64);
        assert_eq!(channel.receive_more(&mut segment).await.unwrap(), 0);
        channel.flush().await.unwrap();

        let pong = next_server_frame(&mut client, &mut decoder).await;
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"hi");
        let close = next_server_frame(&mut client, &mut decoder).await;
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(close.close_code(), Some(CLOSE_NORMAL));

        assert!(channel.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_websocket_bad_upgrade_rejected() {
        let (mut client, stream, peer) = pair().await;
        let mut channel = WebSocketChannel::new(stream, peer);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();

        let err = channel.open().await.unwrap_err();
        assert!(matches!(err, ServerError::WebSocket(_)));
        let (head, _) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 400"));
    }
}
