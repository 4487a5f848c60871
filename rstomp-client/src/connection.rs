//! Connection management.

use crate::error::ClientError;
use bytes::BytesMut;
use rstomp_protocol::headers::header;
use rstomp_protocol::{Command, Frame, FrameDecoder};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Versions offered in CONNECT.
const ACCEPT_VERSION: &str = "1.0,1.1,1.2";

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Virtual host sent in the `host` header.
    pub host: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// How long to wait for a receipt.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Heart-beat offer in milliseconds: (send, receive). Zero disables.
    pub heart_beat: (u64, u64),
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            host: "localhost".to_string(),
            login: None,
            passcode: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            heart_beat: (0, 0),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_heart_beat(mut self, send_ms: u64, receive_ms: u64) -> Self {
        self.heart_beat = (send_ms, receive_ms);
        self
    }
}

/// What the broker reported in CONNECTED.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Negotiated protocol version.
    pub version: String,
    pub server: Option<String>,
    pub session: Option<String>,
    /// Agreed heart-beat intervals in milliseconds: (client sends, client expects).
    pub heart_beat: (u64, u64),
}

impl SessionInfo {
    fn from_connected(frame: &Frame, offer: (u64, u64)) -> Self {
        let version = frame.header(header::VERSION).unwrap_or("1.0").to_string();
        let server_beat = frame
            .header(header::HEART_BEAT)
            .and_then(parse_heart_beat)
            .unwrap_or((0, 0));
        let heart_beat = if version == "1.0" {
            (0, 0)
        } else {
            negotiate_heart_beat(offer, server_beat)
        };
        Self {
            version,
            server: frame.header(header::SERVER).map(str::to_string),
            session: frame.header(header::SESSION).map(str::to_string),
            heart_beat,
        }
    }
}

fn parse_heart_beat(value: &str) -> Option<(u64, u64)> {
    let (send, receive) = value.split_once(',')?;
    Some((send.trim().parse().ok()?, receive.trim().parse().ok()?))
}

/// Combines our (send, receive) offer with the server's. Each direction uses
/// the larger of the two values, or is off when either side says 0.
pub fn negotiate_heart_beat(ours: (u64, u64), server: (u64, u64)) -> (u64, u64) {
    let pick = |a: u64, b: u64| if a == 0 || b == 0 { 0 } else { a.max(b) };
    (pick(ours.0, server.1), pick(ours.1, server.0))
}

type PendingMap = HashMap<String, oneshot::Sender<Result<Frame, ClientError>>>;

/// A connection to a STOMP broker.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the stream (for sending frames).
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Read half and any bytes read past CONNECTED, until the read loop takes them.
    reader: Mutex<Option<(OwnedReadHalf, BytesMut)>>,
    /// Requests waiting for RECEIPT, by receipt id.
    pending: Mutex<PendingMap>,
    /// MESSAGE routing, by subscription id.
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to the broker and completes the CONNECT exchange.
    pub async fn connect(&self) -> Result<SessionInfo, ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;
        tcp_stream.set_nodelay(true).ok();

        let (mut read_half, write_half) = tcp_stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let mut connect = Frame::from_command(Command::Connect)
            .with_header(header::ACCEPT_VERSION, ACCEPT_VERSION)
            .with_header(header::HOST, self.config.host.as_str())
            .with_header(
                header::HEART_BEAT,
                format!("{},{}", self.config.heart_beat.0, self.config.heart_beat.1),
            );
        if let Some(ref login) = self.config.login {
            connect = connect.with_header(header::LOGIN, login.as_str());
        }
        if let Some(ref passcode) = self.config.passcode {
            connect = connect.with_header(header::PASSCODE, passcode.as_str());
        }
        self.write_frame(&connect).await?;

        let mut buf = BytesMut::with_capacity(self.config.read_buffer_size);
        let reply = self.read_single_frame(&mut read_half, &mut buf).await?;
        match reply.command() {
            Some(Command::Connected) => {}
            Some(Command::Error) => return Err(ClientError::from_error_frame(&reply)),
            _ => return Err(ClientError::UnexpectedFrame(reply.name.clone())),
        }

        let info = SessionInfo::from_connected(&reply, self.config.heart_beat);
        tracing::debug!(
            "Connected to {} (version {}, session {:?})",
            self.config.addr,
            info.version,
            info.session
        );
        *self.reader.lock().await = Some((read_half, buf));
        self.connected.store(true, Ordering::SeqCst);
        Ok(info)
    }

    /// Reads one frame directly from the socket, before the read loop runs.
    async fn read_single_frame(
        &self,
        reader: &mut OwnedReadHalf,
        buf: &mut BytesMut,
    ) -> Result<Frame, ClientError> {
        let mut decoder = FrameDecoder::new();
        tokio::time::timeout(self.config.request_timeout, async {
            loop {
                while let Some(frame) = decoder.decode_buf(buf)? {
                    if !frame.is_heartbeat() {
                        return Ok(frame);
                    }
                }
                buf.reserve(self.config.read_buffer_size);
                if reader.read_buf(buf).await? == 0 {
                    return Err(ClientError::ConnectionClosed);
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)?
    }

    /// Returns a fresh id with the given prefix, unique within this connection.
    pub fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(data).await?;
        Ok(())
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        self.write_bytes(&frame.encode()).await
    }

    /// Sends a frame without waiting for anything.
    pub async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.write_frame(frame).await
    }

    /// Sends an empty heart-beat line.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.write_bytes(b"\n").await
    }

    /// Sends a frame with a `receipt` header and waits for the RECEIPT.
    ///
    /// An ERROR carrying the receipt id fails the request.
    pub async fn request(&self, mut frame: Frame) -> Result<Frame, ClientError> {
        if !self.is_connected() {
            tracing::debug!("request() called but not connected");
            return Err(ClientError::NotConnected);
        }

        let id = self.next_id("receipt");
        frame.headers.set(header::RECEIPT, id.as_str());

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        tracing::debug!("{} sent, waiting for {}", frame.name, id);

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("{} timed out", id);
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Starts routing MESSAGE frames for `id` to the returned receiver.
    pub async fn register_subscription(&self, id: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().await.insert(id.to_string(), tx);
        rx
    }

    pub async fn unregister_subscription(&self, id: &str) {
        self.subscriptions.lock().await.remove(id);
    }

    /// Reads and routes frames until the connection closes (run this in a
    /// background task).
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let (mut reader, mut buf) = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(ClientError::NotConnected)?;
        let mut decoder = FrameDecoder::new();

        let result = loop {
            match decoder.decode_buf(&mut buf) {
                Ok(Some(frame)) => {
                    self.dispatch(frame).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => break Err(ClientError::from(e)),
            }

            buf.reserve(self.config.read_buffer_size);
            match reader.read_buf(&mut buf).await {
                Ok(0) if self.is_connected() => {
                    tracing::debug!("read_loop: connection closed by broker");
                    break Err(ClientError::ConnectionClosed);
                }
                Ok(0) => break Ok(()),
                Ok(n) => tracing::trace!("read_loop: received {} bytes", n),
                Err(e) => break Err(ClientError::Io(e)),
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        // dropping the senders wakes every waiter
        self.pending.lock().await.clear();
        self.subscriptions.lock().await.clear();
        result
    }

    async fn dispatch(&self, frame: Frame) {
        match frame.command() {
            Some(Command::Message) => {
                let subscription = frame.header(header::SUBSCRIPTION).unwrap_or_default().to_string();
                match self.subscriptions.lock().await.get(&subscription) {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => tracing::debug!(
                        "read_loop: MESSAGE for unknown subscription {:?}",
                        subscription
                    ),
                }
            }
            Some(Command::Receipt) => {
                let id = frame.header(header::RECEIPT_ID).unwrap_or_default().to_string();
                match self.pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(Ok(frame));
                    }
                    None => tracing::debug!("read_loop: no pending request for {}", id),
                }
            }
            Some(Command::Error) => {
                let mut pending = self.pending.lock().await;
                let waiter = frame
                    .header(header::RECEIPT_ID)
                    .and_then(|id| pending.remove(id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Err(ClientError::from_error_frame(&frame)));
                    }
                    None => {
                        tracing::warn!(
                            "Broker error: {}",
                            frame.header(header::MESSAGE).unwrap_or_default()
                        );
                        for (_, tx) in pending.drain() {
                            let _ = tx.send(Err(ClientError::from_error_frame(&frame)));
                        }
                    }
                }
            }
            _ if frame.is_heartbeat() => {}
            _ => tracing::warn!("read_loop: unexpected {} frame", frame.name),
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().await.take();

        let mut pending = self.pending.lock().await;
        tracing::debug!("Clearing {} pending requests", pending.len());
        pending.clear();
        Ok(())
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.try_lock().map(|p| p.len()).unwrap_or(0)
    }
}
