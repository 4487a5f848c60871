//! TCP and WebSocket server implementation.

use crate::channel::{Channel, TcpChannel, WebSocketChannel};
use crate::config::Config;
use crate::error::ServerError;
use crate::handler::{error_frame, FrameHandler};
use crate::metrics::Metrics;
use crate::session::{OutboundSink, Session, SessionState};
use crate::stream::MaybeTlsStream;
use rstomp_buffer::{BufferPool, BufferSegment};
use rstomp_protocol::{Frame, FrameDecoder, FrameEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address of the STOMP listener.
    pub bind_addr: SocketAddr,
    /// Address of the STOMP-over-WebSocket listener, if enabled.
    pub websocket_addr: Option<SocketAddr>,
    /// Idle connection timeout, used until heart-beats are negotiated.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections across both listeners.
    pub max_connections: usize,
    pub max_header_size: usize,
    pub max_body_size: usize,
    /// Payload size at which outgoing WebSocket messages are fragmented.
    pub websocket_fragment_size: usize,
    /// MESSAGE frames buffered per connection before queues hold back.
    pub outbound_queue_size: usize,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("websocket_addr", &self.websocket_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("max_header_size", &self.max_header_size)
            .field("max_body_size", &self.max_body_size)
            .field("outbound_queue_size", &self.outbound_queue_size)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], rstomp_protocol::DEFAULT_PORT)),
            websocket_addr: None,
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            max_header_size: rstomp_protocol::MAX_HEADER_SIZE,
            max_body_size: rstomp_protocol::MAX_BODY_SIZE,
            websocket_fragment_size: 64 * 1024,
            outbound_queue_size: 1024,
            tls_acceptor: None,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Takes listener addresses and limits from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            websocket_addr: config.network.websocket_bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            max_header_size: config.protocol.max_header_size,
            max_body_size: config.protocol.max_body_size,
            websocket_fragment_size: config.protocol.websocket_fragment_size,
            outbound_queue_size: config.network.outbound_queue_size,
            tls_acceptor: None,
            metrics: None,
        }
    }

    pub fn with_websocket(mut self, addr: SocketAddr) -> Self {
        self.websocket_addr = Some(addr);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// Which protocol a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    /// STOMP frames directly on the (TLS) stream.
    Stomp,
    /// STOMP frames inside WebSocket messages.
    WebSocket,
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub frames_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Everything a connection task needs from the server.
#[derive(Clone)]
struct ConnectionContext {
    config: ServerConfig,
    handler: Arc<FrameHandler>,
    pool: Arc<BufferPool>,
    stats: Arc<ServerStats>,
}

/// STOMP broker server.
pub struct Server {
    config: ServerConfig,
    handler: Arc<FrameHandler>,
    pool: Arc<BufferPool>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, handler: Arc<FrameHandler>, pool: Arc<BufferPool>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler,
            pool,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured listeners and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let stomp = TcpListener::bind(self.config.bind_addr).await?;
        match self.config.websocket_addr {
            Some(addr) => {
                let websocket = TcpListener::bind(addr).await?;
                tokio::try_join!(
                    self.serve(stomp, Listener::Stomp),
                    self.serve(websocket, Listener::WebSocket)
                )?;
            }
            None => self.serve(stomp, Listener::Stomp).await?,
        }
        Ok(())
    }

    /// Accepts connections on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener, kind: Listener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!("{:?} listener on {} ({})", kind, local_addr, tls_mode);

        let ctx = ConnectionContext {
            config: self.config.clone(),
            handler: self.handler.clone(),
            pool: self.pool.clone(),
            stats: self.stats.clone(),
        };

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_active.inc();
                            }

                            let ctx = ctx.clone();
                            let conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(Self::spawn_connection(tcp_stream, addr, kind, ctx, conn_shutdown));
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("{:?} listener on {} shutting down", kind, local_addr);
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn spawn_connection(
        tcp_stream: TcpStream,
        addr: SocketAddr,
        kind: Listener,
        ctx: ConnectionContext,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let result = match MaybeTlsStream::accept(tcp_stream, ctx.config.tls_acceptor.as_deref(), addr).await {
            Ok(stream) => match kind {
                Listener::Stomp => {
                    Self::handle_connection(TcpChannel::new(stream, addr), &ctx, &mut shutdown).await
                }
                Listener::WebSocket => {
                    let channel = WebSocketChannel::new(stream, addr)
                        .with_max_message_size(
                            (ctx.config.max_header_size + ctx.config.max_body_size) as u64,
                        )
                        .with_fragment_size(ctx.config.websocket_fragment_size);
                    Self::handle_connection(channel, &ctx, &mut shutdown).await
                }
            },
            Err(e) => {
                tracing::warn!("[{}] TLS handshake failed: {}", addr, e);
                Err(e)
            }
        };

        if let Err(e) = result {
            tracing::debug!("[{}] Connection error: {}", addr, e);
            ctx.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        ctx.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref metrics) = ctx.config.metrics {
            metrics.connections_active.dec();
        }
        tracing::info!("Client disconnected: {}", addr);
    }

    /// Runs one connection from handshake to cleanup.
    async fn handle_connection<C: Channel>(
        mut channel: C,
        ctx: &ConnectionContext,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = channel.remote_addr();
        channel.open().await?;
        tracing::info!("Client connected: {} ({})", addr, channel.transport());
        if let Some(ref metrics) = ctx.config.metrics {
            metrics
                .connections_total
                .with_label_values(&[channel.transport()])
                .inc();
        }

        let (read_segment, write_segment) = match Self::checkout_segments(&ctx.pool) {
            Ok(segments) => segments,
            Err(e) => {
                tracing::warn!("[{}] {}", addr, e);
                let _ = channel.send(&error_frame(&e, None, None).encode()).await;
                let _ = channel.close().await;
                return Err(e);
            }
        };

        let (sink, outbound_rx) = OutboundSink::channel(ctx.config.outbound_queue_size);
        let mut conn = Connection {
            channel,
            session: Session::new(addr, Arc::new(sink.clone())),
            outbound: sink,
            outbound_rx,
            decoder: FrameDecoder::with_limits(ctx.config.max_header_size, ctx.config.max_body_size),
            encoder: FrameEncoder::new(),
            read_segment,
            write_segment,
            last_write: Instant::now(),
        };

        let result = conn.run(ctx, shutdown).await;

        ctx.handler.close_session(&mut conn.session);
        let Connection {
            mut channel,
            session,
            read_segment,
            write_segment,
            ..
        } = conn;
        for segment in [read_segment, write_segment] {
            if let Err(e) = ctx.pool.release(segment) {
                tracing::error!("[{}] Failed to release buffer: {}", addr, e);
            }
        }
        if let Err(e) = channel.close().await {
            tracing::debug!("[{}] Close error: {}", addr, e);
        }
        tracing::debug!(
            "[{}] Session {} ended after {:?}: {} frame(s) in, {} frame(s) out",
            addr,
            session.id,
            session.age(),
            session.frames_received(),
            session.frames_sent()
        );
        result
    }

    fn checkout_segments(pool: &BufferPool) -> Result<(BufferSegment, BufferSegment), ServerError> {
        let read = pool.checkout()?;
        match pool.checkout() {
            Ok(write) => Ok((read, write)),
            Err(e) => {
                pool.release(read)?;
                Err(e.into())
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

/// Per-connection state owned by the connection task.
struct Connection<C> {
    channel: C,
    session: Session,
    outbound: OutboundSink,
    outbound_rx: mpsc::Receiver<Frame>,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    read_segment: BufferSegment,
    write_segment: BufferSegment,
    last_write: Instant,
}

impl<C: Channel> Connection<C> {
    async fn run(
        &mut self,
        ctx: &ConnectionContext,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = self.session.remote_addr;

        loop {
            let beat = self
                .session
                .heart_beat()
                .send_interval()
                .filter(|_| self.session.is_connected());
            let tolerance = self.read_tolerance(ctx.config.idle_timeout);

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    if self.session.is_connected() {
                        let frame = error_frame(&ServerError::ShuttingDown, None, None);
                        let _ = self.write_frame(&frame).await;
                        let _ = self.channel.flush().await;
                    }
                    return Ok(());
                }

                Some(frame) = self.outbound_rx.recv() => {
                    let mut delivered = 1;
                    self.write_frame(&frame).await?;
                    // drain whatever else is already queued before flushing
                    while let Ok(frame) = self.outbound_rx.try_recv() {
                        self.write_frame(&frame).await?;
                        delivered += 1;
                    }
                    self.channel.flush().await?;
                    if let Some(ref metrics) = ctx.config.metrics {
                        metrics.messages_delivered_total.inc_by(delivered as f64);
                    }
                    if self.outbound.take_stalled() {
                        ctx.handler.resume_deliveries(&self.session);
                    }
                }

                result = self.channel.receive_more(&mut self.read_segment) => {
                    let n = result?;
                    if n == 0 {
                        tracing::debug!("[{}] Connection closed by client", addr);
                        return Ok(());
                    }
                    tracing::debug!("[{}] Received {} bytes", addr, n);
                    self.session.touch();
                    self.process_input(ctx).await?;
                    self.channel.flush().await?;
                    if self.session.state() == SessionState::Closing {
                        tracing::debug!("[{}] Session closing", addr);
                        return Ok(());
                    }
                }

                _ = sleep(beat.unwrap_or_default().saturating_sub(self.last_write.elapsed())), if beat.is_some() => {
                    if beat.is_some_and(|interval| self.last_write.elapsed() >= interval) {
                        self.write_frame(&Frame::heartbeat()).await?;
                        self.channel.flush().await?;
                    }
                }

                _ = sleep(tolerance.saturating_sub(self.session.idle_duration())) => {
                    if self.session.idle_duration() >= tolerance {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Decodes and handles every complete frame in the read segment.
    async fn process_input(&mut self, ctx: &ConnectionContext) -> Result<(), ServerError> {
        loop {
            let frame = match self.decoder.decode(&mut self.read_segment) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    let error = ServerError::from(e);
                    tracing::debug!("[{}] Malformed input: {}", self.session.remote_addr, error);
                    self.decoder.reset();
                    self.read_segment.reset();
                    ctx.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref metrics) = ctx.config.metrics {
                        metrics
                            .errors_total
                            .with_label_values(&[error.error_code().as_str()])
                            .inc();
                    }
                    self.write_frame(&error_frame(&error, None, None)).await?;
                    if error.is_fatal() {
                        self.session.set_state(SessionState::Closing);
                    }
                    return Ok(());
                }
            };

            ctx.stats.frames_total.fetch_add(1, Ordering::Relaxed);
            if let Some(reply) = ctx.handler.handle(&mut self.session, &frame) {
                self.write_frame(&reply).await?;
            }
            if self.session.state() == SessionState::Closing {
                break;
            }
        }
        self.read_segment.compact();
        Ok(())
    }

    /// Writes one frame through the write segment, as many passes as it takes.
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        self.encoder.prepare(frame);
        loop {
            self.write_segment.reset();
            let n = self.encoder.fill(&mut self.write_segment);
            self.channel.send(self.write_segment.unread()).await?;
            if self.encoder.on_send_completed(n) {
                break;
            }
        }
        if !frame.is_heartbeat() {
            self.session.record_sent();
        }
        self.last_write = Instant::now();
        Ok(())
    }

    /// How long the peer may stay silent. Once heart-beats are agreed the
    /// negotiated interval applies, with the same margin for network delay.
    fn read_tolerance(&self, idle_timeout: Duration) -> Duration {
        match self.session.heart_beat().receive_interval() {
            Some(interval) if self.session.is_connected() => interval * 2,
            _ => idle_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialStore;
    use bytes::BytesMut;
    use rstomp_broker::{QueueRegistry, QueueRepository};
    use rstomp_buffer::PoolConfig;
    use rstomp_protocol::Command;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_server(pool: BufferPool) -> Arc<Server> {
        let registry = Arc::new(QueueRegistry::new());
        let handler = Arc::new(
            FrameHandler::new(registry).with_auth(Arc::new(CredentialStore::disabled())),
        );
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        Arc::new(Server::new(config, handler, Arc::new(pool)))
    }

    async fn start(server: &Arc<Server>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener, Listener::Stomp).await });
        addr
    }

    struct TestClient {
        stream: TcpStream,
        decoder: FrameDecoder,
        buf: BytesMut,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                decoder: FrameDecoder::new(),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, frame: Frame) {
            self.stream.write_all(&frame.encode()).await.unwrap();
        }

        /// Next frame other than a heart-beat.
        async fn recv(&mut self) -> Frame {
            loop {
                while let Some(frame) = self.decoder.decode_buf(&mut self.buf).unwrap() {
                    if !frame.is_heartbeat() {
                        return frame;
                    }
                }
                let mut chunk = [0u8; 1024];
                let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "server closed the connection");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        async fn stomp_connect(&mut self) -> Frame {
            self.send(
                Frame::from_command(Command::Connect)
                    .with_header("accept-version", "1.2")
                    .with_header("host", "localhost")
                    .with_header("heart-beat", "0,0"),
            )
            .await;
            self.recv().await
        }
    }

    #[tokio::test]
    async fn test_server_basic() {
        let server = test_server(BufferPool::new(PoolConfig::new(4096)));
        assert!(!server.is_running());
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_subscribe_send_message_over_tcp() {
        let server = test_server(BufferPool::new(PoolConfig::new(4096).with_preallocated(4)));
        let addr = start(&server).await;

        let mut consumer = TestClient::connect(addr).await;
        let connected = consumer.stomp_connect().await;
        assert_eq!(connected.command(), Some(Command::Connected));
        assert_eq!(connected.header("version"), Some("1.2"));

        consumer
            .send(
                Frame::from_command(Command::Subscribe)
                    .with_header("id", "sub-0")
                    .with_header("destination", "/queue/orders")
                    .with_header("receipt", "r-sub"),
            )
            .await;
        assert_eq!(consumer.recv().await.header("receipt-id"), Some("r-sub"));

        let mut producer = TestClient::connect(addr).await;
        producer.stomp_connect().await;
        producer
            .send(
                Frame::from_command(Command::Send)
                    .with_header("destination", "/queue/orders")
                    .with_header("receipt", "r-send")
                    .with_body("order #1"),
            )
            .await;
        let receipt = producer.recv().await;
        assert_eq!(receipt.command(), Some(Command::Receipt));
        assert_eq!(receipt.header("receipt-id"), Some("r-send"));

        let message = consumer.recv().await;
        assert_eq!(message.command(), Some(Command::Message));
        assert_eq!(message.header("subscription"), Some("sub-0"));
        assert_eq!(message.header("destination"), Some("/queue/orders"));
        assert_eq!(message.body_str(), Some("order #1"));

        producer
            .send(Frame::from_command(Command::Disconnect).with_header("receipt", "bye"))
            .await;
        assert_eq!(producer.recv().await.header("receipt-id"), Some("bye"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_frame_split_across_writes() {
        let server = test_server(BufferPool::new(PoolConfig::new(4096)));
        let addr = start(&server).await;

        let mut client = TestClient::connect(addr).await;
        let bytes = Frame::from_command(Command::Connect)
            .with_header("accept-version", "1.1,1.2")
            .encode();
        for chunk in bytes.chunks(3) {
            client.stream.write_all(chunk).await.unwrap();
            client.stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(client.recv().await.command(), Some(Command::Connected));
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let server = test_server(BufferPool::new(PoolConfig::new(4096)));
        let addr = start(&server).await;

        let mut client = TestClient::connect(addr).await;
        client.stomp_connect().await;
        client
            .stream
            .write_all(b"SEND\ndestination:/queue/a\ncontent-length:2\n\nabc\0")
            .await
            .unwrap();

        let error = client.recv().await;
        assert_eq!(error.command(), Some(Command::Error));
        assert_eq!(error.header("code"), Some("MALFORMED_FRAME"));

        let mut rest = Vec::new();
        client.stream.read_to_end(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_exhaustion_rejects_connection() {
        // room for exactly one connection's two segments
        let pool = BufferPool::new(PoolConfig::new(1024).with_pain_threshold(2048));
        let server = test_server(pool);
        let addr = start(&server).await;

        let mut first = TestClient::connect(addr).await;
        assert_eq!(first.stomp_connect().await.command(), Some(Command::Connected));

        let mut second = TestClient::connect(addr).await;
        let error = second.recv().await;
        assert_eq!(error.command(), Some(Command::Error));
        assert_eq!(error.header("code"), Some("RESOURCE_EXHAUSTED"));
        assert_eq!(server.pool().stats().checked_out, 2);
    }

    #[tokio::test]
    async fn test_disconnect_releases_buffers_and_requeues() {
        let server = test_server(BufferPool::new(PoolConfig::new(4096)));
        let addr = start(&server).await;

        let mut client = TestClient::connect(addr).await;
        client.stomp_connect().await;
        client
            .send(
                Frame::from_command(Command::Subscribe)
                    .with_header("id", "0")
                    .with_header("destination", "/queue/jobs")
                    .with_header("ack", "client"),
            )
            .await;
        client
            .send(
                Frame::from_command(Command::Send)
                    .with_header("destination", "/queue/jobs")
                    .with_body("job"),
            )
            .await;
        assert_eq!(client.recv().await.command(), Some(Command::Message));
        drop(client);

        let queue = loop {
            if server.pool().stats().checked_out == 0 {
                break server.handler.registry().get("/queue/jobs").unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let registry = Arc::new(QueueRegistry::new());
        let handler = Arc::new(FrameHandler::new(registry));
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_idle_timeout(Duration::from_millis(100));
        let server = Arc::new(Server::new(
            config,
            handler,
            Arc::new(BufferPool::new(PoolConfig::new(1024))),
        ));
        let addr = start(&server).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let server = test_server(BufferPool::new(PoolConfig::new(1024)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener, Listener::Stomp).await })
        };
        while !server.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_websocket_client_reaches_tcp_subscriber() {
        use rstomp_protocol::websocket::{
            handshake, Opcode, WebSocketDecoder, WebSocketEncoder, WebSocketEvent,
        };

        let server = test_server(BufferPool::new(PoolConfig::new(4096).with_preallocated(4)));
        let addr = start(&server).await;
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve(ws_listener, Listener::WebSocket).await });
        }

        let mut consumer = TestClient::connect(addr).await;
        consumer.stomp_connect().await;
        consumer
            .send(
                Frame::from_command(Command::Subscribe)
                    .with_header("id", "0")
                    .with_header("destination", "/queue/ws")
                    .with_header("receipt", "r-sub"),
            )
            .await;
        consumer.recv().await;

        let mut ws = TcpStream::connect(ws_addr).await.unwrap();
        ws.write_all(&handshake::client_request(
            "localhost",
            "/stomp",
            "dGhlIHNhbXBsZSBub25jZQ==",
            &["v12.stomp"],
        ))
        .await
        .unwrap();

        let encoder = WebSocketEncoder::new(16).with_masking_key([1, 2, 3, 4]);
        let mut out = BytesMut::new();
        let connect = Frame::from_command(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", "localhost")
            .encode();
        encoder.encode(Opcode::Text, &connect, &mut out);
        let send = Frame::from_command(Command::Send)
            .with_header("destination", "/queue/ws")
            .with_header("receipt", "r-send")
            .with_body("over websocket")
            .encode();
        encoder.encode(Opcode::Text, &send, &mut out);
        ws.write_all(&out).await.unwrap();

        // skip the upgrade response, then collect STOMP frames from WebSocket messages
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            ws.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        assert!(head.starts_with(b"HTTP/1.1 101"));

        let mut ws_decoder = WebSocketDecoder::client();
        let mut stomp_decoder = FrameDecoder::new();
        let mut stomp_buf = BytesMut::new();
        let mut replies = Vec::new();
        while replies.len() < 2 {
            match ws_decoder.decode().unwrap() {
                Some(WebSocketEvent::Frame(frame)) => {
                    stomp_buf.extend_from_slice(&frame.payload);
                    while let Some(reply) = stomp_decoder.decode_buf(&mut stomp_buf).unwrap() {
                        if !reply.is_heartbeat() {
                            replies.push(reply);
                        }
                    }
                }
                Some(WebSocketEvent::Upgrade(_)) => unreachable!(),
                None => {
                    let mut chunk = [0u8; 1024];
                    let n = tokio::time::timeout(Duration::from_secs(5), ws.read(&mut chunk))
                        .await
                        .unwrap()
                        .unwrap();
                    assert!(n > 0);
                    ws_decoder.extend(&chunk[..n]);
                }
            }
        }
        assert_eq!(replies[0].command(), Some(Command::Connected));
        assert_eq!(replies[1].header("receipt-id"), Some("r-send"));

        let message = consumer.recv().await;
        assert_eq!(message.body_str(), Some("over websocket"));
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 2);

        server.shutdown();
    }
}
