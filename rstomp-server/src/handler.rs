//! Frame handlers.
//!
//! Every inbound frame goes through [`FrameHandler::handle`], which returns
//! at most one reply: CONNECTED, RECEIPT or ERROR. MESSAGE frames never come
//! from here; queues push them through the session's outbound sink.

use crate::auth::{AuthenticationService, CredentialStore, LoginResult};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::session::{HeartBeat, Session, SessionState};
use bytes::{BufMut, BytesMut};
use rstomp_broker::{
    AckMode, BrokerError, QueueRepository, Subscription, TransactionAction,
};
use rstomp_protocol::headers::header;
use rstomp_protocol::{Command, Frame, SUPPORTED_VERSIONS};
use std::sync::Arc;

/// What the broker says about itself in CONNECTED.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    /// Heart-beat intervals the broker offers.
    pub heart_beat: HeartBeat,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "rstomp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            heart_beat: HeartBeat::new(10_000, 10_000),
        }
    }
}

impl ServerInfo {
    /// Value of the CONNECTED `server` header.
    pub fn server_header(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

/// Frame handler shared by all connections.
pub struct FrameHandler {
    registry: Arc<dyn QueueRepository>,
    auth: Arc<dyn AuthenticationService>,
    info: ServerInfo,
    /// Failed CONNECT attempts before the session is closed (0 = unlimited).
    max_failed_logins: u32,
    metrics: Option<Arc<Metrics>>,
}

impl FrameHandler {
    /// Creates a handler that accepts every CONNECT.
    pub fn new(registry: Arc<dyn QueueRepository>) -> Self {
        Self {
            registry,
            auth: Arc::new(CredentialStore::disabled()),
            info: ServerInfo::default(),
            max_failed_logins: 5,
            metrics: None,
        }
    }

    /// Sets the authentication service.
    pub fn with_auth(mut self, auth: Arc<dyn AuthenticationService>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_max_failed_logins(mut self, max: u32) -> Self {
        self.max_failed_logins = max;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<dyn QueueRepository> {
        &self.registry
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Handles one inbound frame and returns the reply, if any.
    pub fn handle(&self, session: &mut Session, frame: &Frame) -> Option<Frame> {
        session.record_received();
        if frame.is_heartbeat() || session.state() == SessionState::Closing {
            return None;
        }

        let label = frame
            .command()
            .map(|c| c.as_str())
            .unwrap_or("UNKNOWN");
        let timer = self.metrics.as_ref().map(|m| {
            m.frames_total.with_label_values(&[label]).inc();
            m.frame_duration.with_label_values(&[label]).start_timer()
        });

        tracing::debug!("[{}] Frame: {}", session.remote_addr, label);

        let receipt = frame.header(header::RECEIPT);
        let result = self.dispatch(session, frame);
        drop(timer);

        match result {
            Ok(Some(reply)) => Some(reply),
            Ok(None) => receipt.map(receipt_frame),
            Err(e) => {
                tracing::debug!("[{}] {} rejected: {}", session.remote_addr, label, e);
                if let Some(ref metrics) = self.metrics {
                    metrics
                        .errors_total
                        .with_label_values(&[e.error_code().as_str()])
                        .inc();
                }
                if e.is_fatal() {
                    session.set_state(SessionState::Closing);
                }
                Some(error_frame(&e, Some(frame), receipt))
            }
        }
    }

    fn dispatch(&self, session: &mut Session, frame: &Frame) -> Result<Option<Frame>, ServerError> {
        let command = match frame.command() {
            Some(c) if c.is_client_command() => c,
            _ => return Err(ServerError::UnknownCommand(frame.name.clone())),
        };

        match command {
            Command::Connect | Command::Stomp => return self.handle_connect(session, frame),
            Command::Disconnect if !session.is_connected() => {
                session.set_state(SessionState::Closing);
                return Ok(None);
            }
            _ if !session.is_connected() => return Err(ServerError::NotConnected),
            _ => {}
        }

        match command {
            Command::Send => self.handle_send(session, frame),
            Command::Subscribe => self.handle_subscribe(session, frame),
            Command::Unsubscribe => self.handle_unsubscribe(session, frame),
            Command::Ack => self.handle_ack(session, frame, false),
            Command::Nack => self.handle_ack(session, frame, true),
            Command::Begin => self.handle_begin(session, frame),
            Command::Commit => self.handle_commit(session, frame),
            Command::Abort => self.handle_abort(session, frame),
            Command::Disconnect => self.handle_disconnect(session),
            Command::Connect
            | Command::Stomp
            | Command::Connected
            | Command::Message
            | Command::Receipt
            | Command::Error => Err(ServerError::UnknownCommand(frame.name.clone())),
        }
        .map(|()| None)
    }

    fn handle_connect(
        &self,
        session: &mut Session,
        frame: &Frame,
    ) -> Result<Option<Frame>, ServerError> {
        if session.is_connected() {
            return Err(ServerError::AlreadyConnected);
        }

        let version = negotiate_version(frame.header(header::ACCEPT_VERSION))?;
        let login = frame.header(header::LOGIN);

        if self.auth.is_active() {
            let result = self
                .auth
                .login(login.unwrap_or(""), frame.header(header::PASSCODE).unwrap_or(""));
            if result != LoginResult::Accepted {
                let failures = session.record_failed_login();
                tracing::warn!(
                    "[{}] Login failed for {:?} ({:?}, attempt {})",
                    session.remote_addr,
                    login.unwrap_or(""),
                    result,
                    failures
                );
                if self.max_failed_logins > 0 && failures >= self.max_failed_logins {
                    tracing::warn!(
                        "[{}] Too many failed logins, closing",
                        session.remote_addr
                    );
                    session.set_state(SessionState::Closing);
                }
                return Err(ServerError::AuthFailed(
                    "invalid login or passcode".to_string(),
                ));
            }
        }

        // 1.0 has no heart-beating
        let client_beat = match version {
            "1.0" => HeartBeat::default(),
            _ => frame
                .header(header::HEART_BEAT)
                .and_then(HeartBeat::parse)
                .unwrap_or_default(),
        };
        let agreed = self.info.heart_beat.negotiate(&client_beat);
        session.connect(version, login.map(str::to_string), agreed);

        tracing::info!(
            "[{}] Session {} connected (STOMP {}, heart-beat {})",
            session.remote_addr,
            session.id,
            version,
            agreed
        );

        let mut connected = Frame::from_command(Command::Connected)
            .with_header(header::VERSION, version)
            .with_header(header::SERVER, self.info.server_header())
            .with_header(header::SESSION, session.id.clone());
        if version != "1.0" {
            connected = connected.with_header(header::HEART_BEAT, self.info.heart_beat.to_string());
        }
        Ok(Some(connected))
    }

    fn handle_send(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        required(frame, header::DESTINATION)?;
        if let Some(tx) = frame.header(header::TRANSACTION) {
            return Ok(session
                .transactions_mut()
                .enqueue(tx, TransactionAction::Send(frame.clone()))?);
        }
        self.apply_send(session, frame)
    }

    fn apply_send(&self, session: &Session, frame: &Frame) -> Result<(), ServerError> {
        let destination = required(frame, header::DESTINATION)?;
        let message_id = self.registry.send(destination, frame);
        if let Some(ref metrics) = self.metrics {
            metrics.messages_enqueued_total.inc();
        }
        tracing::debug!(
            "[{}] Enqueued message {} on {}",
            session.remote_addr,
            message_id,
            destination
        );
        Ok(())
    }

    fn handle_subscribe(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let id = required(frame, header::ID)?;
        let destination = required(frame, header::DESTINATION)?;
        let ack_mode = match frame.header(header::ACK) {
            Some(mode) => AckMode::parse(mode)?,
            None => AckMode::default(),
        };
        let prefetch = match frame.header(header::PREFETCH_COUNT) {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| BrokerError::InvalidPrefetch(raw.to_string()))?,
            None => 0,
        };

        if session.subscriptions().contains(id) {
            return Err(BrokerError::DuplicateSubscription(id.to_string()).into());
        }

        let subscription = Arc::new(
            Subscription::new(id, destination, ack_mode, session.outbound())
                .with_session(session.id.clone())
                .with_prefetch(prefetch),
        );
        session.subscriptions_mut().insert(subscription.clone())?;
        self.registry.subscribe(&subscription);

        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_active.inc();
        }
        tracing::debug!(
            "[{}] Subscribed {} to {} (ack {})",
            session.remote_addr,
            id,
            destination,
            ack_mode.as_str()
        );
        Ok(())
    }

    fn handle_unsubscribe(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let id = required(frame, header::ID)?;
        let subscription = session.subscriptions_mut().remove(id)?;
        let requeued = self.registry.unsubscribe(&subscription);

        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_active.dec();
        }
        tracing::debug!(
            "[{}] Unsubscribed {} ({} message(s) requeued)",
            session.remote_addr,
            id,
            requeued
        );
        Ok(())
    }

    fn handle_ack(&self, session: &mut Session, frame: &Frame, nack: bool) -> Result<(), ServerError> {
        ack_id(frame)?;
        if let Some(tx) = frame.header(header::TRANSACTION) {
            let action = if nack {
                TransactionAction::Nack(frame.clone())
            } else {
                TransactionAction::Ack(frame.clone())
            };
            return Ok(session.transactions_mut().enqueue(tx, action)?);
        }
        self.apply_ack(session, frame, nack)
    }

    fn apply_ack(&self, session: &Session, frame: &Frame, nack: bool) -> Result<(), ServerError> {
        let message_id = ack_id(frame)?;
        let subscription = match frame.header(header::SUBSCRIPTION) {
            Some(id) => session.subscriptions().get(id)?,
            None => session.subscriptions().find_pending(message_id)?,
        };
        let queue = self.registry.get_or_create(subscription.queue_name());
        let settled = if nack {
            queue.nack(subscription, message_id)?
        } else {
            queue.ack(subscription, message_id)?
        };

        tracing::debug!(
            "[{}] {} {} on {} settled {} message(s)",
            session.remote_addr,
            if nack { "NACK" } else { "ACK" },
            message_id,
            subscription.id(),
            settled
        );
        Ok(())
    }

    fn handle_begin(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let tx = required(frame, header::TRANSACTION)?;
        session.transactions_mut().begin(tx)?;
        Ok(())
    }

    /// Applies buffered actions in arrival order. A failing action does not
    /// stop the rest; the first failure is reported.
    fn handle_commit(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let tx = required(frame, header::TRANSACTION)?;
        let actions = session.transactions_mut().commit(tx)?;
        let count = actions.len();

        let mut first_error = None;
        for action in actions {
            let result = match &action {
                TransactionAction::Send(f) => self.apply_send(session, f),
                TransactionAction::Ack(f) => self.apply_ack(session, f, false),
                TransactionAction::Nack(f) => self.apply_ack(session, f, true),
            };
            if let Err(e) = result {
                tracing::warn!(
                    "[{}] Transaction {}: {} failed: {}",
                    session.remote_addr,
                    tx,
                    action.frame().name,
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        tracing::debug!(
            "[{}] Committed transaction {} ({} action(s))",
            session.remote_addr,
            tx,
            count
        );
        first_error.map_or(Ok(()), Err)
    }

    fn handle_abort(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let tx = required(frame, header::TRANSACTION)?;
        let dropped = session.transactions_mut().abort(tx)?;
        tracing::debug!(
            "[{}] Aborted transaction {} ({} action(s) dropped)",
            session.remote_addr,
            tx,
            dropped
        );
        Ok(())
    }

    fn handle_disconnect(&self, session: &mut Session) -> Result<(), ServerError> {
        if !session.transactions().is_empty() {
            return Err(ServerError::TransactionsOpen(
                session.transactions().ids().join(","),
            ));
        }
        session.set_state(SessionState::Closing);
        Ok(())
    }

    /// Dispatches the session's queues again after its outbound buffer drained.
    pub fn resume_deliveries(&self, session: &Session) {
        let resumed = session.resume_deliveries(self.registry.as_ref());
        tracing::debug!(
            "[{}] Outbound buffer drained, resumed {} queue(s)",
            session.remote_addr,
            resumed
        );
    }

    /// Releases the session's subscriptions and transactions. Safe to call
    /// more than once.
    pub fn close_session(&self, session: &mut Session) {
        let subscriptions = session.subscriptions().len();
        if session.close(self.registry.as_ref()) {
            if let Some(ref metrics) = self.metrics {
                metrics.subscriptions_active.sub(subscriptions as f64);
            }
        }
    }
}

/// Picks the highest version both sides support. A missing header means 1.0.
pub fn negotiate_version(accept_version: Option<&str>) -> Result<&'static str, ServerError> {
    let Some(accepted) = accept_version else {
        return Ok(SUPPORTED_VERSIONS[0]);
    };
    let offered: Vec<&str> = accepted.split(',').map(str::trim).collect();
    SUPPORTED_VERSIONS
        .iter()
        .rev()
        .find(|v| offered.contains(v))
        .copied()
        .ok_or_else(|| ServerError::UnsupportedProtocol(SUPPORTED_VERSIONS.join(",")))
}

fn required<'a>(frame: &'a Frame, name: &'static str) -> Result<&'a str, ServerError> {
    frame.header(name).ok_or(ServerError::MissingHeader(name))
}

/// ACK/NACK name the message by `id` (1.2) or `message-id` (1.0, 1.1).
fn ack_id(frame: &Frame) -> Result<&str, ServerError> {
    frame
        .header(header::ID)
        .or_else(|| frame.header(header::MESSAGE_ID))
        .ok_or(ServerError::MissingHeader(header::ID))
}

pub fn receipt_frame(receipt_id: &str) -> Frame {
    Frame::from_command(Command::Receipt).with_header(header::RECEIPT_ID, receipt_id)
}

/// Builds an ERROR frame. The body repeats the description followed by the
/// offending frame, headers and body included.
pub fn error_frame(error: &ServerError, offending: Option<&Frame>, receipt: Option<&str>) -> Frame {
    let description = error.to_string();
    let mut frame = Frame::from_command(Command::Error)
        .with_header(header::MESSAGE, single_line(&description))
        .with_header(header::CODE, error.error_code().as_str());
    if let ServerError::UnsupportedProtocol(versions) = error {
        frame = frame.with_header(header::VERSION, versions.clone());
    }
    if let Some(receipt) = receipt {
        frame = frame.with_header(header::RECEIPT_ID, receipt);
    }
    frame = frame.with_header(header::CONTENT_TYPE, "text/plain");

    let mut body = BytesMut::new();
    body.put_slice(description.as_bytes());
    body.put_u8(b'\n');
    if let Some(offending) = offending {
        body.put_slice(b"-----\n");
        let mut head = BytesMut::new();
        offending.encode_head(&mut head);
        body.put_slice(&head);
        if let Some(payload) = &offending.body {
            body.put_slice(payload);
        }
        body.put_slice(b"\n-----\n");
    }
    frame.with_body(body.freeze())
}

/// Header values must not contain line breaks.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OutboundSink;
    use rstomp_broker::QueueRegistry;
    use rstomp_protocol::ErrorCode;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::sync::mpsc::Receiver;

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345)
    }

    fn test_handler() -> (Arc<QueueRegistry>, FrameHandler) {
        let registry = Arc::new(QueueRegistry::new());
        let handler = FrameHandler::new(registry.clone());
        (registry, handler)
    }

    fn test_session() -> (Session, Receiver<Frame>) {
        let (sink, rx) = OutboundSink::channel(64);
        (Session::new(test_addr(), Arc::new(sink)), rx)
    }

    fn connect_frame() -> Frame {
        Frame::from_command(Command::Connect)
            .with_header("accept-version", "1.1,1.2")
            .with_header("host", "localhost")
    }

    fn connected(handler: &FrameHandler) -> (Session, Receiver<Frame>) {
        let (mut session, rx) = test_session();
        let reply = handler.handle(&mut session, &connect_frame()).unwrap();
        assert_eq!(reply.command(), Some(Command::Connected));
        (session, rx)
    }

    fn send(destination: &str, body: &str) -> Frame {
        Frame::from_command(Command::Send)
            .with_header("destination", destination)
            .with_body(body.to_string())
    }

    fn subscribe(id: &str, destination: &str, ack: &str) -> Frame {
        Frame::from_command(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", ack)
    }

    fn ack(command: Command, id: &str) -> Frame {
        Frame::from_command(command).with_header("id", id)
    }

    fn drain(rx: &mut Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn bodies(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f.body_str().unwrap_or("").to_string())
            .collect()
    }

    fn error_code(reply: &Frame) -> Option<&str> {
        assert_eq!(reply.command(), Some(Command::Error));
        reply.header("code")
    }

    #[test]
    fn test_connect() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = test_session();

        let frame = connect_frame().with_header("heart-beat", "0,30000");
        let reply = handler.handle(&mut session, &frame).unwrap();
        assert_eq!(reply.command(), Some(Command::Connected));
        assert_eq!(reply.header("version"), Some("1.2"));
        assert_eq!(reply.header("session"), Some(session.id.as_str()));
        assert_eq!(reply.header("heart-beat"), Some("10000,10000"));
        assert!(reply.header("server").unwrap().starts_with("rstomp/"));
        assert!(session.is_connected());
        assert_eq!(session.heart_beat(), HeartBeat::new(30_000, 0));
    }

    #[test]
    fn test_version_negotiation() {
        assert_eq!(negotiate_version(None).unwrap(), "1.0");
        assert_eq!(negotiate_version(Some("1.0,1.1")).unwrap(), "1.1");
        assert_eq!(negotiate_version(Some("1.2, 2.0")).unwrap(), "1.2");
        assert!(matches!(
            negotiate_version(Some("2.0")),
            Err(ServerError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_connect_without_accept_version_is_1_0() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = test_session();
        let reply = handler
            .handle(&mut session, &Frame::from_command(Command::Connect))
            .unwrap();
        assert_eq!(reply.header("version"), Some("1.0"));
        assert!(reply.header("heart-beat").is_none());
    }

    #[test]
    fn test_unsupported_version() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = test_session();
        let frame = Frame::from_command(Command::Stomp).with_header("accept-version", "3.0");
        let reply = handler.handle(&mut session, &frame).unwrap();
        assert_eq!(error_code(&reply), Some("UNSUPPORTED_PROTOCOL"));
        assert_eq!(reply.header("version"), Some("1.0,1.1,1.2"));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_frames_before_connect_rejected() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = test_session();
        let reply = handler.handle(&mut session, &send("/queue/a", "x")).unwrap();
        assert_eq!(error_code(&reply), Some("NOT_CONNECTED"));
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn test_double_connect() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = connected(&handler);
        let reply = handler.handle(&mut session, &connect_frame()).unwrap();
        assert_eq!(error_code(&reply), Some("ALREADY_CONNECTED"));
        assert!(session.is_connected());
    }

    #[test]
    fn test_auth() {
        let registry = Arc::new(QueueRegistry::new());
        let store = CredentialStore::new(
            true,
            vec![("guest".to_string(), CredentialStore::hash_passcode("guest"))],
        );
        let handler = FrameHandler::new(registry).with_auth(Arc::new(store));

        let (mut session, _rx) = test_session();
        let reply = handler
            .handle(&mut session, &connect_frame().with_header("login", "guest"))
            .unwrap();
        assert_eq!(error_code(&reply), Some("AUTH_FAILED"));
        assert_eq!(reply.header("message"), Some("authentication failed: invalid login or passcode"));

        let frame = connect_frame()
            .with_header("login", "guest")
            .with_header("passcode", "guest");
        let reply = handler.handle(&mut session, &frame).unwrap();
        assert_eq!(reply.command(), Some(Command::Connected));
        assert_eq!(session.login(), Some("guest"));
    }

    #[test]
    fn test_login_attempt_limit() {
        let registry = Arc::new(QueueRegistry::new());
        let store = CredentialStore::new(true, Vec::new());
        let handler = FrameHandler::new(registry)
            .with_auth(Arc::new(store))
            .with_max_failed_logins(3);

        let (mut session, _rx) = test_session();
        for attempt in 1..=3 {
            let reply = handler.handle(&mut session, &connect_frame()).unwrap();
            assert_eq!(error_code(&reply), Some("AUTH_FAILED"));
            assert_eq!(session.failed_logins(), attempt);
        }
        assert_eq!(session.state(), SessionState::Closing);
        // closing sessions ignore further frames
        assert!(handler.handle(&mut session, &connect_frame()).is_none());
    }

    #[test]
    fn test_unknown_command_keeps_connection() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = connected(&handler);

        let bogus = Frame::new("FLY").with_header("to", "moon").with_body("now");
        let reply = handler.handle(&mut session, &bogus).unwrap();
        assert_eq!(error_code(&reply), Some("UNKNOWN_COMMAND"));
        let body = reply.body_str().unwrap();
        assert!(body.starts_with("unknown command: FLY\n"));
        assert!(body.contains("FLY\nto:moon\n"));
        assert!(body.contains("now"));
        assert!(session.is_connected());

        // server frames are not accepted from clients
        let reply = handler
            .handle(&mut session, &Frame::from_command(Command::Message))
            .unwrap();
        assert_eq!(error_code(&reply), Some("UNKNOWN_COMMAND"));
    }

    #[test]
    fn test_missing_headers() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = connected(&handler);

        let cases = vec![
            (Frame::from_command(Command::Send), "destination"),
            (
                Frame::from_command(Command::Subscribe).with_header("destination", "/queue/a"),
                "id",
            ),
            (Frame::from_command(Command::Unsubscribe), "id"),
            (Frame::from_command(Command::Ack), "id"),
            (Frame::from_command(Command::Begin), "transaction"),
        ];
        for (frame, missing) in cases {
            let reply = handler.handle(&mut session, &frame).unwrap();
            assert_eq!(error_code(&reply), Some("MISSING_HEADER"));
            assert!(reply.header("message").unwrap().ends_with(missing));
        }
        assert!(session.is_connected());
    }

    #[test]
    fn test_receipt() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = connected(&handler);

        let reply = handler
            .handle(&mut session, &send("/queue/a", "x").with_header("receipt", "r-1"))
            .unwrap();
        assert_eq!(reply.command(), Some(Command::Receipt));
        assert_eq!(reply.header("receipt-id"), Some("r-1"));

        assert!(handler.handle(&mut session, &send("/queue/a", "y")).is_none());

        let reply = handler
            .handle(
                &mut session,
                &Frame::from_command(Command::Send).with_header("receipt", "r-2"),
            )
            .unwrap();
        assert_eq!(error_code(&reply), Some("MISSING_HEADER"));
        assert_eq!(reply.header("receipt-id"), Some("r-2"));
    }

    #[test]
    fn test_subscribe_send_message() {
        let (registry, handler) = test_handler();
        let (mut session, mut rx) = connected(&handler);

        assert!(handler
            .handle(&mut session, &subscribe("s1", "/queue/a", "auto"))
            .is_none());
        handler.handle(&mut session, &send("/queue/a", "hello"));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let message = &frames[0];
        assert_eq!(message.command(), Some(Command::Message));
        assert_eq!(message.header("subscription"), Some("s1"));
        assert_eq!(message.header("destination"), Some("/queue/a"));
        assert!(message.header("message-id").is_some());
        assert!(message.header("ack").is_none());
        assert_eq!(message.body_str(), Some("hello"));
        assert_eq!(registry.get("/queue/a").unwrap().depth(), 0);
    }

    #[test]
    fn test_duplicate_subscription() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "auto"));
        let reply = handler
            .handle(&mut session, &subscribe("s1", "/queue/b", "auto"))
            .unwrap();
        assert_eq!(error_code(&reply), Some("DUPLICATE_SUBSCRIPTION"));
    }

    #[test]
    fn test_invalid_ack_mode_and_prefetch() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = connected(&handler);
        let reply = handler
            .handle(&mut session, &subscribe("s1", "/queue/a", "sometimes"))
            .unwrap();
        assert_eq!(error_code(&reply), Some("INVALID_ACK_MODE"));

        let frame = subscribe("s2", "/queue/a", "client").with_header("prefetch-count", "lots");
        let reply = handler.handle(&mut session, &frame).unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::InvalidAckMode.as_str()));
        assert!(session.subscriptions().is_empty());
    }

    #[test]
    fn test_client_ack_is_cumulative() {
        let (registry, handler) = test_handler();
        let (mut session, mut rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "client"));
        for body in ["1", "2", "3"] {
            handler.handle(&mut session, &send("/queue/a", body));
        }
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        let second = frames[1].header("ack").unwrap().to_string();

        assert!(handler.handle(&mut session, &ack(Command::Ack, &second)).is_none());
        let sub = session.subscriptions().get("s1").unwrap().clone();
        assert_eq!(sub.pending_len(), 1);

        // already settled
        let reply = handler.handle(&mut session, &ack(Command::Ack, &second)).unwrap();
        assert_eq!(error_code(&reply), Some("UNKNOWN_MESSAGE"));
        assert_eq!(registry.get("/queue/a").unwrap().depth(), 0);
    }

    #[test]
    fn test_client_individual_ack() {
        let (_registry, handler) = test_handler();
        let (mut session, mut rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "client-individual"));
        for body in ["1", "2", "3"] {
            handler.handle(&mut session, &send("/queue/a", body));
        }
        let frames = drain(&mut rx);
        let second = frames[1].header("ack").unwrap().to_string();

        // 1.0 style message-id header plus explicit subscription
        let frame = Frame::from_command(Command::Ack)
            .with_header("message-id", second.clone())
            .with_header("subscription", "s1");
        assert!(handler.handle(&mut session, &frame).is_none());

        let sub = session.subscriptions().get("s1").unwrap().clone();
        assert_eq!(sub.pending_len(), 2);
        assert!(!sub.has_pending(&second));
    }

    #[test]
    fn test_nack_redelivers_same_content() {
        let (registry, handler) = test_handler();
        let (mut session, mut rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "client-individual"));
        handler.handle(
            &mut session,
            &send("/queue/a", "payload").with_header("priority", "9"),
        );
        let first = drain(&mut rx).remove(0);
        let id = first.header("ack").unwrap().to_string();

        assert!(handler.handle(&mut session, &ack(Command::Nack, &id)).is_none());
        let again = drain(&mut rx).remove(0);
        assert_eq!(again, first);
        assert_eq!(again.header("priority"), Some("9"));
        assert_eq!(registry.get("/queue/a").unwrap().depth(), 0);
    }

    #[test]
    fn test_ack_unknown_message() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "client"));
        let reply = handler.handle(&mut session, &ack(Command::Ack, "999")).unwrap();
        assert_eq!(error_code(&reply), Some("UNKNOWN_MESSAGE"));

        let frame = ack(Command::Ack, "999").with_header("subscription", "nope");
        let reply = handler.handle(&mut session, &frame).unwrap();
        assert_eq!(error_code(&reply), Some("UNKNOWN_SUBSCRIPTION"));
    }

    #[test]
    fn test_unsubscribe_requeues_pending() {
        let (registry, handler) = test_handler();
        let (mut session, mut rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "client"));
        handler.handle(&mut session, &send("/queue/a", "1"));
        handler.handle(&mut session, &send("/queue/a", "2"));
        assert_eq!(drain(&mut rx).len(), 2);

        let unsubscribe = Frame::from_command(Command::Unsubscribe).with_header("id", "s1");
        assert!(handler.handle(&mut session, &unsubscribe).is_none());
        let queue = registry.get("/queue/a").unwrap();
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.subscriber_count(), 0);

        let reply = handler.handle(&mut session, &unsubscribe).unwrap();
        assert_eq!(error_code(&reply), Some("UNKNOWN_SUBSCRIPTION"));
    }

    #[test]
    fn test_unsubscribe_drops_idle_queue() {
        let (registry, handler) = test_handler();
        let (mut session, mut rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "auto"));
        handler.handle(&mut session, &send("/queue/a", "1"));
        assert_eq!(bodies(&drain(&mut rx)), vec!["1"]);
        assert!(registry.get("/queue/a").is_some());

        let unsubscribe = Frame::from_command(Command::Unsubscribe).with_header("id", "s1");
        assert!(handler.handle(&mut session, &unsubscribe).is_none());
        assert!(registry.get("/queue/a").is_none());

        // the destination comes back on the next send
        handler.handle(&mut session, &send("/queue/a", "2"));
        assert_eq!(registry.get("/queue/a").unwrap().depth(), 1);
    }

    #[test]
    fn test_transaction_commit_applies_in_order() {
        let (registry, handler) = test_handler();
        let (mut session, mut rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "auto"));

        let begin = Frame::from_command(Command::Begin).with_header("transaction", "t1");
        assert!(handler.handle(&mut session, &begin).is_none());
        for body in ["1", "2", "3"] {
            let frame = send("/queue/a", body).with_header("transaction", "t1");
            assert!(handler.handle(&mut session, &frame).is_none());
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.get("/queue/a").unwrap().depth(), 0);

        let commit = Frame::from_command(Command::Commit)
            .with_header("transaction", "t1")
            .with_header("receipt", "c");
        let reply = handler.handle(&mut session, &commit).unwrap();
        assert_eq!(reply.command(), Some(Command::Receipt));
        assert_eq!(bodies(&drain(&mut rx)), vec!["1", "2", "3"]);

        // committed exactly once
        let reply = handler.handle(&mut session, &commit).unwrap();
        assert_eq!(error_code(&reply), Some("UNKNOWN_TRANSACTION"));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_transaction_abort_applies_nothing() {
        let (registry, handler) = test_handler();
        let (mut session, mut rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "client"));
        handler.handle(&mut session, &send("/queue/a", "m"));
        let id = drain(&mut rx)[0].header("ack").unwrap().to_string();

        let begin = Frame::from_command(Command::Begin).with_header("transaction", "t1");
        handler.handle(&mut session, &begin);
        handler.handle(
            &mut session,
            &send("/queue/a", "x").with_header("transaction", "t1"),
        );
        handler.handle(
            &mut session,
            &ack(Command::Ack, &id).with_header("transaction", "t1"),
        );
        let abort = Frame::from_command(Command::Abort).with_header("transaction", "t1");
        assert!(handler.handle(&mut session, &abort).is_none());

        let sub = session.subscriptions().get("s1").unwrap().clone();
        assert!(sub.has_pending(&id));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.get("/queue/a").unwrap().stats().enqueued, 1);
    }

    #[test]
    fn test_transactional_frame_needs_open_transaction() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = connected(&handler);
        let frame = send("/queue/a", "x").with_header("transaction", "nope");
        let reply = handler.handle(&mut session, &frame).unwrap();
        assert_eq!(error_code(&reply), Some("UNKNOWN_TRANSACTION"));

        let begin = Frame::from_command(Command::Begin).with_header("transaction", "t");
        handler.handle(&mut session, &begin);
        let reply = handler.handle(&mut session, &begin).unwrap();
        assert_eq!(error_code(&reply), Some("TRANSACTION_EXISTS"));
    }

    #[test]
    fn test_disconnect_with_open_transaction_rejected() {
        let (_registry, handler) = test_handler();
        let (mut session, _rx) = connected(&handler);
        let begin = Frame::from_command(Command::Begin).with_header("transaction", "t1");
        handler.handle(&mut session, &begin);

        let disconnect = Frame::from_command(Command::Disconnect).with_header("receipt", "bye");
        let reply = handler.handle(&mut session, &disconnect).unwrap();
        assert_eq!(error_code(&reply), Some("TRANSACTIONS_OPEN"));
        assert!(session.is_connected());

        let abort = Frame::from_command(Command::Abort).with_header("transaction", "t1");
        handler.handle(&mut session, &abort);
        let reply = handler.handle(&mut session, &disconnect).unwrap();
        assert_eq!(reply.command(), Some(Command::Receipt));
        assert_eq!(reply.header("receipt-id"), Some("bye"));
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn test_close_session_requeues() {
        let (registry, handler) = test_handler();
        let (mut session, mut rx) = connected(&handler);
        handler.handle(&mut session, &subscribe("s1", "/queue/a", "client"));
        handler.handle(&mut session, &send("/queue/a", "1"));
        drain(&mut rx);

        handler.close_session(&mut session);
        handler.close_session(&mut session);
        assert_eq!(registry.get("/queue/a").unwrap().depth(), 1);

        // a second consumer gets the message
        let (mut other, mut other_rx) = connected(&handler);
        handler.handle(&mut other, &subscribe("s1", "/queue/a", "auto"));
        assert_eq!(bodies(&drain(&mut other_rx)), vec!["1"]);
    }

    #[test]
    fn test_error_frame_header_is_single_line() {
        let err = ServerError::AuthFailed("bad\r\nthing".to_string());
        let frame = error_frame(&err, None, Some("r"));
        assert_eq!(frame.header("message"), Some("authentication failed: bad  thing"));
        assert_eq!(frame.header("receipt-id"), Some("r"));
        assert_eq!(frame.header("code"), Some("AUTH_FAILED"));
    }

    #[test]
    fn test_metrics_recorded() {
        let registry = Arc::new(QueueRegistry::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let handler = FrameHandler::new(registry).with_metrics(metrics.clone());
        let (mut session, _rx) = connected(&handler);
        handler.handle(&mut session, &send("/queue/a", "x"));
        handler.handle(&mut session, &Frame::from_command(Command::Send));

        assert_eq!(metrics.messages_enqueued_total.get(), 1.0);
        assert_eq!(
            metrics.frames_total.with_label_values(&["SEND"]).get(),
            2.0
        );
        assert_eq!(
            metrics
                .errors_total
                .with_label_values(&["MISSING_HEADER"])
                .get(),
            1.0
        );
    }
}
