//! Session management.

use rstomp_broker::{
    MessageSink, QueueRepository, SinkError, SubscriptionSet, TransactionManager,
};
use rstomp_protocol::Frame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Hands MESSAGE frames to a connection's write loop.
///
/// The channel is bounded. When it is full the frame is refused with
/// [`SinkError::Full`], the queue keeps the message, and the sink remembers
/// to ask for a re-dispatch once the write loop has drained.
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<Frame>,
    stalled: Arc<AtomicBool>,
}

impl OutboundSink {
    /// Creates a sink holding up to `capacity` frames and the receiver the
    /// connection drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            stalled: Arc::new(AtomicBool::new(false)),
        };
        (sink, rx)
    }

    /// Returns whether a frame was refused since the last call, and clears
    /// the flag.
    pub fn take_stalled(&self) -> bool {
        self.stalled.swap(false, Ordering::AcqRel)
    }
}

impl MessageSink for OutboundSink {
    fn deliver(&self, frame: Frame) -> Result<(), SinkError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stalled.store(true, Ordering::Release);
                Err(SinkError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for CONNECT.
    Unauthenticated,
    /// CONNECT accepted.
    Connected,
    /// The connection is about to be closed.
    Closing,
}

/// Heart-beat intervals in milliseconds, as carried by the `heart-beat` header:
/// how often the sender will beat, and how often it wants to receive beats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub send_ms: u64,
    pub receive_ms: u64,
}

impl HeartBeat {
    pub fn new(send_ms: u64, receive_ms: u64) -> Self {
        Self {
            send_ms,
            receive_ms,
        }
    }

    /// Parses `"cx,cy"`. Returns `None` for anything else.
    pub fn parse(value: &str) -> Option<Self> {
        let (send, receive) = value.split_once(',')?;
        Some(Self {
            send_ms: send.trim().parse().ok()?,
            receive_ms: receive.trim().parse().ok()?,
        })
    }

    /// Negotiates with the client's offer. Returns the intervals the broker
    /// will actually use: how often it sends, and how long it tolerates
    /// silence from the client. Zero disables either side.
    pub fn negotiate(&self, client: &HeartBeat) -> HeartBeat {
        let pick = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                0
            } else {
                ours.max(theirs)
            }
        };
        HeartBeat {
            send_ms: pick(self.send_ms, client.receive_ms),
            receive_ms: pick(self.receive_ms, client.send_ms),
        }
    }

    pub fn send_interval(&self) -> Option<Duration> {
        (self.send_ms > 0).then(|| Duration::from_millis(self.send_ms))
    }

    pub fn receive_interval(&self) -> Option<Duration> {
        (self.receive_ms > 0).then(|| Duration::from_millis(self.receive_ms))
    }
}

impl std::fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

/// A client session.
///
/// Owned by one connection task. Holds everything that must be released
/// when the connection goes away: subscriptions with their unacknowledged
/// messages, and open transactions.
pub struct Session {
    /// Unique session ID.
    pub id: String,

    /// Remote address.
    pub remote_addr: SocketAddr,

    state: SessionState,

    /// Negotiated protocol version.
    version: Option<String>,

    login: Option<String>,

    heart_beat: HeartBeat,

    /// Where this session's subscriptions deliver.
    outbound: Arc<dyn MessageSink>,

    subscriptions: SubscriptionSet,

    transactions: TransactionManager,

    failed_logins: u32,

    frames_received: u64,

    frames_sent: u64,

    created_at: Instant,

    last_activity: Instant,

    closed: bool,
}

impl Session {
    /// Creates a new session.
    pub fn new(remote_addr: SocketAddr, outbound: Arc<dyn MessageSink>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            state: SessionState::Unauthenticated,
            version: None,
            login: None,
            heart_beat: HeartBeat::default(),
            outbound,
            subscriptions: SubscriptionSet::new(),
            transactions: TransactionManager::new(),
            failed_logins: 0,
            frames_received: 0,
            frames_sent: 0,
            created_at: Instant::now(),
            last_activity: Instant::now(),
            closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Completes CONNECT.
    pub fn connect(&mut self, version: &str, login: Option<String>, heart_beat: HeartBeat) {
        self.version = Some(version.to_string());
        self.login = login;
        self.heart_beat = heart_beat;
        self.state = SessionState::Connected;
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }

    /// Negotiated heart-beat intervals.
    pub fn heart_beat(&self) -> HeartBeat {
        self.heart_beat
    }

    pub fn outbound(&self) -> Arc<dyn MessageSink> {
        self.outbound.clone()
    }

    /// Records a failed CONNECT and returns the running total.
    pub fn record_failed_login(&mut self) -> u32 {
        self.failed_logins += 1;
        self.failed_logins
    }

    pub fn failed_logins(&self) -> u32 {
        self.failed_logins
    }

    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionSet {
        &mut self.subscriptions
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn transactions_mut(&mut self) -> &mut TransactionManager {
        &mut self.transactions
    }

    /// Records an inbound frame (heart-beats included).
    pub fn record_received(&mut self) {
        self.frames_received += 1;
        self.last_activity = Instant::now();
    }

    pub fn record_sent(&mut self) {
        self.frames_sent += 1;
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Marks inbound traffic that did not complete a frame.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Asks every queue this session subscribes to for another delivery
    /// round. Returns how many queues were dispatched.
    pub fn resume_deliveries(&self, registry: &dyn QueueRepository) -> usize {
        let mut resumed = 0;
        for subscription in self.subscriptions.iter() {
            if let Some(queue) = registry.get(subscription.queue_name()) {
                queue.dispatch();
                resumed += 1;
            }
        }
        resumed
    }

    /// Releases everything the session holds. Subscriptions are detached and
    /// their unacknowledged messages requeued; open transactions are dropped.
    /// Only the first call does anything; returns whether this was it.
    pub fn close(&mut self, registry: &dyn QueueRepository) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.state = SessionState::Closing;

        let mut requeued = 0;
        for subscription in self.subscriptions.drain() {
            requeued += registry.unsubscribe(&subscription);
        }
        let rolled_back = self.transactions.rollback_all();

        tracing::debug!(
            "[{}] Session {} closed: {} message(s) requeued, {} transaction(s) rolled back",
            self.remote_addr,
            self.id,
            requeued,
            rolled_back
        );
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("subscriptions", &self.subscriptions.len())
            .field("transactions", &self.transactions.len())
            .finish()
    }
}
