//! Subscriptions and per-subscription acknowledgement state.

use crate::error::BrokerError;
use crate::queue::QueuedMessage;
use crate::sink::{MessageSink, SinkError};
use parking_lot::Mutex;
use rstomp_protocol::headers::header;
use rstomp_protocol::Frame;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Acknowledgement mode requested in SUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Messages count as acknowledged once sent.
    #[default]
    Auto,
    /// ACK acknowledges the given message and every earlier one.
    Client,
    /// ACK acknowledges only the given message.
    ClientIndividual,
}

impl AckMode {
    pub fn parse(value: &str) -> Result<Self, BrokerError> {
        match value {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(BrokerError::InvalidAckMode(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Returns whether delivered messages wait for ACK/NACK.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

/// A consumer attached to one queue.
///
/// Owned by a session and shared with the queue for delivery. The pending
/// list holds delivered but unacknowledged messages in delivery order.
pub struct Subscription {
    id: String,
    queue_name: String,
    session_id: String,
    ack_mode: AckMode,
    prefetch: Option<usize>,
    pending: Mutex<VecDeque<QueuedMessage>>,
    sink: Arc<dyn MessageSink>,
    active: AtomicBool,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        queue_name: impl Into<String>,
        ack_mode: AckMode,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            id: id.into(),
            queue_name: queue_name.into(),
            session_id: String::new(),
            ack_mode,
            prefetch: None,
            pending: Mutex::new(VecDeque::new()),
            sink,
            active: AtomicBool::new(true),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Limits unacknowledged messages. Ignored in auto mode; zero means no limit.
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = (prefetch > 0).then_some(prefetch);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn prefetch(&self) -> Option<usize> {
        self.prefetch
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Returns whether another message may be delivered now.
    pub fn has_capacity(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        match (self.ack_mode.requires_ack(), self.prefetch) {
            (true, Some(max)) => self.pending.lock().len() < max,
            _ => true,
        }
    }

    /// Returns the ids of unacknowledged messages in delivery order.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending
            .lock()
            .iter()
            .map(|m| m.message_id.clone())
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn has_pending(&self, message_id: &str) -> bool {
        self.pending
            .lock()
            .iter()
            .any(|m| m.message_id == message_id)
    }

    /// Builds the MESSAGE frame for this subscription.
    pub fn message_frame(&self, message: &QueuedMessage) -> Frame {
        let mut frame = message.frame.clone();
        frame.headers.set(header::SUBSCRIPTION, self.id.as_str());
        if self.ack_mode.requires_ack() {
            frame.headers.set(header::ACK, message.message_id.as_str());
        }
        frame
    }

    /// Sends a message to the sink, recording it as pending when the ack
    /// mode requires it. Nothing is recorded if the sink refuses the frame.
    pub(crate) fn deliver(&self, message: &QueuedMessage) -> Result<(), SinkError> {
        let frame = self.message_frame(message);
        if !self.ack_mode.requires_ack() {
            return self.sink.deliver(frame);
        }
        let mut pending = self.pending.lock();
        pending.push_back(message.clone());
        let result = self.sink.deliver(frame);
        if result.is_err() {
            pending.pop_back();
        }
        result
    }

    /// Removes acknowledged messages from the pending list.
    ///
    /// In client mode this includes every message delivered before
    /// `message_id`.
    pub fn ack(&self, message_id: &str) -> Result<Vec<QueuedMessage>, BrokerError> {
        self.settle(message_id)
    }

    /// Removes negatively acknowledged messages from the pending list, using
    /// the same scope as [`ack`](Self::ack). The caller requeues them.
    pub fn nack(&self, message_id: &str) -> Result<Vec<QueuedMessage>, BrokerError> {
        self.settle(message_id)
    }

    fn settle(&self, message_id: &str) -> Result<Vec<QueuedMessage>, BrokerError> {
        let mut pending = self.pending.lock();
        let pos = pending
            .iter()
            .position(|m| m.message_id == message_id)
            .ok_or_else(|| BrokerError::UnknownMessage(message_id.to_string()))?;
        let settled = match self.ack_mode {
            AckMode::Client => pending.drain(..=pos).collect(),
            _ => pending.remove(pos).into_iter().collect(),
        };
        Ok(settled)
    }

    /// Takes every pending message, oldest first.
    pub fn take_pending(&self) -> Vec<QueuedMessage> {
        self.pending.lock().drain(..).collect()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("queue", &self.queue_name)
            .field("session", &self.session_id)
            .field("ack_mode", &self.ack_mode)
            .field("pending", &self.pending_len())
            .field("active", &self.is_active())
            .finish()
    }
}

/// A session's subscriptions, keyed by the client-chosen id.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    by_id: HashMap<String, Arc<Subscription>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription. Ids are unique within the set.
    pub fn insert(&mut self, subscription: Arc<Subscription>) -> Result<(), BrokerError> {
        if self.by_id.contains_key(subscription.id()) {
            return Err(BrokerError::DuplicateSubscription(
                subscription.id().to_string(),
            ));
        }
        self.by_id
            .insert(subscription.id().to_string(), subscription);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<&Arc<Subscription>, BrokerError> {
        self.by_id
            .get(id)
            .ok_or_else(|| BrokerError::UnknownSubscription(id.to_string()))
    }

    pub fn remove(&mut self, id: &str) -> Result<Arc<Subscription>, BrokerError> {
        self.by_id
            .remove(id)
            .ok_or_else(|| BrokerError::UnknownSubscription(id.to_string()))
    }

    /// Finds the subscription holding a pending message.
    pub fn find_pending(&self, message_id: &str) -> Result<&Arc<Subscription>, BrokerError> {
        self.by_id
            .values()
            .find(|s| s.has_pending(message_id))
            .ok_or_else(|| BrokerError::UnknownMessage(message_id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subscription>> {
        self.by_id.values()
    }

    /// Removes and returns every subscription.
    pub fn drain(&mut self) -> Vec<Arc<Subscription>> {
        self.by_id.drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
