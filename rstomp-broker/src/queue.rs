//! Named message queues.
//!
//! Each queue keeps a FIFO of undelivered messages and the subscriptions
//! attached to it. Messages are handed out round-robin to subscriptions that
//! have capacity; with no eligible subscriber they stay queued until one
//! appears or frees up.
//!
//! Lock order: the queue lock is taken before a subscription's pending lock.
//! Subscription methods never call back into the queue.

use crate::error::BrokerError;
use crate::sink::SinkError;
use crate::subscription::Subscription;
use parking_lot::Mutex;
use rstomp_protocol::headers::header;
use rstomp_protocol::{Command, Frame};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Headers of a SEND frame that are not copied to the MESSAGE frame.
const SEND_ONLY_HEADERS: &[&str] = &[
    header::DESTINATION,
    header::TRANSACTION,
    header::RECEIPT,
    header::CONTENT_LENGTH,
];

/// A message waiting in a queue or pending acknowledgement.
///
/// `frame` is the MESSAGE frame minus the per-subscription headers, so a
/// redelivery carries the same content as the first delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message_id: String,
    pub frame: Frame,
}

impl QueuedMessage {
    /// Builds a queued message from a SEND frame.
    pub fn from_send(message_id: String, destination: &str, send: &Frame) -> Self {
        let mut frame = Frame::from_command(Command::Message);
        frame.headers.add(header::MESSAGE_ID, message_id.as_str());
        frame.headers.add(header::DESTINATION, destination);
        for (name, value) in send.headers.iter() {
            if !SEND_ONLY_HEADERS
                .iter()
                .any(|h| name.eq_ignore_ascii_case(h))
            {
                frame.headers.add(name, value);
            }
        }
        if let Some(body) = &send.body {
            frame.set_body(body.clone());
        }
        Self { message_id, frame }
    }
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub depth: usize,
    pub subscribers: usize,
    pub enqueued: u64,
    pub delivered: u64,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    subscribers: Vec<Arc<Subscription>>,
    next: usize,
    /// Set once the registry dropped this queue.
    retired: bool,
}

/// A named FIFO queue.
pub struct Queue {
    name: String,
    state: Mutex<QueueState>,
    message_ids: Arc<AtomicU64>,
    enqueued: AtomicU64,
    delivered: AtomicU64,
}

impl Queue {
    pub fn new(name: impl Into<String>, message_ids: Arc<AtomicU64>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            message_ids,
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues the content of a SEND frame and returns the new message id.
    pub fn enqueue(&self, send: &Frame) -> String {
        let mut state = self.state.lock();
        self.enqueue_locked(&mut state, send)
    }

    /// Like [`enqueue`](Self::enqueue), but refuses a retired queue.
    pub(crate) fn enqueue_live(&self, send: &Frame) -> Option<String> {
        let mut state = self.state.lock();
        if state.retired {
            return None;
        }
        Some(self.enqueue_locked(&mut state, send))
    }

    fn enqueue_locked(&self, state: &mut QueueState, send: &Frame) -> String {
        let id = self.message_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let message = QueuedMessage::from_send(id.to_string(), &self.name, send);
        let message_id = message.message_id.clone();
        self.enqueued.fetch_add(1, Ordering::Relaxed);

        state.messages.push_back(message);
        self.dispatch_locked(state);
        message_id
    }

    /// Puts messages back at the end of the queue for redelivery.
    pub fn requeue(&self, messages: Vec<QueuedMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.messages.extend(messages);
        self.dispatch_locked(&mut state);
    }

    /// Attaches a subscription and delivers any waiting messages.
    pub fn subscribe(&self, subscription: Arc<Subscription>) {
        let mut state = self.state.lock();
        state.subscribers.push(subscription);
        self.dispatch_locked(&mut state);
    }

    /// Like [`subscribe`](Self::subscribe), but refuses a retired queue.
    pub(crate) fn subscribe_live(&self, subscription: &Arc<Subscription>) -> bool {
        let mut state = self.state.lock();
        if state.retired {
            return false;
        }
        state.subscribers.push(subscription.clone());
        self.dispatch_locked(&mut state);
        true
    }

    /// Retires the queue if it holds no messages and has no subscribers.
    /// A retired queue refuses [`enqueue_live`](Self::enqueue_live) and
    /// [`subscribe_live`](Self::subscribe_live).
    pub(crate) fn retire_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if state.messages.is_empty() && state.subscribers.is_empty() {
            state.retired = true;
        }
        state.retired
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// Detaches a subscription. Its unacknowledged messages go back to the
    /// front of the queue in their original order. Returns how many.
    pub fn unsubscribe(&self, subscription: &Arc<Subscription>) -> usize {
        subscription.deactivate();
        let mut state = self.state.lock();
        state
            .subscribers
            .retain(|s| !Arc::ptr_eq(s, subscription));
        if state.next >= state.subscribers.len() {
            state.next = 0;
        }

        let pending = subscription.take_pending();
        let count = pending.len();
        for message in pending.into_iter().rev() {
            state.messages.push_front(message);
        }
        self.dispatch_locked(&mut state);
        count
    }

    /// Acknowledges a message and delivers more if capacity freed up.
    pub fn ack(&self, subscription: &Subscription, message_id: &str) -> Result<usize, BrokerError> {
        let settled = subscription.ack(message_id)?;
        self.dispatch();
        Ok(settled.len())
    }

    /// Negatively acknowledges a message; it is appended to the queue for
    /// redelivery.
    pub fn nack(&self, subscription: &Subscription, message_id: &str) -> Result<usize, BrokerError> {
        let settled = subscription.nack(message_id)?;
        let count = settled.len();
        tracing::debug!(
            "Requeueing {} message(s) on {} after NACK of {}",
            count,
            self.name,
            message_id
        );
        self.requeue(settled);
        Ok(count)
    }

    /// Delivers queued messages to subscribers with capacity.
    pub fn dispatch(&self) {
        let mut state = self.state.lock();
        self.dispatch_locked(&mut state);
    }

    fn dispatch_locked(&self, state: &mut QueueState) {
        // subscribers whose sink was full during this pass
        let mut blocked: Vec<Arc<Subscription>> = Vec::new();
        while !state.messages.is_empty() {
            let count = state.subscribers.len();
            let chosen = (0..count).map(|i| (state.next + i) % count).find(|&i| {
                let s = &state.subscribers[i];
                s.has_capacity() && !blocked.iter().any(|b| Arc::ptr_eq(b, s))
            });
            let Some(index) = chosen else {
                return;
            };
            let Some(message) = state.messages.pop_front() else {
                return;
            };

            let subscriber = state.subscribers[index].clone();
            match subscriber.deliver(&message) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    state.next = (index + 1) % count;
                }
                Err(SinkError::Full) => {
                    tracing::debug!(
                        "Outbound buffer of subscription {} on {} is full; keeping message {}",
                        subscriber.id(),
                        self.name,
                        message.message_id
                    );
                    state.messages.push_front(message);
                    blocked.push(subscriber);
                }
                Err(SinkError::Closed) => {
                    tracing::warn!(
                        "Dropping subscription {} on {}: connection closed",
                        subscriber.id(),
                        self.name
                    );
                    subscriber.deactivate();
                    state.subscribers.remove(index);
                    state.next = if state.subscribers.is_empty() {
                        0
                    } else {
                        index % state.subscribers.len()
                    };
                    state.messages.push_front(message);
                }
            }
        }
    }

    /// Returns the number of undelivered messages.
    pub fn depth(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            name: self.name.clone(),
            depth: state.messages.len(),
            subscribers: state.subscribers.len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}
