//! Queue lookup shared by all sessions.

use crate::queue::{Queue, QueueStats};
use crate::subscription::Subscription;
use dashmap::DashMap;
use rstomp_protocol::Frame;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Resolves destination names to queues.
pub trait QueueRepository: Send + Sync {
    /// Returns the queue for `name`, creating it on first use.
    fn get_or_create(&self, name: &str) -> Arc<Queue>;

    /// Returns the queue for `name` if it exists.
    fn get(&self, name: &str) -> Option<Arc<Queue>>;

    /// Enqueues a SEND frame on `name` and returns the message id.
    fn send(&self, name: &str, frame: &Frame) -> String {
        self.get_or_create(name).enqueue(frame)
    }

    /// Attaches a subscription to the queue it names.
    fn subscribe(&self, subscription: &Arc<Subscription>) {
        self.get_or_create(subscription.queue_name())
            .subscribe(subscription.clone());
    }

    /// Detaches a subscription and returns how many unacknowledged messages
    /// went back to its queue.
    fn unsubscribe(&self, subscription: &Arc<Subscription>) -> usize {
        match self.get(subscription.queue_name()) {
            Some(queue) => queue.unsubscribe(subscription),
            None => {
                subscription.deactivate();
                0
            }
        }
    }
}

/// In-memory queue registry.
///
/// Message ids come from one counter shared by every queue, so they are
/// unique across destinations.
#[derive(Default)]
pub struct QueueRegistry {
    queues: DashMap<String, Arc<Queue>>,
    message_ids: Arc<AtomicU64>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Returns queue names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Drops the queue for `name` if it has no messages and no subscribers.
    ///
    /// The queue is retired under its own lock while the map entry is
    /// removed, so a sender or subscriber still holding it looks the name up
    /// again instead of landing on a queue nobody can reach.
    pub fn evict_if_idle(&self, name: &str) -> bool {
        let evicted = self
            .queues
            .remove_if(name, |_, queue| queue.retire_if_idle())
            .is_some();
        if evicted {
            tracing::debug!("Dropping idle queue {}", name);
        }
        evicted
    }

    /// Returns statistics for every queue, sorted by name.
    pub fn stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<_> = self.queues.iter().map(|e| e.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

impl QueueRepository for QueueRegistry {
    fn get_or_create(&self, name: &str) -> Arc<Queue> {
        if let Some(queue) = self.queues.get(name) {
            return queue.clone();
        }
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating queue {}", name);
                Arc::new(Queue::new(name, self.message_ids.clone()))
            })
            .clone()
    }

    fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| q.clone())
    }

    fn send(&self, name: &str, frame: &Frame) -> String {
        loop {
            if let Some(id) = self.get_or_create(name).enqueue_live(frame) {
                return id;
            }
        }
    }

    fn subscribe(&self, subscription: &Arc<Subscription>) {
        while !self
            .get_or_create(subscription.queue_name())
            .subscribe_live(subscription)
        {}
    }

    fn unsubscribe(&self, subscription: &Arc<Subscription>) -> usize {
        let name = subscription.queue_name();
        let Some(queue) = self.get(name) else {
            subscription.deactivate();
            return 0;
        };
        let requeued = queue.unsubscribe(subscription);
        self.evict_if_idle(name);
        requeued
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.queues.len())
            .finish()
    }
}
