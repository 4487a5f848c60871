//! Per-session transactions.
//!
//! SEND, ACK and NACK frames carrying a `transaction` header are buffered
//! instead of applied. COMMIT hands them back in arrival order for the
//! session to apply; ABORT drops them. Nothing is applied before COMMIT, so
//! abort has nothing to undo.

use crate::error::BrokerError;
use rstomp_protocol::{Command, Frame};
use std::collections::HashMap;

/// An action deferred until COMMIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionAction {
    Send(Frame),
    Ack(Frame),
    Nack(Frame),
}

impl TransactionAction {
    /// Wraps a transactional frame. Returns `None` for other commands.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        match frame.command()? {
            Command::Send => Some(TransactionAction::Send(frame)),
            Command::Ack => Some(TransactionAction::Ack(frame)),
            Command::Nack => Some(TransactionAction::Nack(frame)),
            _ => None,
        }
    }

    pub fn frame(&self) -> &Frame {
        match self {
            TransactionAction::Send(f) | TransactionAction::Ack(f) | TransactionAction::Nack(f) => f,
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            TransactionAction::Send(f) | TransactionAction::Ack(f) | TransactionAction::Nack(f) => f,
        }
    }
}

/// An open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: String,
    pub actions: Vec<TransactionAction>,
}

impl Transaction {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actions: Vec::new(),
        }
    }
}

/// A session's open transactions. Ids are unique per session only.
#[derive(Debug, Default)]
pub struct TransactionManager {
    open: HashMap<String, Transaction>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, id: &str) -> Result<(), BrokerError> {
        if self.open.contains_key(id) {
            return Err(BrokerError::TransactionExists(id.to_string()));
        }
        self.open.insert(id.to_string(), Transaction::new(id));
        Ok(())
    }

    /// Buffers an action in an open transaction.
    pub fn enqueue(&mut self, id: &str, action: TransactionAction) -> Result<(), BrokerError> {
        self.open
            .get_mut(id)
            .ok_or_else(|| BrokerError::UnknownTransaction(id.to_string()))?
            .actions
            .push(action);
        Ok(())
    }

    /// Closes a transaction and returns its actions in arrival order.
    pub fn commit(&mut self, id: &str) -> Result<Vec<TransactionAction>, BrokerError> {
        self.open
            .remove(id)
            .map(|t| t.actions)
            .ok_or_else(|| BrokerError::UnknownTransaction(id.to_string()))
    }

    /// Discards a transaction. Returns how many actions were dropped.
    pub fn abort(&mut self, id: &str) -> Result<usize, BrokerError> {
        self.open
            .remove(id)
            .map(|t| t.actions.len())
            .ok_or_else(|| BrokerError::UnknownTransaction(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.open.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Returns open transaction ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.open.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Aborts every open transaction. Returns how many were open.
    pub fn rollback_all(&mut self) -> usize {
        let count = self.open.len();
        self.open.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(body: &str) -> TransactionAction {
        let frame = Frame::from_command(Command::Send)
            .with_header("destination", "/queue/a")
            .with_body(body.to_string());
        TransactionAction::from_frame(frame).unwrap()
    }

    #[test]
    fn test_commit_returns_actions_in_order() {
        let mut tx = TransactionManager::new();
        tx.begin("t1").unwrap();
        tx.enqueue("t1", send("1")).unwrap();
        let ack = Frame::from_command(Command::Ack).with_header("id", "9");
        tx.enqueue("t1", TransactionAction::from_frame(ack).unwrap())
            .unwrap();
        tx.enqueue("t1", send("2")).unwrap();

        let actions = tx.commit("t1").unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].frame().body_str(), Some("1"));
        assert!(matches!(actions[1], TransactionAction::Ack(_)));
        assert_eq!(actions[2].frame().body_str(), Some("2"));
        assert!(tx.is_empty());

        // committed exactly once
        assert_eq!(
            tx.commit("t1"),
            Err(BrokerError::UnknownTransaction("t1".to_string()))
        );
    }

    #[test]
    fn test_abort_discards() {
        let mut tx = TransactionManager::new();
        tx.begin("t1").unwrap();
        tx.enqueue("t1", send("1")).unwrap();
        assert_eq!(tx.abort("t1").unwrap(), 1);
        assert!(tx.commit("t1").is_err());
    }

    #[test]
    fn test_duplicate_begin() {
        let mut tx = TransactionManager::new();
        tx.begin("t1").unwrap();
        assert_eq!(
            tx.begin("t1"),
            Err(BrokerError::TransactionExists("t1".to_string()))
        );
        tx.begin("t2").unwrap();
        assert_eq!(tx.ids(), vec!["t1", "t2"]);
        assert_eq!(tx.rollback_all(), 2);
        assert!(tx.is_empty());
    }

    #[test]
    fn test_unknown_transaction() {
        let mut tx = TransactionManager::new();
        assert!(matches!(
            tx.enqueue("nope", send("x")),
            Err(BrokerError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn test_only_transactional_frames_wrap() {
        assert!(TransactionAction::from_frame(Frame::from_command(Command::Subscribe)).is_none());
        assert!(TransactionAction::from_frame(Frame::new("BOGUS")).is_none());
        let action = TransactionAction::from_frame(Frame::from_command(Command::Nack)).unwrap();
        assert_eq!(action.into_frame().command(), Some(Command::Nack));
    }
}
