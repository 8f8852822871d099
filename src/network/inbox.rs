//! Per-session inbound queue and confirmation bookkeeping.

use crate::network::message::MessageId;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    File { filename: String },
}

/// How much the receiver knows about who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authenticity {
    /// Signature checked against the sender's public key.
    Verified,
    /// Sent without a signature.
    Unsigned,
    /// Signed, but no public key was available to check it.
    Unverified,
}

/// Application content delivered by the dispatcher.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub sender: String,
    pub kind: ContentKind,
    pub content: Vec<u8>,
    pub authenticity: Authenticity,
    pub encrypted: bool,
    pub received_at: DateTime<Utc>,
}

impl ReceivedMessage {
    pub fn text(&self) -> Option<String> {
        match self.kind {
            ContentKind::Text => Some(String::from_utf8_lossy(&self.content).into_owned()),
            ContentKind::File { .. } => None,
        }
    }
}

/// Held messages kept per session; the oldest is dropped beyond this.
pub const MAX_HELD_MESSAGES: usize = 64;

/// FIFO of trusted messages plus a holding area for messages awaiting a decision.
#[derive(Debug, Default)]
pub struct Inbox {
    queue: VecDeque<ReceivedMessage>,
    quarantine: VecDeque<ReceivedMessage>,
}

impl Inbox {
    pub fn push(&mut self, message: ReceivedMessage) {
        self.queue.push_back(message);
    }

    pub fn pop(&mut self) -> Option<ReceivedMessage> {
        self.queue.pop_front()
    }

    pub fn peek(&self) -> Option<&ReceivedMessage> {
        self.queue.front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Hold a message for a decision. Returns the oldest held message if it had
    /// to make room.
    pub fn hold(&mut self, message: ReceivedMessage) -> Option<ReceivedMessage> {
        let evicted = if self.quarantine.len() >= MAX_HELD_MESSAGES {
            self.quarantine.pop_front()
        } else {
            None
        };
        self.quarantine.push_back(message);
        evicted
    }

    pub fn held(&self) -> Vec<ReceivedMessage> {
        self.quarantine.iter().cloned().collect()
    }

    /// Move a held message into the queue. Returns false if no such message is held.
    pub fn release(&mut self, id: MessageId) -> bool {
        let released = self
            .quarantine
            .iter()
            .position(|m| m.id == id)
            .and_then(|pos| self.quarantine.remove(pos));
        match released {
            Some(message) => {
                self.queue.push_back(message);
                true
            }
            None => false,
        }
    }

    pub fn discard(&mut self, id: MessageId) -> bool {
        let before = self.quarantine.len();
        self.quarantine.retain(|m| m.id != id);
        self.quarantine.len() != before
    }
}

/// Ids this side waits on, and acknowledgements that have arrived for them.
#[derive(Debug, Default)]
pub struct Confirmations {
    awaiting: HashSet<MessageId>,
    received: HashSet<MessageId>,
}

impl Confirmations {
    /// Returns false if `id` is already pending.
    pub fn register(&mut self, id: MessageId) -> bool {
        if self.received.contains(&id) {
            return false;
        }
        self.awaiting.insert(id)
    }

    /// Record an acknowledgement. Unsolicited ids are ignored.
    pub fn record(&mut self, id: MessageId) -> bool {
        if self.awaiting.remove(&id) {
            self.received.insert(id);
            true
        } else {
            false
        }
    }

    /// Consume an acknowledgement if it has arrived.
    pub fn take(&mut self, id: MessageId) -> bool {
        self.received.remove(&id)
    }

    pub fn forget(&mut self, id: MessageId) {
        self.awaiting.remove(&id);
        self.received.remove(&id);
    }

    pub fn is_pending(&self, id: MessageId) -> bool {
        self.awaiting.contains(&id) || self.received.contains(&id)
    }

    pub fn pending(&self) -> usize {
        self.awaiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> ReceivedMessage {
        ReceivedMessage {
            id: MessageId::random(),
            sender: "bob".to_string(),
            kind: ContentKind::Text,
            content: content.as_bytes().to_vec(),
            authenticity: Authenticity::Unsigned,
            encrypted: false,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut inbox = Inbox::default();
        inbox.push(message("one"));
        inbox.push(message("two"));

        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.peek().unwrap().text().unwrap(), "one");
        assert_eq!(inbox.pop().unwrap().text().unwrap(), "one");
        assert_eq!(inbox.pop().unwrap().text().unwrap(), "two");
        assert!(inbox.pop().is_none());
    }

    #[test]
    fn test_quarantine_release_and_discard() {
        let mut inbox = Inbox::default();
        let kept = message("kept");
        let dropped = message("dropped");
        let (kept_id, dropped_id) = (kept.id, dropped.id);
        inbox.hold(kept);
        inbox.hold(dropped);

        assert!(inbox.is_empty());
        assert_eq!(inbox.held().len(), 2);

        assert!(inbox.release(kept_id));
        assert!(!inbox.release(kept_id));
        assert!(inbox.discard(dropped_id));
        assert!(!inbox.discard(dropped_id));

        assert_eq!(inbox.pop().unwrap().id, kept_id);
        assert!(inbox.held().is_empty());
    }

    #[test]
    fn test_quarantine_drops_oldest_when_full() {
        let mut inbox = Inbox::default();
        let first = message("first");
        let first_id = first.id;
        assert!(inbox.hold(first).is_none());
        for i in 1..MAX_HELD_MESSAGES {
            assert!(inbox.hold(message(&format!("held {}", i))).is_none());
        }
        assert_eq!(inbox.held().len(), MAX_HELD_MESSAGES);

        let evicted = inbox.hold(message("one too many")).unwrap();
        assert_eq!(evicted.id, first_id);
        assert_eq!(inbox.held().len(), MAX_HELD_MESSAGES);
        assert!(!inbox.release(first_id));
        assert_eq!(inbox.held().last().unwrap().text().unwrap(), "one too many");
    }

    #[test]
    fn test_confirmation_lifecycle() {
        let mut confirmations = Confirmations::default();
        let id = MessageId::random();

        assert!(confirmations.register(id));
        assert!(!confirmations.register(id));
        assert!(!confirmations.take(id));

        assert!(confirmations.record(id));
        assert!(confirmations.is_pending(id));
        assert!(confirmations.take(id));
        assert!(!confirmations.is_pending(id));
    }

    #[test]
    fn test_unsolicited_confirmation_ignored() {
        let mut confirmations = Confirmations::default();
        assert!(!confirmations.record(MessageId::random()));
        assert_eq!(confirmations.pending(), 0);
    }

    #[test]
    fn test_forget_clears_timed_out_id() {
        let mut confirmations = Confirmations::default();
        let id = MessageId::random();
        confirmations.register(id);
        confirmations.forget(id);
        assert!(!confirmations.is_pending(id));
        // A late acknowledgement no longer counts
        assert!(!confirmations.record(id));
    }
}
