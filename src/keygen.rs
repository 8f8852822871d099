//! Hand-off point for `KEYGEN_*` messages.
//!
//! Key generation runs outside the session. The receive loop only forwards the
//! messages, so it never waits on the key-generation side.

use crate::network::message::{MessageType, WireMessage};
use tokio::sync::mpsc;
use tracing::warn;

/// A key-generation message received from a peer.
#[derive(Debug, Clone)]
pub struct KeygenEvent {
    pub peer: String,
    pub message: WireMessage,
}

impl KeygenEvent {
    pub fn kind(&self) -> MessageType {
        self.message.message_type()
    }
}

/// Receives key-generation messages from the dispatcher. Implementations must not block.
pub trait KeygenSink: Send + Sync {
    fn deliver(&self, peer: &str, message: WireMessage);
}

/// Forwards key-generation messages into an unbounded channel.
pub struct ChannelKeygenSink {
    tx: mpsc::UnboundedSender<KeygenEvent>,
}

impl ChannelKeygenSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<KeygenEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl KeygenSink for ChannelKeygenSink {
    fn deliver(&self, peer: &str, message: WireMessage) {
        let event = KeygenEvent {
            peer: peer.to_string(),
            message,
        };
        if self.tx.send(event).is_err() {
            warn!("⚠️ Key generation receiver gone, dropping message from {}", peer);
        }
    }
}

/// Drops key-generation messages. Used when no key-generation subsystem is attached.
pub struct DiscardKeygen;

impl KeygenSink for DiscardKeygen {
    fn deliver(&self, peer: &str, message: WireMessage) {
        warn!(
            "⚠️ No key generation subsystem, dropping {:?} from {}",
            message.message_type(),
            peer
        );
    }
}
