//! Wire messages and their signing envelope.

use crate::crypto::{AuthError, MessageAuthenticator, Verification};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Handshake
    ConnectionRequest,
    ConnectionConfirmation,
    ConnectionTermination,
    // Application content
    TextMessage,
    FileTransfer,
    // Acknowledgements
    ReceptionConfirmation,
    ReceptionConfirmationRequest,
    ReceptionConfirmationResponse,
    // Key generation, handled outside the session
    KeygenSyncRequest,
    KeygenSyncAccept,
    KeygenSyncReject,
    KeygenTransmission,
    KeygenSourceSignal,
    KeygenTermination,
}

impl MessageType {
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageType::ConnectionRequest | MessageType::ConnectionConfirmation
        )
    }

    pub fn is_keygen(&self) -> bool {
        matches!(
            self,
            MessageType::KeygenSyncRequest
                | MessageType::KeygenSyncAccept
                | MessageType::KeygenSyncReject
                | MessageType::KeygenTransmission
                | MessageType::KeygenSourceSignal
                | MessageType::KeygenTermination
        )
    }

    pub fn is_application(&self) -> bool {
        matches!(self, MessageType::TextMessage | MessageType::FileTransfer)
    }
}

/// 128-bit random identifier, used for confirmation correlation and signing.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// Type-dependent arguments. Unused fields stay `None`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageArgs {
    /// Sender's name, set on every message this crate sends.
    pub username: Option<String>,
    pub filename: Option<String>,
    /// Start of the key range used to encrypt `content`.
    pub key_index: Option<u64>,
    /// Listen address advertised in a `ConnectionRequest`.
    pub address: Option<String>,
    pub port: Option<u16>,
    /// Id of the message being acknowledged.
    pub correlation_id: Option<MessageId>,
}

/// A unit of transmission between two sessions.
///
/// Fields are private: a message is built, optionally signed, then only read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    message_type: MessageType,
    args: MessageArgs,
    content: Vec<u8>,
    id: MessageId,
    expect_confirmation: bool,
    signature: Option<Vec<u8>>,
}

impl WireMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            args: MessageArgs::default(),
            content: Vec::new(),
            id: MessageId::random(),
            expect_confirmation: false,
            signature: None,
        }
    }

    pub fn with_args(mut self, args: MessageArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn expecting_confirmation(mut self) -> Self {
        self.expect_confirmation = true;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn args(&self) -> &MessageArgs {
        &self.args
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn expects_confirmation(&self) -> bool {
        self.expect_confirmation
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn sender(&self) -> Option<&str> {
        self.args.username.as_deref()
    }

    /// The byte string covered by the signature: args, type, id, confirmation flag, content.
    ///
    /// Both `sign` and `verify` go through here so the encoding cannot drift.
    pub fn signable_bytes(&self) -> Vec<u8> {
        // Serializing plain data structures into a Vec cannot fail
        bincode::serialize(&(
            &self.args,
            &self.message_type,
            &self.id,
            self.expect_confirmation,
            &self.content,
        ))
        .unwrap_or_default()
    }

    pub fn sign(&self, authenticator: &dyn MessageAuthenticator) -> Result<Vec<u8>, AuthError> {
        authenticator.sign(&self.signable_bytes())
    }

    /// Sign and attach the signature, consuming the message.
    pub fn signed(mut self, authenticator: &dyn MessageAuthenticator) -> Result<Self, AuthError> {
        self.signature = Some(self.sign(authenticator)?);
        Ok(self)
    }

    /// Unsigned messages are `Invalid`; callers decide separately whether to accept them.
    pub fn verify(&self, authenticator: &dyn MessageAuthenticator, sender: &str) -> Verification {
        match &self.signature {
            Some(signature) => authenticator.verify(&self.signable_bytes(), signature, sender),
            None => Verification::Invalid,
        }
    }

    /// Short description for logs.
    pub fn summary(&self) -> String {
        format!(
            "{:?} id={} from={} len={}{}",
            self.message_type,
            self.id,
            self.sender().unwrap_or("?"),
            self.content.len(),
            if self.is_signed() { " signed" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::{Contact, StaticContacts};
    use crate::crypto::Ed25519Authenticator;
    use ed25519_dalek::SigningKey;
    use std::sync::Arc;

    fn authenticators() -> (Ed25519Authenticator, Ed25519Authenticator) {
        let k1 = SigningKey::from_bytes(&[1u8; 32]);
        let k2 = SigningKey::from_bytes(&[2u8; 32]);
        // The receiver knows "alice" under K1's public key
        let right = StaticContacts::new(vec![
            Contact::new("alice", "127.0.0.1", 1).with_public_key(k1.verifying_key())
        ]);
        let sender = Ed25519Authenticator::new(k1, Arc::new(StaticContacts::default()));
        let receiver = Ed25519Authenticator::new(k2, Arc::new(right));
        (sender, receiver)
    }

    fn text(content: &[u8]) -> WireMessage {
        WireMessage::new(MessageType::TextMessage)
            .with_args(MessageArgs {
                username: Some("alice".to_string()),
                ..Default::default()
            })
            .with_content(content.to_vec())
    }

    #[test]
    fn test_signed_message_verifies() {
        let (sender, receiver) = authenticators();
        let msg = text(b"hi bob").signed(&sender).unwrap();
        assert!(msg.is_signed());
        assert_eq!(msg.verify(&receiver, "alice"), Verification::Valid);
    }

    #[test]
    fn test_wrong_public_key_fails() {
        let (sender, _) = authenticators();
        let k3 = SigningKey::from_bytes(&[3u8; 32]);
        let wrong = StaticContacts::new(vec![
            Contact::new("alice", "127.0.0.1", 1).with_public_key(k3.verifying_key())
        ]);
        let receiver = Ed25519Authenticator::new(k3, Arc::new(wrong));

        let msg = text(b"hi bob").signed(&sender).unwrap();
        assert_eq!(msg.verify(&receiver, "alice"), Verification::Invalid);
    }

    #[test]
    fn test_tampering_invalidates_signature() {
        let (sender, receiver) = authenticators();
        let msg = text(b"hi bob").signed(&sender).unwrap();

        let mut tampered = msg.clone();
        tampered.content[0] ^= 0x01;
        assert_eq!(tampered.verify(&receiver, "alice"), Verification::Invalid);

        let mut tampered = msg.clone();
        tampered.message_type = MessageType::FileTransfer;
        assert_eq!(tampered.verify(&receiver, "alice"), Verification::Invalid);

        let mut tampered = msg.clone();
        tampered.id.0[7] ^= 0x80;
        assert_eq!(tampered.verify(&receiver, "alice"), Verification::Invalid);

        let mut tampered = msg.clone();
        tampered.expect_confirmation = true;
        assert_eq!(tampered.verify(&receiver, "alice"), Verification::Invalid);

        let mut tampered = msg;
        tampered.args.key_index = Some(0);
        assert_eq!(tampered.verify(&receiver, "alice"), Verification::Invalid);
    }

    #[test]
    fn test_unknown_sender_reports_missing_key() {
        let (sender, receiver) = authenticators();
        let msg = text(b"hi").signed(&sender).unwrap();
        assert_eq!(msg.verify(&receiver, "mallory"), Verification::NoPublicKey);
    }

    #[test]
    fn test_unsigned_message_is_invalid() {
        let (_, receiver) = authenticators();
        assert_eq!(text(b"hi").verify(&receiver, "alice"), Verification::Invalid);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = WireMessage::new(MessageType::TextMessage);
        let b = WireMessage::new(MessageType::TextMessage);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().to_string().len(), 32);
    }

    #[test]
    fn test_type_classes() {
        assert!(MessageType::ConnectionRequest.is_handshake());
        assert!(MessageType::KeygenTransmission.is_keygen());
        assert!(MessageType::FileTransfer.is_application());
        assert!(!MessageType::ConnectionTermination.is_handshake());
    }
}
