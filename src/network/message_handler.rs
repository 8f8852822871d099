//! Dispatch of inbound wire messages for an established session.
//!
//! Every message type is matched explicitly. Handshake messages only ever travel as
//! the first frame on a fresh socket and are consumed by the listener, so seeing one
//! here is a protocol error.

use crate::crypto::{CipherError, MessageAuthenticator, SymmetricCipher, Verification};
use crate::key_ledger::{KeyMaterialLedger, LedgerError};
use crate::keygen::KeygenSink;
use crate::network::inbox::{Authenticity, ContentKind, ReceivedMessage};
use crate::network::message::{MessageArgs, MessageId, MessageType, WireMessage};
use crate::network::session::{PeerSession, SessionError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unexpected {0:?} on an established session")]
    UnexpectedHandshake(MessageType),

    #[error("Message claims sender {claimed} on the session with {peer}")]
    SenderMismatch { peer: String, claimed: String },

    #[error("{0:?} without a correlation id")]
    MissingCorrelation(MessageType),

    #[error("Verification failed for message {id}: {reason}")]
    VerificationFailed { id: MessageId, reason: &'static str },

    #[error("Could not decrypt message {id}: {reason}")]
    CouldNotDecrypt { id: MessageId, reason: String },

    #[error("Reply failed: {0}")]
    Reply(#[from] SessionError),
}

impl DispatchError {
    fn decrypt(id: MessageId, err: impl std::fmt::Display) -> Self {
        DispatchError::CouldNotDecrypt {
            id,
            reason: err.to_string(),
        }
    }
}

/// What the receive loop does after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The peer terminated the session.
    Terminate,
}

pub struct MessageHandler {
    ledger: Arc<KeyMaterialLedger>,
    authenticator: Option<Arc<dyn MessageAuthenticator>>,
    cipher: Arc<dyn SymmetricCipher>,
    keygen: Arc<dyn KeygenSink>,
    require_signatures: bool,
}

impl MessageHandler {
    pub fn new(
        ledger: Arc<KeyMaterialLedger>,
        authenticator: Option<Arc<dyn MessageAuthenticator>>,
        cipher: Arc<dyn SymmetricCipher>,
        keygen: Arc<dyn KeygenSink>,
        require_signatures: bool,
    ) -> Self {
        Self {
            ledger,
            authenticator,
            cipher,
            keygen,
            require_signatures,
        }
    }

    pub async fn handle(
        &self,
        session: &PeerSession,
        message: WireMessage,
    ) -> Result<Flow, DispatchError> {
        if let Some(claimed) = message.sender() {
            if claimed != session.id() {
                return Err(DispatchError::SenderMismatch {
                    peer: session.id().to_string(),
                    claimed: claimed.to_string(),
                });
            }
        }

        match message.message_type() {
            MessageType::ConnectionRequest | MessageType::ConnectionConfirmation => {
                Err(DispatchError::UnexpectedHandshake(message.message_type()))
            }
            MessageType::ConnectionTermination => Ok(Flow::Terminate),
            MessageType::TextMessage | MessageType::FileTransfer => {
                self.handle_content(session, message).await?;
                Ok(Flow::Continue)
            }
            MessageType::ReceptionConfirmation | MessageType::ReceptionConfirmationResponse => {
                let id = message
                    .args()
                    .correlation_id
                    .ok_or(DispatchError::MissingCorrelation(message.message_type()))?;
                if session.record_confirmation(id) {
                    debug!("✅ {} confirmed {}", session.id(), id);
                }
                Ok(Flow::Continue)
            }
            MessageType::ReceptionConfirmationRequest => {
                let reply = acknowledgement(
                    session,
                    MessageType::ReceptionConfirmationResponse,
                    message.id(),
                );
                session.push_message(&reply).await?;
                Ok(Flow::Continue)
            }
            MessageType::KeygenSyncRequest
            | MessageType::KeygenSyncAccept
            | MessageType::KeygenSyncReject
            | MessageType::KeygenTransmission
            | MessageType::KeygenSourceSignal
            | MessageType::KeygenTermination => {
                self.keygen.deliver(session.id(), message);
                Ok(Flow::Continue)
            }
        }
    }

    fn authenticity(
        &self,
        session: &PeerSession,
        message: &WireMessage,
    ) -> Result<Authenticity, DispatchError> {
        if !message.is_signed() {
            if self.require_signatures {
                return Err(DispatchError::VerificationFailed {
                    id: message.id(),
                    reason: "unsigned",
                });
            }
            return Ok(Authenticity::Unsigned);
        }

        let Some(authenticator) = &self.authenticator else {
            return Ok(Authenticity::Unverified);
        };
        match message.verify(authenticator.as_ref(), session.id()) {
            Verification::Valid => Ok(Authenticity::Verified),
            Verification::NoPublicKey => Ok(Authenticity::Unverified),
            Verification::Invalid => Err(DispatchError::VerificationFailed {
                id: message.id(),
                reason: "bad signature",
            }),
        }
    }

    fn decrypt(
        &self,
        session: &PeerSession,
        message: &WireMessage,
    ) -> Result<Vec<u8>, DispatchError> {
        let Some(key_index) = message.args().key_index else {
            return Ok(message.content().to_vec());
        };
        let offset = usize::try_from(key_index)
            .map_err(|_| DispatchError::decrypt(message.id(), "key index out of range"))?;

        let key = self
            .ledger
            .consume_received(session.id(), self.cipher.key_len(), offset)
            .map_err(|e: LedgerError| DispatchError::decrypt(message.id(), e))?;
        self.cipher
            .decrypt(message.content(), &key.bytes)
            .map_err(|e: CipherError| DispatchError::decrypt(message.id(), e))
    }

    async fn handle_content(
        &self,
        session: &PeerSession,
        message: WireMessage,
    ) -> Result<(), DispatchError> {
        let authenticity = self.authenticity(session, &message)?;
        let content = self.decrypt(session, &message)?;

        let kind = match message.message_type() {
            MessageType::FileTransfer => ContentKind::File {
                filename: message.args().filename.clone().unwrap_or_default(),
            },
            _ => ContentKind::Text,
        };
        let received = ReceivedMessage {
            id: message.id(),
            sender: session.id().to_string(),
            kind,
            content,
            authenticity,
            encrypted: message.args().key_index.is_some(),
            received_at: chrono::Utc::now(),
        };

        if authenticity == Authenticity::Unverified {
            info!(
                "🔒 Holding message {} from {}: no public key to verify it",
                received.id,
                session.id()
            );
            session.hold(received);
        } else {
            session.enqueue(received);
        }

        if message.expects_confirmation() {
            let ack = acknowledgement(session, MessageType::ReceptionConfirmation, message.id());
            if let Err(e) = session.push_message(&ack).await {
                warn!("⚠️ Could not confirm {} to {}: {}", message.id(), session.id(), e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

fn acknowledgement(session: &PeerSession, kind: MessageType, id: MessageId) -> WireMessage {
    WireMessage::new(kind).with_args(MessageArgs {
        username: Some(session.local_name().to_string()),
        correlation_id: Some(id),
        ..Default::default()
    })
}
