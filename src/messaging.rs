//! Application-facing send and receive on named sessions.
//!
//! Outgoing content is optionally encrypted with the next unused range of the
//! peer's key material and optionally signed with the local identity. The key
//! range start travels in `args.key_index` so the receiver can find the same bytes.

use crate::crypto::{AuthError, CipherError, MessageAuthenticator, SymmetricCipher};
use crate::key_ledger::{KeyMaterialLedger, LedgerError};
use crate::network::inbox::ReceivedMessage;
use crate::network::message::{MessageArgs, MessageId, MessageType, WireMessage};
use crate::network::registry::{RegistryError, SessionRegistry};
use crate::network::session::{PeerSession, SessionError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Key material: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Encryption: {0}")]
    Cipher(#[from] CipherError),

    #[error("Signing: {0}")]
    Auth(#[from] AuthError),

    #[error("Signing requested but no signing key is configured")]
    NoSigningKey,

    #[error("{0:?} is not a key generation message")]
    NotKeygen(MessageType),
}

/// Per-send protection flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub sign: bool,
    pub encrypt: bool,
}

impl SendOptions {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn signed(mut self) -> Self {
        self.sign = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }
}

pub struct MessagingFacade {
    registry: Arc<SessionRegistry>,
    ledger: Arc<KeyMaterialLedger>,
    authenticator: Option<Arc<dyn MessageAuthenticator>>,
    cipher: Arc<dyn SymmetricCipher>,
    confirm_timeout: Duration,
}

impl MessagingFacade {
    pub fn new(
        registry: Arc<SessionRegistry>,
        ledger: Arc<KeyMaterialLedger>,
        authenticator: Option<Arc<dyn MessageAuthenticator>>,
        cipher: Arc<dyn SymmetricCipher>,
    ) -> Self {
        Self {
            registry,
            ledger,
            authenticator,
            cipher,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    /// Default wait for `send_confirmed` and `ping` when the caller passes none.
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<KeyMaterialLedger> {
        &self.ledger
    }

    fn connected(&self, peer: &str) -> Result<Arc<PeerSession>, MessagingError> {
        let session = self.registry.require(peer)?;
        // Check before touching key material so a dead session wastes none
        session.ensure_connected()?;
        Ok(session)
    }

    /// Assemble an outgoing application message. Encryption happens before
    /// signing so the signature covers the ciphertext.
    fn seal(
        &self,
        peer: &str,
        kind: MessageType,
        content: &[u8],
        filename: Option<&str>,
        options: SendOptions,
        confirm_id: Option<MessageId>,
    ) -> Result<WireMessage, MessagingError> {
        if options.sign && self.authenticator.is_none() {
            return Err(MessagingError::NoSigningKey);
        }

        let mut args = MessageArgs {
            username: Some(self.registry.local_name().to_string()),
            filename: filename.map(str::to_string),
            ..Default::default()
        };
        let body = if options.encrypt {
            let key = self.ledger.take_next(peer, self.cipher.key_len())?;
            args.key_index = Some(key.offset as u64);
            self.cipher.encrypt(content, &key.bytes)?
        } else {
            content.to_vec()
        };

        let mut message = WireMessage::new(kind).with_args(args).with_content(body);
        if let Some(id) = confirm_id {
            message = message.with_id(id).expecting_confirmation();
        }
        match (&self.authenticator, options.sign) {
            (Some(authenticator), true) => Ok(message.signed(authenticator.as_ref())?),
            _ => Ok(message),
        }
    }

    pub async fn send_text(
        &self,
        peer: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId, MessagingError> {
        let session = self.connected(peer)?;
        let message = self.seal(
            peer,
            MessageType::TextMessage,
            text.as_bytes(),
            None,
            options,
            None,
        )?;
        session.push_message(&message).await?;
        Ok(message.id())
    }

    pub async fn send_file(
        &self,
        peer: &str,
        filename: &str,
        data: &[u8],
        options: SendOptions,
    ) -> Result<MessageId, MessagingError> {
        let session = self.connected(peer)?;
        let message = self.seal(
            peer,
            MessageType::FileTransfer,
            data,
            Some(filename),
            options,
            None,
        )?;
        session.push_message(&message).await?;
        info!("📁 Sent {} ({} bytes) to {}", filename, data.len(), peer);
        Ok(message.id())
    }

    /// Reserve an id nobody on this session is waiting for.
    fn fresh_confirmation_id(session: &PeerSession) -> MessageId {
        loop {
            let id = MessageId::random();
            if session.register_confirmation(id) {
                return id;
            }
        }
    }

    /// Send a text message and wait for the peer to acknowledge it.
    ///
    /// `Ok(false)` means no acknowledgement arrived within `timeout` (or the
    /// session closed first); the content may or may not have been delivered.
    pub async fn send_confirmed(
        &self,
        peer: &str,
        text: &str,
        options: SendOptions,
        timeout: Option<Duration>,
    ) -> Result<bool, MessagingError> {
        let session = self.connected(peer)?;
        let id = Self::fresh_confirmation_id(&session);

        let sent = match self.seal(
            peer,
            MessageType::TextMessage,
            text.as_bytes(),
            None,
            options,
            Some(id),
        ) {
            Ok(message) => session.push_message(&message).await.map_err(MessagingError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            session.forget_confirmation(id);
            return Err(e);
        }

        let wait = timeout.unwrap_or(self.confirm_timeout);
        let confirmed = session.wait_for_confirmation(id, wait).await;
        debug!("Confirmation of {} from {}: {}", id, peer, confirmed);
        Ok(confirmed)
    }

    /// Ask the peer to echo a fresh id. True if it did within `timeout`.
    pub async fn ping(
        &self,
        peer: &str,
        timeout: Option<Duration>,
    ) -> Result<bool, MessagingError> {
        let session = self.connected(peer)?;
        let id = Self::fresh_confirmation_id(&session);
        let request = WireMessage::new(MessageType::ReceptionConfirmationRequest)
            .with_id(id)
            .with_args(MessageArgs {
                username: Some(self.registry.local_name().to_string()),
                ..Default::default()
            });
        if let Err(e) = session.push_message(&request).await {
            session.forget_confirmation(id);
            return Err(e.into());
        }
        Ok(session
            .wait_for_confirmation(id, timeout.unwrap_or(self.confirm_timeout))
            .await)
    }

    /// Send a key-generation protocol message on behalf of the key-generation subsystem.
    pub async fn send_keygen(
        &self,
        peer: &str,
        kind: MessageType,
        content: Vec<u8>,
    ) -> Result<MessageId, MessagingError> {
        if !kind.is_keygen() {
            return Err(MessagingError::NotKeygen(kind));
        }
        let session = self.connected(peer)?;
        let message = WireMessage::new(kind)
            .with_args(MessageArgs {
                username: Some(self.registry.local_name().to_string()),
                ..Default::default()
            })
            .with_content(content);
        session.push_message(&message).await?;
        Ok(message.id())
    }

    // Receive side. Messages stay queued across reconnects, so none of these
    // require a connected session.

    pub fn read_next(&self, peer: &str) -> Result<Option<ReceivedMessage>, MessagingError> {
        Ok(self.registry.require(peer)?.read_next())
    }

    pub fn peek_next(&self, peer: &str) -> Result<Option<ReceivedMessage>, MessagingError> {
        Ok(self.registry.require(peer)?.peek_next())
    }

    pub fn pending_count(&self, peer: &str) -> Result<usize, MessagingError> {
        Ok(self.registry.require(peer)?.pending_count())
    }

    pub async fn next_message(
        &self,
        peer: &str,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>, MessagingError> {
        let session = self.registry.require(peer)?;
        Ok(session.next_message(wait).await)
    }

    pub fn unverified(&self, peer: &str) -> Result<Vec<ReceivedMessage>, MessagingError> {
        Ok(self.registry.require(peer)?.unverified())
    }

    pub fn accept_unverified(&self, peer: &str, id: MessageId) -> Result<bool, MessagingError> {
        Ok(self.registry.require(peer)?.accept_unverified(id))
    }

    pub fn discard_unverified(&self, peer: &str, id: MessageId) -> Result<bool, MessagingError> {
        Ok(self.registry.require(peer)?.discard_unverified(id))
    }
}
