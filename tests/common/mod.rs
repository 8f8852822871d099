//! Loopback nodes for integration tests.

#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use qkdmsg::contacts::{Contact, StaticContacts};
use qkdmsg::crypto::{Aes256GcmCipher, Ed25519Authenticator, MessageAuthenticator};
use qkdmsg::key_ledger::KeyMaterialLedger;
use qkdmsg::keygen::DiscardKeygen;
use qkdmsg::messaging::MessagingFacade;
use qkdmsg::network::{MessageHandler, PeerSession, SessionConfig, SessionRegistry, SessionState};
use std::sync::Arc;
use std::time::Duration;

pub struct Node {
    pub name: String,
    pub registry: Arc<SessionRegistry>,
    pub facade: MessagingFacade,
    pub ledger: Arc<KeyMaterialLedger>,
    pub port: u16,
}

pub struct NodeBuilder {
    name: String,
    seed: Option<[u8; 32]>,
    contacts: Vec<Contact>,
    key_material: Vec<(String, Vec<u8>, bool)>,
    require_signatures: bool,
}

pub fn node(name: &str) -> NodeBuilder {
    NodeBuilder {
        name: name.to_string(),
        seed: None,
        contacts: vec![],
        key_material: vec![],
        require_signatures: false,
    }
}

pub fn public_key(seed: [u8; 32]) -> ed25519_dalek::VerifyingKey {
    SigningKey::from_bytes(&seed).verifying_key()
}

impl NodeBuilder {
    pub fn signing_seed(mut self, seed: [u8; 32]) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn contact(mut self, contact: Contact) -> Self {
        self.contacts.push(contact);
        self
    }

    pub fn key_material(mut self, peer: &str, buffer: Vec<u8>, initiative: bool) -> Self {
        self.key_material.push((peer.to_string(), buffer, initiative));
        self
    }

    pub fn require_signatures(mut self) -> Self {
        self.require_signatures = true;
        self
    }

    pub async fn start(self) -> Node {
        let contacts = Arc::new(StaticContacts::new(self.contacts));
        let authenticator: Option<Arc<dyn MessageAuthenticator>> = match self.seed {
            Some(seed) => {
                let auth: Arc<dyn MessageAuthenticator> = Arc::new(Ed25519Authenticator::new(
                    SigningKey::from_bytes(&seed),
                    contacts.clone(),
                ));
                Some(auth)
            }
            None => None,
        };

        let ledger = Arc::new(KeyMaterialLedger::new());
        for (peer, buffer, initiative) in self.key_material {
            ledger.insert(&peer, buffer, initiative).unwrap();
        }

        let handler = MessageHandler::new(
            ledger.clone(),
            authenticator.clone(),
            Arc::new(Aes256GcmCipher),
            Arc::new(DiscardKeygen),
            self.require_signatures,
        );
        let config = SessionConfig {
            local_name: self.name.clone(),
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            termination_timeout: Duration::from_millis(500),
        };
        let registry = SessionRegistry::new(config, Arc::new(handler), contacts);
        let bound = registry
            .start_listener("127.0.0.1", 0, "127.0.0.1")
            .await
            .unwrap();

        let facade = MessagingFacade::new(
            registry.clone(),
            ledger.clone(),
            authenticator,
            Arc::new(Aes256GcmCipher),
        );
        Node {
            name: self.name,
            registry,
            facade,
            ledger,
            port: bound.port(),
        }
    }
}

impl Node {
    pub fn session(&self, peer: &str) -> Arc<PeerSession> {
        self.registry.require(peer).unwrap()
    }

    pub fn as_contact(&self) -> Contact {
        Contact::new(&self.name, "127.0.0.1", self.port)
    }
}

/// Poll until the session reaches `state`; false on timeout.
pub async fn wait_for_state(session: &PeerSession, state: SessionState, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if session.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    session.state() == state
}

/// Alice connects to a waiting Bob; returns once both sides are connected.
pub async fn connect_pair(alice: &Node, bob: &Node) {
    bob.registry.listen(&alice.name, None).unwrap();
    alice
        .registry
        .connect(&bob.name, "127.0.0.1", bob.port)
        .await
        .unwrap();
    assert_eq!(alice.session(&bob.name).state(), SessionState::Connected);
    assert!(
        wait_for_state(
            &bob.session(&alice.name),
            SessionState::Connected,
            Duration::from_secs(2)
        )
        .await
    );
}
