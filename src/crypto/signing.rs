use crate::contacts::ContactDirectory;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Outcome of checking a signature against a sender's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid,
    /// No public key is known for the sender, so nothing could be checked.
    NoPublicKey,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }
}

/// Signs outgoing bytes with the local identity and verifies bytes from named senders.
pub trait MessageAuthenticator: Send + Sync {
    fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>, AuthError>;

    /// Must not fail on malformed signatures; those are `Verification::Invalid`.
    fn verify(&self, bytes: &[u8], signature: &[u8], sender: &str) -> Verification;
}

/// Ed25519 signatures, with sender keys looked up in the contact directory.
pub struct Ed25519Authenticator {
    signing_key: SigningKey,
    contacts: Arc<dyn ContactDirectory>,
}

impl Ed25519Authenticator {
    pub fn new(signing_key: SigningKey, contacts: Arc<dyn ContactDirectory>) -> Self {
        Self {
            signing_key,
            contacts,
        }
    }

    /// Build from a hex-encoded 32-byte seed.
    pub fn from_hex_seed(
        seed: &str,
        contacts: Arc<dyn ContactDirectory>,
    ) -> Result<Self, AuthError> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| AuthError::Signing(format!("Invalid key hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::Signing(format!("Key must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::new(SigningKey::from_bytes(&seed), contacts))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }
}

impl MessageAuthenticator for Ed25519Authenticator {
    fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(self.signing_key.sign(bytes).to_bytes().to_vec())
    }

    fn verify(&self, bytes: &[u8], signature: &[u8], sender: &str) -> Verification {
        let Some(public_key) = self.contacts.public_key(sender) else {
            return Verification::NoPublicKey;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return Verification::Invalid;
        };
        match public_key.verify(bytes, &signature) {
            Ok(()) => Verification::Valid,
            Err(_) => Verification::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::{Contact, StaticContacts};

    fn authenticator_pair() -> (Ed25519Authenticator, Ed25519Authenticator) {
        let mut rng = rand::rngs::OsRng;
        let alice_key = SigningKey::generate(&mut rng);
        let bob_key = SigningKey::generate(&mut rng);

        let alice_contacts = StaticContacts::new(vec![Contact::new("bob", "127.0.0.1", 1)
            .with_public_key(bob_key.verifying_key())]);
        let bob_contacts = StaticContacts::new(vec![Contact::new("alice", "127.0.0.1", 2)
            .with_public_key(alice_key.verifying_key())]);

        (
            Ed25519Authenticator::new(alice_key, Arc::new(alice_contacts)),
            Ed25519Authenticator::new(bob_key, Arc::new(bob_contacts)),
        )
    }

    #[test]
    fn test_sign_and_verify() {
        let (alice, bob) = authenticator_pair();
        let signature = alice.sign(b"hello").unwrap();
        assert_eq!(bob.verify(b"hello", &signature, "alice"), Verification::Valid);
        assert_eq!(bob.verify(b"hellO", &signature, "alice"), Verification::Invalid);
    }

    #[test]
    fn test_unknown_sender_has_no_key() {
        let (alice, bob) = authenticator_pair();
        let signature = alice.sign(b"hello").unwrap();
        assert_eq!(bob.verify(b"hello", &signature, "carol"), Verification::NoPublicKey);
    }

    #[test]
    fn test_malformed_signature_is_invalid() {
        let (_, bob) = authenticator_pair();
        assert_eq!(bob.verify(b"hello", &[1, 2, 3], "alice"), Verification::Invalid);
    }

    #[test]
    fn test_from_hex_seed() {
        let contacts: Arc<dyn ContactDirectory> = Arc::new(StaticContacts::default());
        let auth = Ed25519Authenticator::from_hex_seed(&"07".repeat(32), contacts.clone()).unwrap();
        assert_eq!(auth.public_key_hex().len(), 64);
        assert!(Ed25519Authenticator::from_hex_seed("abcd", contacts).is_err());
    }
}
