//! Contact lookup: peer name -> dial address and optional public key.

use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub public_key: Option<VerifyingKey>,
}

impl Contact {
    pub fn new(name: &str, address: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            port,
            public_key: None,
        }
    }

    pub fn with_public_key(mut self, key: VerifyingKey) -> Self {
        self.public_key = Some(key);
        self
    }
}

/// Resolves handshake targets and sources public keys for signature checks.
pub trait ContactDirectory: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Contact>;

    fn public_key(&self, name: &str) -> Option<VerifyingKey> {
        self.lookup(name).and_then(|c| c.public_key)
    }
}

/// Fixed contact list, typically built from the `[[contacts]]` config tables.
#[derive(Debug, Default)]
pub struct StaticContacts {
    contacts: HashMap<String, Contact>,
}

impl StaticContacts {
    pub fn new(contacts: Vec<Contact>) -> Self {
        Self {
            contacts: contacts.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

impl ContactDirectory for StaticContacts {
    fn lookup(&self, name: &str) -> Option<Contact> {
        self.contacts.get(name).cloned()
    }
}
