//! Peer-to-peer messaging over paired TCP connections, with optional Ed25519
//! signatures and encryption keyed from per-peer one-time key material.

pub mod config;
pub mod contacts;
pub mod crypto;
pub mod error;
pub mod key_ledger;
pub mod keygen;
pub mod messaging;
pub mod network;
pub mod shutdown;
pub mod timer;

pub use key_ledger::{KeyMaterialLedger, LedgerError};
pub use messaging::{MessagingError, MessagingFacade, SendOptions};
pub use network::{PeerSession, SessionRegistry, SessionState};
