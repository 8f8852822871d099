//! Authentication and encryption capabilities consumed by the messaging layer.

pub mod cipher;
pub mod signing;

pub use cipher::{Aes256GcmCipher, CipherError, SymmetricCipher};
pub use signing::{AuthError, Ed25519Authenticator, MessageAuthenticator, Verification};
