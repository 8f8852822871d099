use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CipherError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Ciphertext too short")]
    Truncated,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,
}

/// Symmetric encryption keyed with bytes drawn from the key material ledger.
pub trait SymmetricCipher: Send + Sync {
    /// Number of key bytes one message consumes.
    fn key_len(&self) -> usize;

    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError>;
}

const NONCE_LEN: usize = 12;

/// AES-256-GCM. Output layout: `[12-byte nonce][ciphertext + tag]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256GcmCipher;

impl Aes256GcmCipher {
    fn cipher(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
        Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength {
            expected: 32,
            actual: key.len(),
        })
    }
}

impl SymmetricCipher for Aes256GcmCipher {
    fn key_len(&self) -> usize {
        32
    }

    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = Self::cipher(key)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = Self::cipher(key)?;
        if ciphertext.len() < NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CipherError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [9u8; 32];
        let cipher = Aes256GcmCipher;
        let sealed = cipher.encrypt(b"attack at dawn", &key).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"attack at dawn");
        assert_eq!(cipher.decrypt(&sealed, &key).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = Aes256GcmCipher;
        let sealed = cipher.encrypt(b"secret", &[1u8; 32]).unwrap();
        assert_eq!(cipher.decrypt(&sealed, &[2u8; 32]), Err(CipherError::Decrypt));
    }

    #[test]
    fn test_bad_inputs() {
        let cipher = Aes256GcmCipher;
        assert_eq!(
            cipher.encrypt(b"x", &[0u8; 16]),
            Err(CipherError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        );
        assert_eq!(cipher.decrypt(&[0u8; 4], &[0u8; 32]), Err(CipherError::Truncated));
    }
}
