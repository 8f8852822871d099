use crate::config::ConfigError;
use crate::crypto::AuthError;
use crate::key_ledger::LedgerError;
use crate::messaging::MessagingError;
use crate::network::RegistryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Key material error: {0}")]
    KeyMaterial(#[from] LedgerError),

    #[error("Failed to load key material for {peer} from {path}: {source}")]
    KeyMaterialFile {
        peer: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Signing key error: {0}")]
    SigningKey(#[from] AuthError),

    #[error("Network error: {0}")]
    Network(#[from] RegistryError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Logging setup error: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}
