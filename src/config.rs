//! Configuration for the qkdmsg daemon.
//!
//! A single TOML file. On first run, if no config exists, one with defaults is
//! written to the data directory.

use crate::contacts::Contact;
use crate::network::session::SessionConfig;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LISTEN_PORT: u16 = 8303;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Get the platform-specific data directory
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\qkdmsg
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("qkdmsg")
    } else {
        // Linux/Mac: ~/.qkdmsg
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".qkdmsg")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub contacts: Vec<ContactConfig>,
    #[serde(default)]
    pub key_material: Vec<KeyMaterialConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Name this node announces in handshakes
    pub name: String,
    #[serde(default)]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    pub listen_address: String,
    pub listen_port: u16,
    /// Address peers should dial back. Defaults to the listen address; a
    /// wildcard makes peers use the address the request came from.
    #[serde(default)]
    pub advertise_address: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_termination_timeout")]
    pub termination_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_termination_timeout() -> u64 {
    2_000
}

impl NetworkConfig {
    pub fn advertise_address(&self) -> &str {
        self.advertise_address
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.listen_address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagingConfig {
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_ms: u64,
}

fn default_confirm_timeout() -> u64 {
    10_000
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: default_confirm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    /// Hex-encoded 32-byte Ed25519 seed. Empty disables signing.
    #[serde(default)]
    pub signing_key: String,
    /// Drop unsigned text and file messages
    #[serde(default)]
    pub require_signatures: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty", "compact" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/qkdmsgd.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Hex-encoded Ed25519 public key
    #[serde(default)]
    pub public_key: Option<String>,
}

impl ContactConfig {
    pub fn to_contact(&self) -> Result<Contact, ConfigError> {
        let contact = Contact::new(&self.name, &self.address, self.port);
        let Some(key_hex) = self.public_key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(contact);
        };
        let invalid = |reason: String| {
            ConfigError::Invalid(format!("public key for contact {}: {}", self.name, reason))
        };
        let bytes = hex::decode(key_hex.trim()).map_err(|e| invalid(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| invalid(format!("expected 32 bytes, got {}", bytes.len())))?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))?;
        Ok(contact.with_public_key(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyMaterialConfig {
    pub peer: String,
    /// Raw shared-secret bytes; relative paths resolve against the data dir
    pub file: String,
    #[serde(default)]
    pub initiative: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                name: "qkdmsg-node".to_string(),
                data_dir: String::new(),
            },
            network: NetworkConfig {
                listen_address: "0.0.0.0".to_string(),
                listen_port: DEFAULT_LISTEN_PORT,
                advertise_address: None,
                connect_timeout_ms: default_connect_timeout(),
                handshake_timeout_ms: default_handshake_timeout(),
                termination_timeout_ms: default_termination_timeout(),
            },
            messaging: MessagingConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
            contacts: vec![],
            key_material: vec![],
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, contents).map_err(write_err)
    }

    /// Load `path`, or write and return the defaults if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            let mut config = Config::default();
            config.node.data_dir = get_data_dir().to_string_lossy().to_string();
            config.save_to_file(path)?;
            tracing::info!("📝 Wrote default config to {}", path.display());
            config
        };
        if config.node.data_dir.is_empty() {
            config.node.data_dir = get_data_dir().to_string_lossy().to_string();
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.trim().is_empty() {
            return Err(ConfigError::Invalid("node.name is empty".to_string()));
        }
        if self.network.listen_port == 0 {
            return Err(ConfigError::Invalid(
                "network.listen_port must not be 0".to_string(),
            ));
        }
        let timeouts = [
            ("network.connect_timeout_ms", self.network.connect_timeout_ms),
            ("network.handshake_timeout_ms", self.network.handshake_timeout_ms),
            ("network.termination_timeout_ms", self.network.termination_timeout_ms),
            ("messaging.confirm_timeout_ms", self.messaging.confirm_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{} must not be 0", name)));
        }

        let mut seen = HashSet::new();
        for contact in &self.contacts {
            if contact.name == self.node.name {
                return Err(ConfigError::Invalid(format!(
                    "contact {} has this node's own name",
                    contact.name
                )));
            }
            if !seen.insert(contact.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate contact {}",
                    contact.name
                )));
            }
            contact.to_contact()?;
        }

        let mut peers = HashSet::new();
        for material in &self.key_material {
            if !peers.insert(material.peer.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate key material for {}",
                    material.peer
                )));
            }
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            local_name: self.node.name.clone(),
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.network.handshake_timeout_ms),
            termination_timeout: Duration::from_millis(self.network.termination_timeout_ms),
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.messaging.confirm_timeout_ms)
    }

    pub fn contact_list(&self) -> Result<Vec<Contact>, ConfigError> {
        self.contacts.iter().map(ContactConfig::to_contact).collect()
    }

    /// Resolve a key material file path against the data directory.
    pub fn key_material_path(&self, material: &KeyMaterialConfig) -> PathBuf {
        let path = PathBuf::from(&material.file);
        if path.is_absolute() || self.node.data_dir.is_empty() {
            path
        } else {
            PathBuf::from(&self.node.data_dir).join(path)
        }
    }
}
