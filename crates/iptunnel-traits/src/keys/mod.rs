use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Could not determine the home directory")]
    NoHomeDir,
    #[error("SSH client not found. Please install OpenSSH.")]
    SshClientNotFound,
    #[error("An SSH key pair already exists at '{0}'")]
    AlreadyExists(String),
    #[error("Error generating SSH key: {0}")]
    Keygen(String),
    #[error("Public key file not found. Please generate SSH keys first.")]
    PublicKeyMissing,
    #[error("SSH key I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenOptions {
    /// Optional comment, usually an email address.
    pub comment: Option<String>,
    pub key_type: String,
    pub bits: u32,
}

impl Default for KeyGenOptions {
    fn default() -> Self {
        Self {
            comment: None,
            key_type: "rsa".to_string(),
            bits: 2048,
        }
    }
}

/// Checks for, creates, reads and deletes the SSH key pair used by the tunnel.
#[async_trait]
pub trait CredentialProvisioner: Send + Sync {
    fn keys_exist(&self) -> bool;
    fn private_key_path(&self) -> &Path;
    fn public_key_path(&self) -> &Path;
    async fn generate(&self, options: &KeyGenOptions) -> Result<String, KeyError>;
    fn public_key_text(&self) -> Result<String, KeyError>;
    fn delete_keys(&self) -> Result<String, KeyError>;
}
