//! Asymmetric cryptography used by the handshake
//!
//! The handshake only depends on the capability traits below:
//! - [`Decryption`]: our freshly generated keypair (exportable public key + decrypt)
//! - [`Encryption`]: an encrypt-only capability bound to the server's public key
//! - [`EncryptionProvider`]: turns the server's exported public key into an [`Encryption`]
//!
//! [`rsa`] provides the RSA-OAEP (SHA-256) implementation the server speaks.

pub mod rsa;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CryptoError;

/// Local keypair: exports the public half, decrypts with the private half
#[async_trait]
pub trait Decryption: Send + Sync {
    /// PEM encoding of our public key, as sent in `SetPublicKey`
    fn public_key_pem(&self) -> String;

    /// Decrypt a ciphertext addressed to us into text
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<String, CryptoError>;
}

/// Encrypt-only capability for a remote public key
#[async_trait]
pub trait Encryption: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError>;
}

/// Derives an [`Encryption`] from a remote public key export
#[async_trait]
pub trait EncryptionProvider: Send + Sync {
    async fn import(&self, public_key: &[u8]) -> Result<Arc<dyn Encryption>, CryptoError>;
}
