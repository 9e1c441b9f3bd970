//! RSA-OAEP (SHA-256) key handling
//!
//! Our public key is exported as SubjectPublicKeyInfo PEM. The server exports
//! its key as raw DER, which is read as SPKI first and PKCS#1 second.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use super::{Decryption, Encryption, EncryptionProvider};
use crate::error::CryptoError;

/// Default modulus size
pub const DEFAULT_KEY_BITS: usize = 4096;

/// Bytes OAEP-SHA256 adds to every message
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// Our keypair
pub struct RsaDecryption {
    private_key: RsaPrivateKey,
    public_pem: String,
}

impl RsaDecryption {
    /// Generate a fresh keypair of `bits` bits
    ///
    /// Key generation runs on the blocking pool.
    pub async fn generate(bits: usize) -> Result<Self, CryptoError> {
        tokio::task::spawn_blocking(move || Self::generate_blocking(bits))
            .await
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?
    }

    /// Generate a fresh keypair on the current thread
    pub fn generate_blocking(bits: usize) -> Result<Self, CryptoError> {
        tracing::debug!("Generating {}-bit RSA keypair", bits);
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    /// Wrap an existing private key
    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyExport(e.to_string()))?;
        Ok(Self {
            private_key,
            public_pem,
        })
    }

    /// DER (SPKI) export of the public key
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        RsaPublicKey::from(&self.private_key)
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::KeyExport(e.to_string()))
    }
}

#[async_trait]
impl Decryption for RsaDecryption {
    fn public_key_pem(&self) -> String {
        self.public_pem.clone()
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<String, CryptoError> {
        let plaintext = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }
}

/// Encrypt-only handle on the server's public key
pub struct RsaEncryption {
    public_key: RsaPublicKey,
}

impl RsaEncryption {
    /// Parse an SPKI or PKCS#1 DER public key
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let public_key = RsaPublicKey::from_public_key_der(der)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { public_key })
    }

    /// Largest plaintext this key can encrypt in one block
    pub fn max_plaintext_len(&self) -> usize {
        use rsa::traits::PublicKeyParts;
        self.public_key.size().saturating_sub(OAEP_OVERHEAD)
    }
}

#[async_trait]
impl Encryption for RsaEncryption {
    async fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > self.max_plaintext_len() {
            return Err(CryptoError::Encryption(format!(
                "plaintext of {} bytes exceeds the {} byte OAEP limit",
                plaintext.len(),
                self.max_plaintext_len()
            )));
        }
        self.public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext.as_bytes())
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }
}

/// Imports server keys as [`RsaEncryption`]
#[derive(Debug, Default, Clone, Copy)]
pub struct RsaEncryptionProvider;

#[async_trait]
impl EncryptionProvider for RsaEncryptionProvider {
    async fn import(&self, public_key: &[u8]) -> Result<Arc<dyn Encryption>, CryptoError> {
        Ok(Arc::new(RsaEncryption::from_der(public_key)?))
    }
}
