//! In-memory doubles for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::crypto::{Decryption, Encryption, EncryptionProvider};
use crate::error::{CryptoError, TransportError};
use crate::stream::{Publisher, Subscription};
use crate::transport::{ConnectionState, Transport, TransportFactory};

/// Byte-reversed copy of `bytes`, the stub cipher's ciphertext
pub fn reversed(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// Transport driven by the test
pub struct MemoryTransport {
    incoming: Publisher<Value>,
    state: Publisher<ConnectionState>,
    sent: Publisher<Value>,
    refuse_sends: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            incoming: Publisher::new(),
            state: Publisher::replaying(Some(ConnectionState::Pending)),
            sent: Publisher::new(),
            refuse_sends: AtomicBool::new(false),
        })
    }

    /// Push an inbound record
    pub fn deliver(&self, value: Value) {
        self.incoming.publish(value);
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.publish(state);
    }

    /// Records sent from now on
    pub fn sent(&self) -> Subscription<Value> {
        self.sent.subscribe()
    }

    pub fn refuse_sends(&self) {
        self.refuse_sends.store(true, Ordering::SeqCst);
    }

    pub fn incoming_subscribers(&self) -> usize {
        self.incoming.subscriber_count()
    }

    pub fn state_subscribers(&self) -> usize {
        self.state.subscriber_count()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, payload: Value) -> Result<(), TransportError> {
        if self.refuse_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.publish(payload);
        Ok(())
    }

    fn incoming(&self) -> Subscription<Value> {
        self.incoming.subscribe()
    }

    fn connection_state(&self) -> Subscription<ConnectionState> {
        self.state.subscribe()
    }
}

/// Deterministic stand-in for RSA: ciphertext is the reversed plaintext
#[derive(Debug, Default, Clone)]
pub struct ReverseCipher {
    fail: bool,
}

impl ReverseCipher {
    /// Cipher whose every operation fails
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

pub const TEST_PEM: &str = "-----BEGIN PUBLIC KEY-----\nTEST\n-----END PUBLIC KEY-----\n";

/// Key bytes [`ReverseCipher`] refuses to import
pub const BAD_KEY: &[u8] = b"bad";

#[async_trait]
impl Decryption for ReverseCipher {
    fn public_key_pem(&self) -> String {
        TEST_PEM.to_string()
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<String, CryptoError> {
        if self.fail {
            return Err(CryptoError::Decryption("stub failure".into()));
        }
        String::from_utf8(reversed(ciphertext)).map_err(|_| CryptoError::InvalidUtf8)
    }
}

#[async_trait]
impl Encryption for ReverseCipher {
    async fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        if self.fail {
            return Err(CryptoError::Encryption("stub failure".into()));
        }
        Ok(reversed(plaintext.as_bytes()))
    }
}

#[async_trait]
impl EncryptionProvider for ReverseCipher {
    async fn import(&self, public_key: &[u8]) -> Result<Arc<dyn Encryption>, CryptoError> {
        if public_key == BAD_KEY {
            return Err(CryptoError::InvalidPublicKey("unparsable".into()));
        }
        Ok(Arc::new(self.clone()))
    }
}

/// Factory that replays scripted outcomes, then hands out fresh transports
#[derive(Default)]
pub struct ScriptedFactory {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    created: Publisher<Arc<MemoryTransport>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `create` fail
    pub fn fail_next(&self, err: TransportError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Transports created from now on
    pub fn created(&self) -> Subscription<Arc<MemoryTransport>> {
        self.created.subscribe()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let outcome = self.script.lock().unwrap().pop_front();
        if let Some(Err(e)) = outcome {
            return Err(e);
        }
        let transport = MemoryTransport::new();
        self.created.publish(Arc::clone(&transport));
        Ok(transport)
    }
}
