//! Post-handshake encrypted channel
//!
//! Wraps the raw transport with the negotiated keys:
//! - outgoing records are serialized, encrypted with the server's key and sent
//!   as `Message` records
//! - inbound `Message` records are decrypted with our key, parsed as JSON and
//!   republished; the incoming stream replays the latest value, seeded with
//!   the first message decrypted during the handshake. The first call to
//!   `incoming` gets a subscription opened at construction, so it sees the
//!   seed and every message after it
//! - connection state passes straight through
//!
//! Crypto failures are logged and the record dropped.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::messages::{ClientMessage, ServerMessage};
use crate::crypto::{Decryption, Encryption};
use crate::error::TransportError;
use crate::stream::{Publisher, Subscription};
use crate::transport::{ConnectionState, Transport};

/// Transport-shaped adapter that encrypts and decrypts transparently
pub struct EncryptedChannel {
    raw: Arc<dyn Transport>,
    outgoing: mpsc::UnboundedSender<Value>,
    incoming: Publisher<Value>,
    first: Mutex<Option<Subscription<Value>>>,
    tasks: [JoinHandle<()>; 2],
}

/// Parse decrypted text as JSON, keeping non-JSON text as a string value
fn decode_plaintext(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

impl EncryptedChannel {
    /// Wrap `raw`, seeding the incoming stream with `initial`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        raw: Arc<dyn Transport>,
        server_encryption: Arc<dyn Encryption>,
        decryption: Arc<dyn Decryption>,
        initial: String,
    ) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let incoming = Publisher::replaying(Some(decode_plaintext(initial)));
        let first = Mutex::new(Some(incoming.subscribe()));

        let send_task = tokio::spawn(encrypt_outgoing(
            Arc::clone(&raw),
            server_encryption,
            outgoing_rx,
        ));
        let recv_task = tokio::spawn(decrypt_incoming(
            raw.incoming(),
            decryption,
            incoming.clone(),
        ));

        Self {
            raw,
            outgoing,
            incoming,
            first,
            tasks: [send_task, recv_task],
        }
    }
}

async fn encrypt_outgoing(
    raw: Arc<dyn Transport>,
    encryption: Arc<dyn Encryption>,
    mut outgoing: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(payload) = outgoing.recv().await {
        let plaintext = payload.to_string();
        let ciphertext = match encryption.encrypt(&plaintext).await {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                tracing::warn!("Dropping outgoing message: {}", e);
                continue;
            }
        };

        let record = match ClientMessage::Message(ciphertext).to_value() {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Dropping outgoing message: {}", e);
                continue;
            }
        };

        tracing::debug!("Sending encrypted message ({} plaintext bytes)", plaintext.len());
        if let Err(e) = raw.send(record) {
            tracing::warn!("Dropping outgoing message: {}", e);
        }
    }
}

async fn decrypt_incoming(
    mut raw_incoming: Subscription<Value>,
    decryption: Arc<dyn Decryption>,
    incoming: Publisher<Value>,
) {
    while let Some(record) = raw_incoming.recv().await {
        let body = match ServerMessage::from_value(&record) {
            Ok(ServerMessage::Message { body }) => body,
            Ok(other) => {
                tracing::debug!("Ignoring non-message record on encrypted channel: {:?}", other);
                continue;
            }
            Err(e) => {
                tracing::warn!("Dropping inbound record: {}", e);
                continue;
            }
        };

        match decryption.decrypt(&body).await {
            Ok(text) => incoming.publish(decode_plaintext(text)),
            Err(e) => tracing::warn!("Dropping undecryptable message: {}", e),
        }
    }
}

impl Transport for EncryptedChannel {
    fn send(&self, payload: Value) -> Result<(), TransportError> {
        self.outgoing
            .send(payload)
            .map_err(|_| TransportError::Closed)
    }

    fn incoming(&self) -> Subscription<Value> {
        let first = self
            .first
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        first.unwrap_or_else(|| self.incoming.subscribe())
    }

    fn connection_state(&self) -> Subscription<ConnectionState> {
        self.raw.connection_state()
    }
}

impl Drop for EncryptedChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{reversed, MemoryTransport, ReverseCipher};
    use serde_json::json;

    fn channel(raw: &Arc<MemoryTransport>, initial: &str) -> EncryptedChannel {
        EncryptedChannel::new(
            raw.clone(),
            Arc::new(ReverseCipher::default()),
            Arc::new(ReverseCipher::default()),
            initial.to_string(),
        )
    }

    #[tokio::test]
    async fn test_outgoing_is_encrypted_and_wrapped() {
        let raw = MemoryTransport::new();
        let mut sent = raw.sent();
        let channel = channel(&raw, "{}");

        channel.send(json!({"Varient": "connect"})).unwrap();

        let record = sent.recv().await.unwrap();
        let plaintext = r#"{"Varient":"connect"}"#;
        assert_eq!(
            record,
            json!({"Varient": "Message", "Data": reversed(plaintext.as_bytes())})
        );
    }

    #[tokio::test]
    async fn test_incoming_replays_initial_then_decrypts() {
        let raw = MemoryTransport::new();
        let channel = channel(&raw, r#"{"variant":"AvailableActions"}"#);

        let mut incoming = channel.incoming();
        assert_eq!(
            incoming.recv().await.unwrap(),
            json!({"variant": "AvailableActions"})
        );

        // Dropped: wrong tag, then undecryptable, then plain text surfaced as a string
        raw.deliver(json!({"variant": "KeyReceived"}));
        raw.deliver(json!({"variant": "Message", "body": [0xff, 0xfe]}));
        raw.deliver(json!({"variant": "Message", "body": reversed(b"hello")}));
        raw.deliver(json!({"variant": "Message", "body": reversed(br#"{"variant":"Message","body":1}"#)}));

        assert_eq!(incoming.recv().await.unwrap(), json!("hello"));
        assert_eq!(
            incoming.recv().await.unwrap(),
            json!({"variant": "Message", "body": 1})
        );
    }

    #[tokio::test]
    async fn test_first_subscriber_sees_seed_and_early_messages() {
        let raw = MemoryTransport::new();
        let channel = channel(&raw, r#"{"variant":"AvailableActions"}"#);

        // Decrypted before anyone subscribes
        raw.deliver(json!({"variant": "Message", "body": reversed(b"1")}));
        raw.deliver(json!({"variant": "Message", "body": reversed(b"2")}));
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let mut first = channel.incoming();
        assert_eq!(
            first.recv().await.unwrap(),
            json!({"variant": "AvailableActions"})
        );
        assert_eq!(first.recv().await.unwrap(), json!(1));
        assert_eq!(first.recv().await.unwrap(), json!(2));

        let mut later = channel.incoming();
        assert_eq!(later.recv().await.unwrap(), json!(2));
        assert!(later.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_encryption_failure_drops_send() {
        let raw = MemoryTransport::new();
        let mut sent = raw.sent();
        let channel = EncryptedChannel::new(
            raw.clone(),
            Arc::new(ReverseCipher::failing()),
            Arc::new(ReverseCipher::default()),
            String::new(),
        );

        channel.send(json!("secret")).unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(sent.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_connection_state_passes_through() {
        let raw = MemoryTransport::new();
        let channel = channel(&raw, "");
        let mut states = channel.connection_state();
        assert_eq!(states.recv().await, Some(ConnectionState::Pending));

        raw.set_state(ConnectionState::Disconnected);
        assert_eq!(states.recv().await, Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_drop_releases_raw_subscription() {
        let raw = MemoryTransport::new();
        let channel = channel(&raw, "");
        tokio::task::yield_now().await;
        assert_eq!(raw.incoming_subscribers(), 1);

        drop(channel);
        tokio::task::yield_now().await;
        assert_eq!(raw.incoming_subscribers(), 0);
    }
}
