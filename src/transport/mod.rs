//! Message transports
//!
//! A [`Transport`] moves JSON records in both directions and reports its
//! connection state. The raw transport (for example
//! [`websocket::WebSocketTransport`]) and
//! the post-handshake [`EncryptedChannel`](crate::protocol::EncryptedChannel)
//! share this shape, so the connection lifecycle can treat either as "the
//! connection".

pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::stream::Subscription;

/// Connection state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connected,
    Disconnected,
}

/// Bidirectional message transport
pub trait Transport: Send + Sync {
    /// Queue a record for sending
    fn send(&self, payload: Value) -> Result<(), TransportError>;

    /// Stream of inbound records
    fn incoming(&self) -> Subscription<Value>;

    /// Replay-latest stream of connection state changes
    fn connection_state(&self) -> Subscription<ConnectionState>;
}

/// Creates a fresh raw transport for each connection attempt
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Transport>, TransportError>;
}
