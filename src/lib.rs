//! Encrypto - encrypted messaging client
//!
//! Establishes and maintains a secure, message-oriented channel to a server
//! over a plain JSON transport, using an RSA key exchange with
//! challenge/response verification and automatic reconnection.
//!
//! # Features
//!
//! - Generic state machine engine with declared transition maps
//! - 11-step handshake (key exchange + verification) built on it
//! - Encrypted channel with the same shape as the raw transport
//! - Unbounded reconnect loop with a fixed delay
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use encrypto::crypto::rsa::{RsaDecryption, RsaEncryptionProvider};
//! use encrypto::transport::websocket::WebSocketTransportFactory;
//! use encrypto::{ClientConfig, ConnectionLifecycle, HandshakeWorkflow};
//!
//! #[tokio::main]
//! async fn main() -> encrypto::Result<()> {
//!     let config = ClientConfig::from_file("encrypto.conf")?;
//!     let keys = RsaDecryption::generate(config.key_bits).await?;
//!     let workflow = HandshakeWorkflow::new(Arc::new(keys), Arc::new(RsaEncryptionProvider));
//!     let factory = Arc::new(WebSocketTransportFactory::new(config.endpoint));
//!
//!     let connection = ConnectionLifecycle::new(factory, workflow, config.reconnect_delay).spawn();
//!     let mut incoming = connection.incoming();
//!     connection.dispatch(serde_json::json!({"hello": "world"}))?;
//!     while let Some(message) = incoming.recv().await {
//!         println!("{}", message);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{ConnectionHandle, ConnectionLifecycle, LifecycleState};
pub use config::ClientConfig;
pub use error::{EncryptoError, Result};
pub use protocol::{EncryptedChannel, HandshakeWorkflow};
