//! Handshake wire formats
//!
//! Both directions are JSON records, but the two ends disagree on field names:
//! - client → server: `{"Varient": <tag>, "Data": <payload>}`
//! - server → client: `{"variant": <tag>, "body": <payload>}`
//!
//! Byte strings travel as JSON integer arrays. The server writes signed bytes,
//! so inbound arrays accept -128..=255 and reinterpret each value as `u8`.
//! Anything outside that range rejects the whole record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Records sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "Varient", content = "Data")]
pub enum ClientMessage {
    /// Our public key, PEM encoded
    SetPublicKey {
        #[serde(rename = "PublicKey")]
        public_key: String,
    },
    /// Ask for the server's public key
    GetPublicKey,
    /// Ask for an encrypted challenge
    GetVerification,
    /// The challenge, re-encrypted with the server's key
    Verify { message: Vec<u8> },
    /// Encrypted application payload
    Message(Vec<u8>),
}

impl ClientMessage {
    /// Encode as a transport record
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Records sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Post-verification invitation listing what the client may do next
    AvailableActions(Vec<String>),
    /// Server public key (DER)
    ServerKey { public_key: Vec<u8> },
    /// Server accepted our public key
    KeyReceived,
    /// Challenge encrypted with our public key
    Verification { message: Vec<u8> },
    /// Encrypted payload
    Message { body: Vec<u8> },
    /// Server is ready to start the handshake
    Ready,
    /// Server reported a failure and is about to drop the connection
    Error(String),
}

#[derive(Deserialize)]
struct Envelope {
    variant: Option<String>,
    #[serde(default)]
    body: Value,
}

#[derive(Deserialize)]
struct KeyBody {
    #[serde(rename = "publicKey")]
    public_key: Vec<i64>,
}

#[derive(Deserialize)]
struct VerificationBody {
    message: Vec<i64>,
}

/// Reinterpret wire integers as bytes, negatives as two's complement
fn to_bytes(variant: &str, values: Vec<i64>) -> Result<Vec<u8>, ProtocolError> {
    values
        .into_iter()
        .map(|v| {
            u8::try_from(v)
                .or_else(|_| i8::try_from(v).map(|b| b as u8))
                .map_err(|_| ProtocolError::InvalidBody {
                    variant: variant.to_string(),
                    reason: format!("byte value {} out of range", v),
                })
        })
        .collect()
}

fn body<T: for<'de> Deserialize<'de>>(variant: &str, body: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(body).map_err(|e| ProtocolError::InvalidBody {
        variant: variant.to_string(),
        reason: e.to_string(),
    })
}

impl ServerMessage {
    /// Decode a transport record
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_value(value.clone()).map_err(|_| ProtocolError::Untagged)?;
        let variant = envelope.variant.ok_or(ProtocolError::Untagged)?;

        match variant.as_str() {
            "AvailableActions" => {
                let actions = if envelope.body.is_null() {
                    Vec::new()
                } else {
                    body(&variant, envelope.body)?
                };
                Ok(Self::AvailableActions(actions))
            }
            "ServerKey" => {
                let key: KeyBody = body(&variant, envelope.body)?;
                Ok(Self::ServerKey {
                    public_key: to_bytes(&variant, key.public_key)?,
                })
            }
            "KeyReceived" => Ok(Self::KeyReceived),
            "Verification" => {
                let verification: VerificationBody = body(&variant, envelope.body)?;
                Ok(Self::Verification {
                    message: to_bytes(&variant, verification.message)?,
                })
            }
            "Message" => {
                let values = body(&variant, envelope.body)?;
                Ok(Self::Message {
                    body: to_bytes(&variant, values)?,
                })
            }
            "Ready" => Ok(Self::Ready),
            "Error" => Ok(Self::Error(match envelope.body {
                Value::String(reason) => reason,
                other => other.to_string(),
            })),
            _ => Err(ProtocolError::UnknownVariant { variant }),
        }
    }
}

/// Variant tag of an inbound record, if it has one
pub fn variant_of(value: &Value) -> Option<&str> {
    value.get("variant").and_then(Value::as_str)
}
