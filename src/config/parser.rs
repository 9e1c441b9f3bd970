//! Client configuration file parser
//!
//! Parses `.conf` files with a single [Client] section.

use std::path::Path;
use std::time::Duration;

use tokio_tungstenite::tungstenite::http::Uri;

use crate::client::DEFAULT_RECONNECT_DELAY;
use crate::crypto::rsa::DEFAULT_KEY_BITS;
use crate::error::ConfigError;

/// Smallest accepted RSA modulus
pub const MIN_KEY_BITS: usize = 1024;

/// Largest accepted RSA modulus
pub const MAX_KEY_BITS: usize = 8192;

/// Complete client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server WebSocket URL, `ws://host:port/ws`
    pub endpoint: String,
    /// RSA modulus size for the local keypair
    pub key_bits: usize,
    /// Delay before reconnecting after a failure
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    /// Defaults for everything but the endpoint
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ConfigError> {
        let endpoint = endpoint.into();
        validate_endpoint(&endpoint)?;
        Ok(Self {
            endpoint,
            key_bits: DEFAULT_KEY_BITS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        })
    }

    /// Parse a client configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a client configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut current_section: Option<Section> = None;
        let mut endpoint: Option<String> = None;
        let mut key_bits = DEFAULT_KEY_BITS;
        let mut reconnect_delay = DEFAULT_RECONNECT_DELAY;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[client]") {
                current_section = Some(Section::Client);
                continue;
            } else if line.starts_with('[') {
                tracing::debug!("Skipping unknown section {}", line);
                current_section = Some(Section::Unknown);
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Client) => match key.as_str() {
                    "endpoint" => {
                        validate_endpoint(value)?;
                        endpoint = Some(value.to_string());
                    }
                    "keybits" => {
                        key_bits = value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid KeyBits: {}", value),
                        })?;
                        validate_key_bits(key_bits)?;
                    }
                    "reconnectdelay" => {
                        let millis: u64 = value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid ReconnectDelay: {}", value),
                        })?;
                        reconnect_delay = Duration::from_millis(millis);
                    }
                    _ => {
                        // Unknown key, ignore (forward compatibility)
                        tracing::debug!("Unknown client key: {}", key);
                    }
                },
                Some(Section::Unknown) => {}
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        let endpoint = endpoint.ok_or(ConfigError::MissingField {
            field: "Endpoint".to_string(),
        })?;

        Ok(ClientConfig {
            endpoint,
            key_bits,
            reconnect_delay,
        })
    }

    /// Replace the endpoint, validating it
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Result<Self, ConfigError> {
        let endpoint = endpoint.into();
        validate_endpoint(&endpoint)?;
        self.endpoint = endpoint;
        Ok(self)
    }

    /// Replace the key size, validating it
    pub fn with_key_bits(mut self, key_bits: usize) -> Result<Self, ConfigError> {
        validate_key_bits(key_bits)?;
        self.key_bits = key_bits;
        Ok(self)
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Client,
    Unknown,
}

/// Check an endpoint is a `ws://` URL with a host
fn validate_endpoint(value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidEndpoint {
        value: value.to_string(),
    };

    let uri: Uri = value.parse().map_err(|_| invalid())?;
    if uri.scheme_str() != Some("ws") {
        return Err(invalid());
    }
    match uri.host() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

fn validate_key_bits(bits: usize) -> Result<(), ConfigError> {
    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
        return Err(ConfigError::InvalidKeyBits {
            bits,
            min: MIN_KEY_BITS,
            max: MAX_KEY_BITS,
        });
    }
    Ok(())
}
