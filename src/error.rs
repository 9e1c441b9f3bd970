//! Error types for the encrypto client

use thiserror::Error;

/// Main error type for encrypto
#[derive(Error, Debug)]
pub enum EncryptoError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake errors
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid endpoint: {value}")]
    InvalidEndpoint { value: String },

    #[error("Invalid key size {bits}: expected {min}..={max} bits")]
    InvalidKeyBits { bits: usize, min: usize, max: usize },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Public key export failed: {0}")]
    KeyExport(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Wire message errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Message has no variant tag")]
    Untagged,

    #[error("Unknown message variant: {variant}")]
    UnknownVariant { variant: String },

    #[error("Invalid body for {variant}: {reason}")]
    InvalidBody { variant: String, reason: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Raw transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Transport closed")]
    Closed,
}

/// Reasons a single handshake attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The handshake machine entered its error state
    #[error("Handshake aborted")]
    Aborted,

    /// A state was entered without the context it depends on
    #[error("Handshake context is missing {field}")]
    MissingContext { field: &'static str },

    /// Every transport stream ended before the handshake finished
    #[error("Transport closed during handshake")]
    TransportClosed,
}

impl EncryptoError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::MissingField { field }) => {
                format!(
                    "Missing {} in config.\n  Add it to the [Client] section or pass it on the command line.",
                    field
                )
            }

            Self::Transport(TransportError::ConnectFailed { endpoint, .. }) => {
                format!(
                    "Could not connect to {}.\n  Check that the server is running and reachable.",
                    endpoint
                )
            }

            Self::Crypto(CryptoError::KeyGeneration(reason)) => {
                format!("Could not generate the local RSA keypair: {}", reason)
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal errors
            Self::Config(_) => false,
            Self::Crypto(CryptoError::KeyGeneration(_)) => false,
            Self::System(_) => false,

            // Recoverable errors, the lifecycle retries these
            Self::Transport(_) => true,
            Self::Handshake(_) => true,
            Self::Protocol(_) => true,
            Self::Crypto(_) => true,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Transport(_) => 3,
            Self::Protocol(_) => 4,
            Self::Crypto(_) => 5,
            Self::Handshake(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for encrypto operations
pub type Result<T> = std::result::Result<T, EncryptoError>;
