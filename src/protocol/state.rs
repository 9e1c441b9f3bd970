//! Handshake protocol machine
//!
//! Strictly linear happy path, one edge per step, plus a universal `Error`
//! edge from every state. `Error` loops on itself and `Reset` returns to
//! `Pending`.
//!
//! ```text
//! Pending -Connect-> Connected -SentKey-> ClientKeySent -ConfirmedKey->
//! ClientKeyReceived -RequestedServerKey-> ServerKeyRequested
//! -ServerKeyReceived-> KeysExchanged -RequestVerification->
//! ServerVerificationRequested -ReceivedVerification->
//! ServerVerificationReceived -SentVerification-> VerificationResponseSent
//! -ConfirmVerification-> VerificationConfirmed
//! ```

use std::fmt;
use std::sync::Arc;

use crate::crypto::Encryption;
use crate::machine::{Machine, StateMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Pending,
    Error,
    Connected,
    ClientKeySent,
    ClientKeyReceived,
    ServerKeyRequested,
    KeysExchanged,
    ServerVerificationRequested,
    ServerVerificationReceived,
    VerificationResponseSent,
    VerificationConfirmed,
}

impl HandshakeState {
    pub const ALL: [HandshakeState; 11] = [
        Self::Pending,
        Self::Error,
        Self::Connected,
        Self::ClientKeySent,
        Self::ClientKeyReceived,
        Self::ServerKeyRequested,
        Self::KeysExchanged,
        Self::ServerVerificationRequested,
        Self::ServerVerificationReceived,
        Self::VerificationResponseSent,
        Self::VerificationConfirmed,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeTransition {
    Connect,
    Error,
    SentKey,
    ConfirmedKey,
    RequestedServerKey,
    ServerKeyReceived,
    RequestVerification,
    ReceivedVerification,
    SentVerification,
    ConfirmVerification,
    Reset,
}

impl HandshakeTransition {
    pub const ALL: [HandshakeTransition; 11] = [
        Self::Connect,
        Self::Error,
        Self::SentKey,
        Self::ConfirmedKey,
        Self::RequestedServerKey,
        Self::ServerKeyReceived,
        Self::RequestVerification,
        Self::ReceivedVerification,
        Self::SentVerification,
        Self::ConfirmVerification,
        Self::Reset,
    ];
}

/// Handshake topology
pub struct HandshakeMap;

impl StateMap for HandshakeMap {
    type State = HandshakeState;
    type Transition = HandshakeTransition;

    fn target(state: HandshakeState, transition: HandshakeTransition) -> Option<HandshakeState> {
        use HandshakeState as S;
        use HandshakeTransition as T;

        match (state, transition) {
            (_, T::Error) => Some(S::Error),
            (S::Error, T::Reset) => Some(S::Pending),
            (S::Pending, T::Connect) => Some(S::Connected),
            (S::Connected, T::SentKey) => Some(S::ClientKeySent),
            (S::ClientKeySent, T::ConfirmedKey) => Some(S::ClientKeyReceived),
            (S::ClientKeyReceived, T::RequestedServerKey) => Some(S::ServerKeyRequested),
            (S::ServerKeyRequested, T::ServerKeyReceived) => Some(S::KeysExchanged),
            (S::KeysExchanged, T::RequestVerification) => Some(S::ServerVerificationRequested),
            (S::ServerVerificationRequested, T::ReceivedVerification) => {
                Some(S::ServerVerificationReceived)
            }
            (S::ServerVerificationReceived, T::SentVerification) => {
                Some(S::VerificationResponseSent)
            }
            (S::VerificationResponseSent, T::ConfirmVerification) => {
                Some(S::VerificationConfirmed)
            }
            _ => None,
        }
    }

    fn accepted(state: HandshakeState) -> &'static [HandshakeTransition] {
        use HandshakeState as S;
        use HandshakeTransition as T;

        match state {
            S::Pending => &[T::Connect, T::Error],
            S::Error => &[T::Error, T::Reset],
            S::Connected => &[T::SentKey, T::Error],
            S::ClientKeySent => &[T::ConfirmedKey, T::Error],
            S::ClientKeyReceived => &[T::RequestedServerKey, T::Error],
            S::ServerKeyRequested => &[T::ServerKeyReceived, T::Error],
            S::KeysExchanged => &[T::RequestVerification, T::Error],
            S::ServerVerificationRequested => &[T::ReceivedVerification, T::Error],
            S::ServerVerificationReceived => &[T::SentVerification, T::Error],
            S::VerificationResponseSent => &[T::ConfirmVerification, T::Error],
            S::VerificationConfirmed => &[T::Error],
        }
    }
}

/// Values accumulated over the handshake
#[derive(Clone, Default)]
pub struct HandshakeContext {
    /// Encrypt-only capability for the server's key
    pub server_encryption: Option<Arc<dyn Encryption>>,
    /// Decrypted challenge
    pub verification_code: Option<String>,
    /// First decrypted message after verification
    pub message: Option<String>,
}

impl fmt::Debug for HandshakeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeContext")
            .field("server_encryption", &self.server_encryption.is_some())
            .field("verification_code", &self.verification_code.is_some())
            .field("message", &self.message.is_some())
            .finish()
    }
}

pub type HandshakeMachine = Machine<HandshakeMap, HandshakeContext>;

/// Fresh handshake machine in `Pending`
pub fn new_handshake_machine() -> HandshakeMachine {
    HandshakeMachine::new(HandshakeState::Pending)
}
