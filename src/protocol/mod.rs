//! Encrypted handshake protocol
//!
//! This module contains the protocol components:
//! - Wire formats for both directions
//! - The handshake state machine
//! - The workflow that drives it over a raw transport
//! - The encrypted channel produced by a successful handshake

pub mod channel;
pub mod handshake;
pub mod messages;
pub mod state;

pub use channel::EncryptedChannel;
pub use handshake::{HandshakeWorkflow, MachineFactory};
pub use messages::{variant_of, ClientMessage, ServerMessage};
pub use state::{
    new_handshake_machine, HandshakeContext, HandshakeMachine, HandshakeState,
    HandshakeTransition,
};
