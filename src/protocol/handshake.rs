//! Handshake workflow
//!
//! Drives a [`HandshakeMachine`] from two event sources, the raw transport's
//! connection state and its inbound records, and reacts to every entered
//! state by sending the next request:
//!
//! ```text
//! client                                  server
//!   |-- SetPublicKey {pem} ------------------>|
//!   |<------------------------- KeyReceived --|
//!   |-- GetPublicKey ------------------------>|
//!   |<------------------- ServerKey {der} ----|
//!   |-- GetVerification --------------------->|
//!   |<------------ Verification {E_c(code)} --|
//!   |-- Verify {E_s(code)} ------------------>|
//!   |<------------------ Message {E_c(msg)} --|
//! ```
//!
//! Crypto work runs as tasks that fire the next transition when they finish.
//! A completion that arrives after the machine has moved on is rejected by
//! the machine and dropped.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;

use super::channel::EncryptedChannel;
use super::messages::{ClientMessage, ServerMessage};
use super::state::{
    new_handshake_machine, HandshakeContext, HandshakeMachine, HandshakeState,
    HandshakeTransition,
};
use crate::crypto::{Decryption, EncryptionProvider};
use crate::error::HandshakeError;
use crate::machine::Snapshot;
use crate::transport::{ConnectionState, Transport};

/// Creates the machine for one handshake attempt
pub type MachineFactory = Arc<dyn Fn() -> Arc<HandshakeMachine> + Send + Sync>;

/// Runs handshakes over raw transports
#[derive(Clone)]
pub struct HandshakeWorkflow {
    decryption: Arc<dyn Decryption>,
    encryption_provider: Arc<dyn EncryptionProvider>,
    machine_factory: MachineFactory,
}

impl HandshakeWorkflow {
    /// Workflow using our keypair and a way to import the server's key
    pub fn new(
        decryption: Arc<dyn Decryption>,
        encryption_provider: Arc<dyn EncryptionProvider>,
    ) -> Self {
        Self {
            decryption,
            encryption_provider,
            machine_factory: Arc::new(|| Arc::new(new_handshake_machine())),
        }
    }

    /// Replace the machine factory
    pub fn with_machine_factory(mut self, machine_factory: MachineFactory) -> Self {
        self.machine_factory = machine_factory;
        self
    }

    /// Perform one handshake over `transport`
    ///
    /// Resolves with the encrypted channel once the server's first encrypted
    /// message has been decrypted, or with an error as soon as the machine
    /// enters `Error`. All transport subscriptions are released either way.
    pub async fn run(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<EncryptedChannel, HandshakeError> {
        let attempt = Attempt {
            machine: (self.machine_factory)(),
            transport,
            decryption: Arc::clone(&self.decryption),
            encryption_provider: Arc::clone(&self.encryption_provider),
        };
        attempt.drive().await
    }
}

/// State for a single handshake attempt
struct Attempt {
    machine: Arc<HandshakeMachine>,
    transport: Arc<dyn Transport>,
    decryption: Arc<dyn Decryption>,
    encryption_provider: Arc<dyn EncryptionProvider>,
}

type Outcome = Result<EncryptedChannel, HandshakeError>;

impl Attempt {
    async fn drive(self) -> Outcome {
        let mut snapshots = self.machine.subscribe();
        let mut connection = self.transport.connection_state();
        let mut incoming = self.transport.incoming();
        // Dropping the set aborts crypto work still in flight
        let mut crypto = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                Some(snapshot) = snapshots.recv() => {
                    if let Some(outcome) = self.on_enter(snapshot, &mut crypto) {
                        return outcome;
                    }
                }

                Some(state) = connection.recv() => self.on_connection_state(state),

                Some(record) = incoming.recv() => self.on_record(record, &mut crypto),

                Some(joined) = crypto.join_next(), if !crypto.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Handshake crypto task failed: {}", e);
                        self.machine.pure_transition(HandshakeTransition::Error);
                    }
                }

                else => return Err(HandshakeError::TransportClosed),
            }
        }
    }

    fn on_connection_state(&self, state: ConnectionState) {
        tracing::debug!("Transport state -> {:?}", state);
        match state {
            ConnectionState::Connected => {
                self.machine.pure_transition(HandshakeTransition::Connect);
            }
            ConnectionState::Disconnected => {
                self.machine.pure_transition(HandshakeTransition::Error);
            }
            ConnectionState::Pending => {}
        }
    }

    fn on_record(&self, record: Value, crypto: &mut JoinSet<()>) {
        let message = match ServerMessage::from_value(&record) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping inbound record ({}): {}", e, record);
                return;
            }
        };

        match message {
            ServerMessage::ServerKey { public_key } => {
                tracing::debug!("Received server key ({} bytes)", public_key.len());
                let machine = Arc::clone(&self.machine);
                let provider = Arc::clone(&self.encryption_provider);
                crypto.spawn(async move {
                    match provider.import(&public_key).await {
                        Ok(server_encryption) => {
                            machine.transition(HandshakeTransition::ServerKeyReceived, |c| {
                                HandshakeContext {
                                    server_encryption: Some(server_encryption),
                                    ..c.clone()
                                }
                            });
                        }
                        // The attempt stays in ServerKeyRequested until the server resends or drops us
                        Err(e) => tracing::error!("Could not import server key: {}", e),
                    }
                });
            }

            ServerMessage::KeyReceived => {
                self.machine.pure_transition(HandshakeTransition::ConfirmedKey);
            }

            ServerMessage::Verification { message } => {
                let machine = Arc::clone(&self.machine);
                let decryption = Arc::clone(&self.decryption);
                crypto.spawn(async move {
                    match decryption.decrypt(&message).await {
                        Ok(code) => {
                            machine.transition(HandshakeTransition::ReceivedVerification, |c| {
                                HandshakeContext {
                                    verification_code: Some(code),
                                    ..c.clone()
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Could not decrypt verification: {}", e);
                            machine.pure_transition(HandshakeTransition::Error);
                        }
                    }
                });
            }

            ServerMessage::Message { body } => {
                let machine = Arc::clone(&self.machine);
                let decryption = Arc::clone(&self.decryption);
                crypto.spawn(async move {
                    match decryption.decrypt(&body).await {
                        Ok(message) => {
                            machine.transition(HandshakeTransition::ConfirmVerification, |c| {
                                HandshakeContext {
                                    message: Some(message),
                                    ..c.clone()
                                }
                            });
                        }
                        Err(e) => tracing::error!("Could not decrypt message: {}", e),
                    }
                });
            }

            ServerMessage::Ready => tracing::debug!("Server ready"),
            ServerMessage::Error(reason) => tracing::warn!("Server reported: {}", reason),
            ServerMessage::AvailableActions(_) => {
                tracing::debug!("Ignoring AvailableActions before verification")
            }
        }
    }

    fn on_enter(
        &self,
        snapshot: Snapshot<HandshakeState, HandshakeContext>,
        crypto: &mut JoinSet<()>,
    ) -> Option<Outcome> {
        let Snapshot { state, context } = snapshot;
        tracing::info!("Handshake -> {:?}", state);

        match state {
            HandshakeState::Connected => {
                let key = ClientMessage::SetPublicKey {
                    public_key: self.decryption.public_key_pem(),
                };
                if self.send(&key) {
                    self.machine.pure_transition(HandshakeTransition::SentKey);
                }
                None
            }

            HandshakeState::ClientKeyReceived => {
                if self.send(&ClientMessage::GetPublicKey) {
                    self.machine.pure_transition(HandshakeTransition::RequestedServerKey);
                }
                None
            }

            HandshakeState::KeysExchanged => {
                if self.send(&ClientMessage::GetVerification) {
                    self.machine.pure_transition(HandshakeTransition::RequestVerification);
                }
                None
            }

            HandshakeState::ServerVerificationReceived => {
                let (server_encryption, code) =
                    match (context.server_encryption, context.verification_code) {
                        (Some(server_encryption), Some(code)) => (server_encryption, code),
                        (None, _) => return Some(Err(missing("server encryption"))),
                        (_, None) => return Some(Err(missing("verification code"))),
                    };

                let machine = Arc::clone(&self.machine);
                let transport = Arc::clone(&self.transport);
                crypto.spawn(async move {
                    let verify = match server_encryption.encrypt(&code).await {
                        Ok(message) => ClientMessage::Verify { message },
                        Err(e) => {
                            tracing::error!("Could not encrypt verification: {}", e);
                            machine.pure_transition(HandshakeTransition::Error);
                            return;
                        }
                    };
                    if let Err(e) = send(transport.as_ref(), &verify) {
                        tracing::error!("Could not send verification: {}", e);
                        machine.pure_transition(HandshakeTransition::Error);
                    }
                });

                self.machine.pure_transition(HandshakeTransition::SentVerification);
                None
            }

            HandshakeState::VerificationConfirmed => {
                match &context.message {
                    Some(message) => tracing::debug!("First message: {}", message),
                    None => tracing::warn!("Verification confirmed without a message"),
                }

                let outcome = match (context.server_encryption, context.message) {
                    (Some(server_encryption), Some(message)) => Ok(EncryptedChannel::new(
                        Arc::clone(&self.transport),
                        server_encryption,
                        Arc::clone(&self.decryption),
                        message,
                    )),
                    (None, _) => Err(missing("server encryption")),
                    (_, None) => Err(missing("decrypted message")),
                };
                Some(outcome)
            }

            HandshakeState::Error => Some(Err(HandshakeError::Aborted)),

            HandshakeState::Pending
            | HandshakeState::ClientKeySent
            | HandshakeState::ServerKeyRequested
            | HandshakeState::ServerVerificationRequested
            | HandshakeState::VerificationResponseSent => None,
        }
    }

    /// Send on the raw transport; a failure moves the machine to `Error`
    fn send(&self, message: &ClientMessage) -> bool {
        match send(self.transport.as_ref(), message) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Handshake send failed: {}", e);
                self.machine.pure_transition(HandshakeTransition::Error);
                false
            }
        }
    }
}

fn send(transport: &dyn Transport, message: &ClientMessage) -> Result<(), String> {
    let record = message.to_value().map_err(|e| e.to_string())?;
    transport.send(record).map_err(|e| e.to_string())
}

fn missing(field: &'static str) -> HandshakeError {
    tracing::error!("Handshake context is missing {}", field);
    HandshakeError::MissingContext { field }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Subscription;
    use crate::testing::{reversed, MemoryTransport, ReverseCipher, BAD_KEY, TEST_PEM};
    use serde_json::json;
    use tokio::task::JoinHandle;

    const FIRST_MESSAGE: &str = r#"{"variant":"AvailableActions","body":["connect","reconnect"]}"#;

    fn workflow() -> HandshakeWorkflow {
        HandshakeWorkflow::new(
            Arc::new(ReverseCipher::default()),
            Arc::new(ReverseCipher::default()),
        )
    }

    fn workflow_with(machine: &Arc<HandshakeMachine>) -> HandshakeWorkflow {
        let machine = Arc::clone(machine);
        workflow().with_machine_factory(Arc::new(move || Arc::clone(&machine)))
    }

    fn start(
        workflow: HandshakeWorkflow,
        raw: &Arc<MemoryTransport>,
    ) -> JoinHandle<Result<EncryptedChannel, HandshakeError>> {
        let raw: Arc<dyn Transport> = raw.clone();
        tokio::spawn(async move { workflow.run(raw).await })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn exchange_keys(raw: &MemoryTransport, sent: &mut Subscription<Value>) {
        raw.set_state(ConnectionState::Connected);
        assert_eq!(
            sent.recv().await.unwrap(),
            json!({"Varient": "SetPublicKey", "Data": {"PublicKey": TEST_PEM}})
        );

        raw.deliver(json!({"variant": "KeyReceived"}));
        assert_eq!(sent.recv().await.unwrap(), json!({"Varient": "GetPublicKey"}));
    }

    #[tokio::test]
    async fn test_happy_path_yields_channel() {
        let machine = Arc::new(new_handshake_machine());
        let mut states = machine.subscribe();
        let raw = MemoryTransport::new();
        let mut sent = raw.sent();
        let handle = start(workflow_with(&machine), &raw);

        exchange_keys(&raw, &mut sent).await;

        raw.deliver(json!({"variant": "ServerKey", "body": {"publicKey": [48, -126, 1]}}));
        assert_eq!(sent.recv().await.unwrap(), json!({"Varient": "GetVerification"}));

        raw.deliver(json!({"variant": "Verification", "body": {"message": reversed(b"8675309")}}));
        assert_eq!(
            sent.recv().await.unwrap(),
            json!({"Varient": "Verify", "Data": {"message": reversed(b"8675309")}})
        );

        raw.deliver(json!({"variant": "Message", "body": reversed(FIRST_MESSAGE.as_bytes())}));
        let channel = handle.await.unwrap().unwrap();

        let mut incoming = channel.incoming();
        assert_eq!(
            incoming.recv().await.unwrap(),
            json!({"variant": "AvailableActions", "body": ["connect", "reconnect"]})
        );

        let visited: Vec<_> = std::iter::from_fn(|| states.try_recv())
            .map(|s| s.state)
            .collect();
        assert_eq!(
            visited,
            vec![
                HandshakeState::Pending,
                HandshakeState::Connected,
                HandshakeState::ClientKeySent,
                HandshakeState::ClientKeyReceived,
                HandshakeState::ServerKeyRequested,
                HandshakeState::KeysExchanged,
                HandshakeState::ServerVerificationRequested,
                HandshakeState::ServerVerificationReceived,
                HandshakeState::VerificationResponseSent,
                HandshakeState::VerificationConfirmed,
            ]
        );

        let context = machine.context();
        assert_eq!(context.verification_code.as_deref(), Some("8675309"));
        assert_eq!(context.message.as_deref(), Some(FIRST_MESSAGE));

        // The workflow's own listeners are gone; only the channel's remains
        assert_eq!(raw.incoming_subscribers(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_aborts_and_releases_listeners() {
        let raw = MemoryTransport::new();
        let mut sent = raw.sent();
        let handle = start(workflow(), &raw);

        exchange_keys(&raw, &mut sent).await;
        raw.set_state(ConnectionState::Disconnected);

        assert_eq!(handle.await.unwrap().err(), Some(HandshakeError::Aborted));
        assert_eq!(raw.incoming_subscribers(), 0);
        assert_eq!(raw.state_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_bad_server_key_is_tolerated() {
        let machine = Arc::new(new_handshake_machine());
        let raw = MemoryTransport::new();
        let mut sent = raw.sent();
        let handle = start(workflow_with(&machine), &raw);

        exchange_keys(&raw, &mut sent).await;

        raw.deliver(json!({"variant": "ServerKey", "body": {"publicKey": BAD_KEY}}));
        settle().await;
        assert_eq!(machine.state(), HandshakeState::ServerKeyRequested);
        assert!(sent.try_recv().is_none());

        raw.deliver(json!({"variant": "ServerKey", "body": {"publicKey": [1, 2, 3]}}));
        assert_eq!(sent.recv().await.unwrap(), json!({"Varient": "GetVerification"}));
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_undecryptable_verification_aborts() {
        let raw = MemoryTransport::new();
        let mut sent = raw.sent();
        let handle = start(workflow(), &raw);

        exchange_keys(&raw, &mut sent).await;
        raw.deliver(json!({"variant": "ServerKey", "body": {"publicKey": [1]}}));
        sent.recv().await.unwrap();

        // Reversed bytes are not valid UTF-8
        raw.deliver(json!({"variant": "Verification", "body": {"message": [0xff, 0xfe]}}));
        assert_eq!(handle.await.unwrap().err(), Some(HandshakeError::Aborted));
    }

    #[tokio::test]
    async fn test_untagged_records_are_dropped() {
        let machine = Arc::new(new_handshake_machine());
        let raw = MemoryTransport::new();
        let mut sent = raw.sent();
        let handle = start(workflow_with(&machine), &raw);

        raw.set_state(ConnectionState::Connected);
        sent.recv().await.unwrap();

        raw.deliver(json!({"body": "no tag"}));
        raw.deliver(json!([1, 2, 3]));
        raw.deliver(json!({"variant": "Ready"}));
        settle().await;
        assert_eq!(machine.state(), HandshakeState::ClientKeySent);

        raw.deliver(json!({"variant": "KeyReceived"}));
        assert_eq!(sent.recv().await.unwrap(), json!({"Varient": "GetPublicKey"}));
        handle.abort();
    }

    #[tokio::test]
    async fn test_missing_context_fails_attempt() {
        let machine = Arc::new(HandshakeMachine::new(
            HandshakeState::ServerVerificationReceived,
        ));
        let raw = MemoryTransport::new();
        let handle = start(workflow_with(&machine), &raw);

        assert_eq!(
            handle.await.unwrap().err(),
            Some(HandshakeError::MissingContext {
                field: "server encryption"
            })
        );
    }

    #[tokio::test]
    async fn test_send_failure_aborts() {
        let raw = MemoryTransport::new();
        raw.refuse_sends();
        let handle = start(workflow(), &raw);

        raw.set_state(ConnectionState::Connected);
        assert_eq!(handle.await.unwrap().err(), Some(HandshakeError::Aborted));
    }
}
