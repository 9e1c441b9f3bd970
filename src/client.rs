//! Connection lifecycle
//!
//! Top-level retry loop that coordinates:
//! - Raw transport creation
//! - The handshake over that transport
//! - Relaying application traffic over the resulting encrypted channel
//!
//! Any failure below this level becomes an `Error` transition, which drops
//! the transport and channel and starts over from `Initial` after the
//! reconnect delay. Retries are unbounded.
//!
//! ```text
//! Initial -Begin-> NewSocket -Success-> Handshake -Success-> Connected
//!    ^                |                     |                    |
//!    +------Error-----+---------Error-------+--------Error-------+
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::machine::{Machine, Snapshot, StateMap};
use crate::protocol::{variant_of, EncryptedChannel, HandshakeWorkflow};
use crate::stream::{Publisher, Subscription};
use crate::transport::{ConnectionState, Transport, TransportFactory};

/// Delay between a failure and the next connection attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Initial,
    NewSocket,
    Handshake,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleTransition {
    Begin,
    Success,
    Error,
}

/// Lifecycle topology
pub struct LifecycleMap;

impl StateMap for LifecycleMap {
    type State = LifecycleState;
    type Transition = LifecycleTransition;

    fn target(state: LifecycleState, transition: LifecycleTransition) -> Option<LifecycleState> {
        use LifecycleState as S;
        use LifecycleTransition as T;

        match (state, transition) {
            (S::Initial, T::Begin) => Some(S::NewSocket),
            (S::NewSocket, T::Success) => Some(S::Handshake),
            (S::Handshake, T::Success) => Some(S::Connected),
            (S::NewSocket | S::Handshake | S::Connected, T::Error) => Some(S::Initial),
            _ => None,
        }
    }

    fn accepted(state: LifecycleState) -> &'static [LifecycleTransition] {
        use LifecycleState as S;
        use LifecycleTransition as T;

        match state {
            S::Initial => &[T::Begin],
            S::NewSocket | S::Handshake => &[T::Success, T::Error],
            S::Connected => &[T::Error],
        }
    }
}

/// What the current connection attempt holds
#[derive(Clone, Default)]
pub struct LifecycleContext {
    /// Raw transport, set once created
    pub socket: Option<Arc<dyn Transport>>,
    /// Encrypted channel, set once the handshake succeeds
    pub channel: Option<Arc<EncryptedChannel>>,
}

impl fmt::Debug for LifecycleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleContext")
            .field("socket", &self.socket.is_some())
            .field("channel", &self.channel.is_some())
            .finish()
    }
}

pub type LifecycleMachine = Machine<LifecycleMap, LifecycleContext>;

/// Builds and owns one connection for the life of the process
pub struct ConnectionLifecycle {
    factory: Arc<dyn TransportFactory>,
    workflow: HandshakeWorkflow,
    reconnect_delay: Duration,
}

impl ConnectionLifecycle {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        workflow: HandshakeWorkflow,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            factory,
            workflow,
            reconnect_delay,
        }
    }

    /// Start connecting in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> ConnectionHandle {
        let machine = Arc::new(LifecycleMachine::new(LifecycleState::Initial));
        let incoming = Publisher::new();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            machine: Arc::clone(&machine),
            factory: self.factory,
            workflow: self.workflow,
            reconnect_delay: self.reconnect_delay,
            incoming: incoming.clone(),
            outgoing: outgoing_rx,
        };
        let task = tokio::spawn(driver.run());

        ConnectionHandle {
            machine,
            incoming,
            outgoing,
            task,
        }
    }
}

/// Caller's view of a running connection
pub struct ConnectionHandle {
    machine: Arc<LifecycleMachine>,
    incoming: Publisher<Value>,
    outgoing: mpsc::UnboundedSender<Value>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Decrypted application messages, from now on
    pub fn incoming(&self) -> Subscription<Value> {
        self.incoming.subscribe()
    }

    /// Queue an application payload
    ///
    /// Payloads are held until the server has offered its actions on the
    /// current connection, then relayed in dispatch order.
    pub fn dispatch(&self, payload: Value) -> Result<(), TransportError> {
        self.outgoing
            .send(payload)
            .map_err(|_| TransportError::Closed)
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.machine.state()
    }

    /// Lifecycle snapshots, starting with the current one
    pub fn states(&self) -> Subscription<Snapshot<LifecycleState, LifecycleContext>> {
        self.machine.subscribe()
    }

    /// Stop the lifecycle and drop the connection
    pub fn shutdown(self) {
        tracing::info!("Shutting down connection");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Background task reacting to every entered lifecycle state
struct Driver {
    machine: Arc<LifecycleMachine>,
    factory: Arc<dyn TransportFactory>,
    workflow: HandshakeWorkflow,
    reconnect_delay: Duration,
    incoming: Publisher<Value>,
    outgoing: mpsc::UnboundedReceiver<Value>,
}

impl Driver {
    async fn run(mut self) {
        let mut snapshots = self.machine.subscribe();

        while let Some(Snapshot { state, context }) = snapshots.recv().await {
            tracing::info!("Connection -> {:?}", state);

            match state {
                LifecycleState::Initial => {
                    self.machine.pure_transition(LifecycleTransition::Begin);
                }

                LifecycleState::NewSocket => match self.factory.create().await {
                    Ok(socket) => {
                        self.machine.transition(LifecycleTransition::Success, |c| {
                            LifecycleContext {
                                socket: Some(socket),
                                ..c.clone()
                            }
                        });
                    }
                    Err(e) => self.restart(&format!("Could not create transport: {}", e)).await,
                },

                LifecycleState::Handshake => {
                    let Some(socket) = context.socket else {
                        self.restart("Handshake entered without a transport").await;
                        continue;
                    };
                    match self.workflow.run(socket).await {
                        Ok(channel) => {
                            tracing::info!("Handshake complete");
                            let channel = Arc::new(channel);
                            self.machine.transition(LifecycleTransition::Success, |c| {
                                LifecycleContext {
                                    channel: Some(channel),
                                    ..c.clone()
                                }
                            });
                        }
                        Err(e) => self.restart(&format!("Handshake failed: {}", e)).await,
                    }
                }

                LifecycleState::Connected => {
                    let Some(channel) = context.channel else {
                        self.restart("Connected without an encrypted channel").await;
                        continue;
                    };
                    self.serve(&channel).await;
                    self.restart("Connection lost").await;
                }
            }
        }
    }

    /// Relay traffic until the channel disconnects
    async fn serve(&mut self, channel: &EncryptedChannel) {
        // First subscriber, so the seeded AvailableActions is never missed
        let mut incoming = channel.incoming();
        let mut connection = channel.connection_state();
        let mut relaying = false;

        loop {
            tokio::select! {
                biased;

                Some(state) = connection.recv() => {
                    if state == ConnectionState::Disconnected {
                        break;
                    }
                }

                Some(message) = incoming.recv() => match variant_of(&message) {
                    Some("AvailableActions") => {
                        tracing::debug!("Server offered actions: {}", message);
                        if let Err(e) = channel.send(json!({"Varient": "connect"})) {
                            tracing::warn!("Could not acknowledge actions: {}", e);
                        }
                        relaying = true;
                    }
                    Some("Message") => self.incoming.publish(message),
                    _ => tracing::debug!("Ignoring message: {}", message),
                },

                Some(payload) = self.outgoing.recv(), if relaying => {
                    tracing::debug!("Relaying {}", payload);
                    if let Err(e) = channel.send(payload) {
                        tracing::warn!("Dropping outgoing message: {}", e);
                    }
                }

                else => break,
            }
        }
        // Listeners are released here, before the reconnect delay
    }

    /// Wait out the reconnect delay, then reset to `Initial`
    async fn restart(&self, reason: &str) {
        tracing::warn!("{}, reconnecting in {:?}", reason, self.reconnect_delay);
        tokio::time::sleep(self.reconnect_delay).await;
        self.machine
            .transition(LifecycleTransition::Error, |_| LifecycleContext::default());
    }
}
