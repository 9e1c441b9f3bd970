//! Generic finite state machine engine
//!
//! A machine kind is declared by implementing [`StateMap`]: a state enum, a
//! transition enum, and a total function from `(state, transition)` to the
//! optional target state. [`Machine`] owns the current state plus a context
//! value and only ever moves along declared edges. Rejected transitions are
//! logged and dropped, never raised, because racing inputs (two error sources,
//! late crypto completions) routinely request edges that are no longer valid.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard};

use crate::stream::{Publisher, Subscription};

/// Declared transition topology for one machine kind
pub trait StateMap: Send + Sync + 'static {
    type State: Copy + Eq + Debug + Send + Sync + 'static;
    type Transition: Copy + Eq + Debug + Send + Sync + 'static;

    /// Target state for `transition` taken from `state`, or `None` if the
    /// edge is not declared
    fn target(state: Self::State, transition: Self::Transition) -> Option<Self::State>;

    /// Transitions accepted from `state` (diagnostics only)
    fn accepted(state: Self::State) -> &'static [Self::Transition];
}

/// A state together with the context that was current when it was entered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<S, C> {
    pub state: S,
    pub context: C,
}

struct Current<S, C> {
    state: S,
    context: C,
}

/// Running instance of a [`StateMap`]
pub struct Machine<M: StateMap, C: Clone> {
    current: Mutex<Current<M::State, C>>,
    snapshots: Publisher<Snapshot<M::State, C>>,
    _map: PhantomData<M>,
}

impl<M: StateMap, C: Clone + Default> Machine<M, C> {
    /// Create a machine in `initial` with an empty context
    pub fn new(initial: M::State) -> Self {
        Self::with_context(initial, C::default())
    }
}

impl<M: StateMap, C: Clone> Machine<M, C> {
    /// Create a machine in `initial` with the given context
    pub fn with_context(initial: M::State, context: C) -> Self {
        let snapshots = Publisher::replaying(Some(Snapshot {
            state: initial,
            context: context.clone(),
        }));
        Self {
            current: Mutex::new(Current {
                state: initial,
                context,
            }),
            snapshots,
            _map: PhantomData,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Current<M::State, C>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Request a transition that leaves the context unchanged
    ///
    /// Returns whether the transition was accepted.
    pub fn pure_transition(&self, transition: M::Transition) -> bool {
        self.transition(transition, C::clone)
    }

    /// Request a transition whose new context is `update(current context)`
    ///
    /// `update` only runs if the transition is accepted. The new state and
    /// context are published together as one snapshot. `update` runs while
    /// the machine is locked and must not call back into this machine.
    pub fn transition<F>(&self, transition: M::Transition, update: F) -> bool
    where
        F: FnOnce(&C) -> C,
    {
        let mut current = self.lock();
        let Some(next) = M::target(current.state, transition) else {
            tracing::debug!(
                "Transition {:?} does not exist on state {:?} (accepted: {:?})",
                transition,
                current.state,
                M::accepted(current.state)
            );
            return false;
        };

        tracing::trace!("{:?} --{:?}--> {:?}", current.state, transition, next);
        current.context = update(&current.context);
        current.state = next;

        // Published under the lock so observers see snapshots in acceptance order
        self.snapshots.publish(Snapshot {
            state: next,
            context: current.context.clone(),
        });
        true
    }

    /// Observe the machine
    ///
    /// The current snapshot is delivered immediately, followed by one
    /// snapshot per accepted transition.
    pub fn subscribe(&self) -> Subscription<Snapshot<M::State, C>> {
        // Lock so no transition can slip between the replay and registration
        let _current = self.lock();
        self.snapshots.subscribe()
    }

    /// Current state
    pub fn state(&self) -> M::State {
        self.lock().state
    }

    /// Copy of the current context
    pub fn context(&self) -> C {
        self.lock().context.clone()
    }
}
