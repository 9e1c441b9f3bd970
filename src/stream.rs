//! Push streams shared between the transport, the machines and the caller
//!
//! A [`Publisher`] fans each published value out to every live
//! [`Subscription`] through its own unbounded channel, so a slow subscriber
//! never blocks the publisher and every subscriber sees values in publish
//! order. A replaying publisher also hands each new subscriber the most
//! recent value before anything else.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

struct Shared<T> {
    replay: bool,
    latest: Option<T>,
    next_id: u64,
    subscribers: Vec<(u64, UnboundedSender<T>)>,
}

fn lock<T>(shared: &Mutex<Shared<T>>) -> MutexGuard<'_, Shared<T>> {
    // A panic while holding the lock leaves the list itself consistent
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fan-out source for a stream of values
pub struct Publisher<T: Clone> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T: Clone> Publisher<T> {
    /// Plain broadcast: subscribers only see values published after they subscribe
    pub fn new() -> Self {
        Self::with_mode(false, None)
    }

    /// Replay-latest broadcast: new subscribers first receive the latest value
    /// (or `initial` if nothing has been published yet)
    pub fn replaying(initial: Option<T>) -> Self {
        Self::with_mode(true, initial)
    }

    fn with_mode(replay: bool, latest: Option<T>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                replay,
                latest,
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Publish a value to every live subscriber
    pub fn publish(&self, value: T) {
        let mut shared = lock(&self.shared);
        shared
            .subscribers
            .retain(|(_, tx)| tx.send(value.clone()).is_ok());
        if shared.replay {
            shared.latest = Some(value);
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = lock(&self.shared);
        if shared.replay {
            if let Some(latest) = shared.latest.clone() {
                // Receiver is alive, cannot fail
                let _ = tx.send(latest);
            }
        }
        let id = shared.next_id;
        shared.next_id += 1;
        shared.subscribers.push((id, tx));

        Subscription {
            id,
            rx,
            source: Arc::downgrade(&self.shared),
        }
    }

    /// Number of subscribers that have not been cancelled
    pub fn subscriber_count(&self) -> usize {
        let mut shared = lock(&self.shared);
        shared.subscribers.retain(|(_, tx)| !tx.is_closed());
        shared.subscribers.len()
    }
}

impl<T: Clone> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Receiving end of a [`Publisher`]
///
/// Dropping the subscription cancels it.
pub struct Subscription<T> {
    id: u64,
    rx: UnboundedReceiver<T>,
    source: Weak<Mutex<Shared<T>>>,
}

impl<T> Subscription<T> {
    /// Wait for the next value. Returns `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next value if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Cancel this subscription
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(shared) = self.source.upgrade() {
            let mut shared = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            shared.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
