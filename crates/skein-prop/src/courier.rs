//! Couriers: named, blocking event queues.
//!
//! A courier is owned by exactly one consumer. Subscriptions push events into
//! it from whichever thread mutates the tree; the consumer drains them in
//! emission order.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::event::PropEvent;

pub struct Courier {
    name: String,
    tx: Sender<PropEvent>,
    rx: Receiver<PropEvent>,
}

impl Courier {
    /// Create an empty courier.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            name: name.into(),
            tx,
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the next event is available.
    ///
    /// The courier keeps its own sender alive, so this never observes a
    /// disconnected channel; it returns `None` only if that invariant is broken.
    pub fn wait(&self) -> Option<PropEvent> {
        self.rx.recv().ok()
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<PropEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take the next event without blocking.
    pub fn try_next(&self) -> Option<PropEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of queued events.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn sender(&self) -> Sender<PropEvent> {
        self.tx.clone()
    }
}

impl fmt::Debug for Courier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Courier")
            .field("name", &self.name)
            .field("pending", &self.rx.len())
            .finish()
    }
}
