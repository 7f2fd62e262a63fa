//! Rendezvous Queue
//!
//! Pairs one queued connection intent with the next physical connection a
//! listener accepts. The queue holds a single slot:
//!
//! - [`RendezvousQueue::queue`] waits until the slot is empty, then
//!   publishes its request.
//! - The listener calls [`RendezvousQueue::fulfill`] for every accepted
//!   connection. The closure sees the published request and either completes
//!   it (the slot is cleared and the next `queue` call may proceed) or leaves
//!   it pending, e.g. while an RDMA channel still waits for its second
//!   direction.
//!
//! Connection setup is therefore serialized per strategy family: only one
//! request can be outstanding at a time. Channels that are already
//! established are unaffected.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// Outcome of one [`RendezvousQueue::fulfill`] step
#[derive(Debug)]
pub enum Fulfillment<R> {
    /// The request is satisfied; the slot is released
    Complete(R),
    /// The request needs more connections; the slot stays occupied
    Pending,
}

/// Single-slot handshake coordinator
#[derive(Debug)]
pub struct RendezvousQueue<P> {
    name: &'static str,
    slot: Mutex<Option<P>>,
    changed: Condvar,
}

impl<P> RendezvousQueue<P> {
    /// Create an empty queue; `name` labels log events
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
            changed: Condvar::new(),
        }
    }

    /// Publish `request`, blocking while another request is outstanding
    pub fn queue(&self, request: P) {
        let mut slot = self.slot.lock();
        while slot.is_some() {
            self.changed.wait(&mut slot);
        }
        *slot = Some(request);
        self.changed.notify_all();
        tracing::debug!(queue = self.name, "Connection request queued");
    }

    /// Publish `request` only if the slot is free
    ///
    /// # Errors
    ///
    /// Gives `request` back when another request is outstanding.
    pub fn try_queue(&self, request: P) -> std::result::Result<(), P> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(request);
        }
        *slot = Some(request);
        self.changed.notify_all();
        Ok(())
    }

    /// Publish `request`, waiting at most `timeout` for the slot
    ///
    /// # Errors
    ///
    /// Gives `request` back if the slot did not free up in time.
    pub fn queue_timeout(&self, request: P, timeout: Duration) -> std::result::Result<(), P> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.is_some() {
            if self.changed.wait_until(&mut slot, deadline).timed_out() && slot.is_some() {
                return Err(request);
            }
        }
        *slot = Some(request);
        self.changed.notify_all();
        Ok(())
    }

    /// Whether a request is waiting for its connection
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait for a published request and let `step` act on it
    ///
    /// `step` runs with the slot locked. `Complete` clears the slot and
    /// wakes blocked `queue` callers; `Pending` or an error leave the request
    /// in place for the next accepted connection.
    ///
    /// # Errors
    ///
    /// Returns whatever `step` returns.
    pub fn fulfill<R>(
        &self,
        step: impl FnOnce(&mut P) -> Result<Fulfillment<R>>,
    ) -> Result<Fulfillment<R>> {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            self.changed.wait(&mut slot);
        }
        let Some(request) = slot.as_mut() else {
            return Ok(Fulfillment::Pending);
        };

        let outcome = step(request)?;
        if let Fulfillment::Complete(_) = outcome {
            *slot = None;
            self.changed.notify_all();
            tracing::debug!(queue = self.name, "Connection request fulfilled");
        }
        Ok(outcome)
    }
}
