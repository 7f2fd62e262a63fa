//! Connection Registry
//!
//! Map from usage id to live channel, with a blocking lookup.
//!
//! The owner of a connection-oriented channel only knows the usage id it
//! generated; the transport is built later by a listener thread when the
//! peer connects. [`ConnectionRegistry::resolve_blocking`] parks the owner
//! until that registration shows up. Every registration wakes every waiter,
//! and each waiter re-checks its own id.
//!
//! # Invariants
//!
//! - At most one live entry per usage id; a second `register` is an error.
//! - `close` of an id that is not registered is a contract violation and
//!   panics.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::SidebandHandle;
use crate::error::{Result, SidebandError};
use crate::usage_id::UsageId;

/// Usage id → channel table shared by one [`SidebandContext`](crate::SidebandContext)
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    channels: Mutex<HashMap<UsageId, SidebandHandle>>,
    registered: Condvar,
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle` under its usage id and wake blocked lookups
    ///
    /// # Errors
    ///
    /// Returns `DuplicateUsageId` if a live channel already uses the id;
    /// the registry is left unchanged.
    pub fn register(&self, handle: SidebandHandle) -> Result<()> {
        let usage_id = handle.usage_id().clone();
        {
            let mut channels = self.channels.lock();
            if channels.contains_key(&usage_id) {
                return Err(SidebandError::DuplicateUsageId(usage_id));
            }
            channels.insert(usage_id.clone(), handle);
        }
        self.registered.notify_all();

        tracing::debug!(usage_id = %usage_id, "Registered sideband channel");
        Ok(())
    }

    /// Wait until `usage_id` is registered and return its handle
    pub fn resolve_blocking(&self, usage_id: &UsageId) -> SidebandHandle {
        let mut channels = self.channels.lock();
        loop {
            if let Some(handle) = channels.get(usage_id) {
                return handle.clone();
            }
            self.registered.wait(&mut channels);
        }
    }

    /// Like [`resolve_blocking`](Self::resolve_blocking), giving up after
    /// `timeout`
    ///
    /// # Errors
    ///
    /// Returns `ResolveTimeout` if the id was not registered in time.
    pub fn resolve_timeout(&self, usage_id: &UsageId, timeout: Duration) -> Result<SidebandHandle> {
        let deadline = Instant::now() + timeout;
        let mut channels = self.channels.lock();
        loop {
            if let Some(handle) = channels.get(usage_id) {
                return Ok(handle.clone());
            }
            if self.registered.wait_until(&mut channels, deadline).timed_out() {
                return channels
                    .get(usage_id)
                    .cloned()
                    .ok_or_else(|| SidebandError::ResolveTimeout(usage_id.clone()));
            }
        }
    }

    /// Handle for `usage_id` if it is registered right now
    #[must_use]
    pub fn get(&self, usage_id: &UsageId) -> Option<SidebandHandle> {
        self.channels.lock().get(usage_id).cloned()
    }

    /// Whether `usage_id` is registered
    #[must_use]
    pub fn contains(&self, usage_id: &str) -> bool {
        self.channels.lock().contains_key(usage_id)
    }

    /// Number of live channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// Whether no channel is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Remove `usage_id` and release its transport
    ///
    /// # Panics
    ///
    /// Panics if `usage_id` is not registered (double close).
    pub fn close(&self, usage_id: &UsageId) {
        let removed = self.channels.lock().remove(usage_id);
        let Some(handle) = removed else {
            panic!("close of unregistered sideband channel {usage_id}");
        };
        handle.shutdown();
        tracing::info!(usage_id = %usage_id, strategy = %handle.strategy(), "Closed sideband channel");
    }
}
