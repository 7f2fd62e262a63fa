//! Usage Identifiers
//!
//! A [`UsageId`] names one logical sideband channel on both sides of the
//! control plane. Connection-oriented strategies draw ids from a
//! [`ConnectionIdGenerator`]; the ids are fixed-width because the socket
//! handshake reads exactly [`CONNECT_ID_LENGTH`] bytes before any payload.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Prefix of generated connection ids
pub const CONNECT_ID_PREFIX: &str = "ID:";

/// Width of the numeric field in generated connection ids
pub const CONNECT_ID_DIGITS: usize = 10;

/// Byte length of every generated connection id
pub const CONNECT_ID_LENGTH: usize = CONNECT_ID_PREFIX.len() + CONNECT_ID_DIGITS;

/// Identifier of one logical sideband channel
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsageId(String);

impl UsageId {
    /// Wrap an id received from the control plane
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as `&str`
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id has the fixed width required by the socket handshake
    #[must_use]
    pub fn is_connect_id(&self) -> bool {
        self.0.len() == CONNECT_ID_LENGTH
    }

    /// Id of one half of a double-buffered channel
    #[must_use]
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}{suffix}", self.0))
    }
}

impl fmt::Display for UsageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UsageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for UsageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UsageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UsageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Monotonic source of fixed-width connection ids (`"ID:"` + 10 columns)
#[derive(Debug)]
pub struct ConnectionIdGenerator {
    next: AtomicU32,
}

impl ConnectionIdGenerator {
    /// Create a generator whose first id is `ID:         1`
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Produce the next id
    pub fn next_id(&self) -> UsageId {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        UsageId(format!("{CONNECT_ID_PREFIX}{n:>width$}", width = CONNECT_ID_DIGITS))
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
