//! RDMA Provider Interface
//!
//! The vendor SDK sits behind these traits. A provider hands out listener
//! and connector sessions; each connected session moves data in exactly one
//! [`Direction`] through a small pool of vendor-owned buffer regions.
//!
//! # Region Lifecycle
//!
//! ```text
//! send side:     acquire_send_region ──► fill ──► queue_region
//!                        ▲                              │
//!                        │ credit returned              ▼
//! receive side:  release_received_region ◄── read ◄── acquire_received_region
//! ```
//!
//! At most `count` regions (from `configure_buffers`) are in flight per
//! session; `acquire_send_region` waits for a credit when all are in use.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Data direction of one session, seen from that session's end
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The session queues regions for the peer
    Send,
    /// The session receives regions from the peer
    Receive,
}

impl Direction {
    /// Direction of the session at the other end
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Send => Self::Receive,
            Self::Receive => Self::Send,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Receive => f.write_str("receive"),
        }
    }
}

/// Status codes reported by an RDMA provider
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RdmaError {
    /// The operation did not complete within its timeout
    #[error("operation timed out")]
    Timeout,

    /// The session handle is not valid
    #[error("invalid session")]
    InvalidSession,

    /// The peer closed its session
    #[error("peer disconnected")]
    Disconnected,

    /// Buffers were used before `configure_buffers`
    #[error("session buffers are not configured")]
    NotConfigured,

    /// Another listener already holds the address
    #[error("address {address}:{port} is already in use")]
    AddressInUse {
        /// Interface address
        address: String,
        /// Port
        port: u16,
    },

    /// Nothing is listening at the address
    #[error("connection to {address}:{port} refused")]
    ConnectionRefused {
        /// Remote address
        address: String,
        /// Remote port
        port: u16,
    },

    /// The operation does not apply to a session of this direction
    #[error("operation not valid on a {0} session")]
    WrongDirection(Direction),

    /// Any other vendor status
    #[error("vendor error {code}: {message}")]
    Vendor {
        /// Vendor status code
        code: i32,
        /// Vendor error string
        message: String,
    },
}

/// One vendor buffer region and the number of bytes in use
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferRegion {
    buffer: Vec<u8>,
    used: usize,
}

impl BufferRegion {
    /// Zeroed region of `capacity` bytes, none of them used
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            used: 0,
        }
    }

    /// Total size of the region
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes carrying data
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Mark the first `used` bytes as data, clamped to the capacity
    pub fn set_used(&mut self, used: usize) {
        self.used = used.min(self.buffer.len());
    }

    /// The used bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.used]
    }

    /// The whole region
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// The whole region, writable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// A connected, single-direction session
pub trait RdmaSession: Send {
    /// Direction this session moves data
    fn direction(&self) -> Direction;

    /// Allocate `count` regions of `region_size` bytes
    ///
    /// # Errors
    ///
    /// Returns the vendor status if the regions cannot be allocated.
    fn configure_buffers(&mut self, region_size: usize, count: usize) -> Result<(), RdmaError>;

    /// Busy-poll for received regions instead of waiting on interrupts
    ///
    /// # Errors
    ///
    /// Returns `WrongDirection` on a send session.
    fn set_rx_polling(&mut self, enabled: bool) -> Result<(), RdmaError>;

    /// Take a free region to fill (send sessions)
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no region frees up in time, or `Disconnected`.
    fn acquire_send_region(&mut self, timeout: Option<Duration>) -> Result<BufferRegion, RdmaError>;

    /// Hand a filled region to the peer (send sessions)
    ///
    /// # Errors
    ///
    /// Returns `Disconnected` if the peer is gone.
    fn queue_region(&mut self, region: BufferRegion) -> Result<(), RdmaError>;

    /// Wait for the next region from the peer (receive sessions)
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if nothing arrives in time, or `Disconnected`.
    fn acquire_received_region(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<BufferRegion, RdmaError>;

    /// Give a received region back so the peer can reuse it
    ///
    /// # Errors
    ///
    /// Returns the vendor status.
    fn release_received_region(&mut self, region: BufferRegion) -> Result<(), RdmaError>;
}

/// A bound listener session
pub trait RdmaListener: Send {
    /// Wait for a peer and return the connected session for `direction`
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no peer connects in time.
    fn accept(
        &mut self,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn RdmaSession>, RdmaError>;
}

/// Entry point to an RDMA implementation
pub trait RdmaProvider: Send + Sync {
    /// Addresses of RDMA-capable interfaces
    ///
    /// # Errors
    ///
    /// Returns the vendor status if enumeration fails.
    fn enumerate_interfaces(&self) -> Result<Vec<String>, RdmaError>;

    /// Bind a listener on `address:port`
    ///
    /// # Errors
    ///
    /// Returns `AddressInUse` if the port is taken.
    fn listen(&self, address: &str, port: u16) -> Result<Box<dyn RdmaListener>, RdmaError>;

    /// Connect a `direction` session from `local_address` to `remote:port`
    ///
    /// # Errors
    ///
    /// Returns `ConnectionRefused` if nothing listens there.
    fn connect(
        &self,
        local_address: &str,
        direction: Direction,
        remote_address: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn RdmaSession>, RdmaError>;
}
