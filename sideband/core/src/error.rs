//! Error Types
//!
//! Every fallible sideband operation returns [`SidebandError`]. Setup failures
//! (address resolution, connect, vendor session creation) surface here as
//! explicit values instead of half-initialized transports.
//!
//! Misuse of the API (closing an unregistered channel, finishing a direct
//! access that was never begun) is not represented here: those are contract
//! violations and panic.

use thiserror::Error;

use crate::config::ConfigError;
use crate::strategy::Strategy;
use crate::transport::rdma::{Direction, RdmaError};
use crate::usage_id::UsageId;

/// Convenience alias used throughout the crate
pub type Result<T, E = SidebandError> = std::result::Result<T, E>;

/// Errors that can occur while creating or using a sideband channel
#[derive(Debug, Error)]
pub enum SidebandError {
    /// IO error from the underlying OS resource
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not connect to a published sideband address
    #[error("Failed to connect to {address}: {source}")]
    ConnectFailed {
        /// Address that was attempted
        address: String,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// A published address was not of the form `host:port`
    #[error("Invalid sideband address: {0}")]
    InvalidAddress(String),

    /// Frame (or raw copy) does not fit the negotiated buffer
    #[error("Frame too large: {len} bytes (max: {max})")]
    FrameTooLarge {
        /// Requested length in bytes
        len: usize,
        /// Capacity available for it
        max: usize,
    },

    /// Peer closed the connection before the transfer completed
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Buffer size unusable for the strategy
    #[error("Invalid buffer size {size}: {reason}")]
    InvalidBufferSize {
        /// Requested size
        size: usize,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Usage id is malformed for the handshake
    #[error("Invalid usage id {0:?}")]
    InvalidUsageId(String),

    /// Registry already holds a live channel under this id
    #[error("Usage id {0} is already registered")]
    DuplicateUsageId(UsageId),

    /// The strategy does not carry a sideband transport
    #[error("Strategy {0} has no sideband transport")]
    UnsupportedStrategy(Strategy),

    /// Direct (zero-copy) access requested on a stream transport
    #[error("Direct read/write is not supported by this transport")]
    DirectAccessUnsupported,

    /// Creating or attaching a shared-memory segment failed
    #[error("Shared memory segment {name}: {source}")]
    SharedMemory {
        /// OS object name of the segment
        name: String,
        /// The underlying OS error
        source: std::io::Error,
    },

    /// Error reported by the RDMA provider
    #[error("RDMA error: {0}")]
    Rdma(#[from] RdmaError),

    /// RDMA strategy requested but no provider is installed in the context
    #[error("No RDMA provider installed")]
    RdmaUnavailable,

    /// The RDMA channel was established without this direction
    #[error("RDMA {0} session is not connected")]
    DirectionUnavailable(Direction),

    /// No RDMA-capable interface was found
    #[error("No RDMA interface available")]
    NoInterface,

    /// The channel was closed and its transport released
    #[error("Channel {0} is closed")]
    Closed(UsageId),

    /// Bounded registry lookup gave up
    #[error("Timed out waiting for channel {0}")]
    ResolveTimeout(UsageId),

    /// Message encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener could not bind its address
    #[error("Failed to bind listener on {address}: {source}")]
    BindFailed {
        /// Address that was attempted
        address: String,
        /// The underlying IO error
        source: std::io::Error,
    },
}

impl SidebandError {
    /// Build a `FrameTooLarge` error
    #[must_use]
    pub fn frame_too_large(len: usize, max: usize) -> Self {
        Self::FrameTooLarge { len, max }
    }

    /// Build a shared-memory error from the current `errno`
    pub(crate) fn shared_memory_os(name: &str) -> Self {
        Self::SharedMemory {
            name: name.to_string(),
            source: std::io::Error::last_os_error(),
        }
    }

    /// Whether the error means the peer is gone
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Closed(_) => true,
            Self::Rdma(e) => matches!(e, RdmaError::Disconnected),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
