//! RDMA Transport
//!
//! A channel is a pair of single-direction sessions. The listener side binds
//! two ports: sessions that send from the owner arrive on `rdma_send_port`,
//! sessions the owner receives on arrive on `rdma_receive_port`. A client
//! connects its receive session to the published port and its send session
//! to the port after it.
//!
//! ```text
//!   client                                   owner listeners
//! ┌──────────────┐   receive ◄── send    ┌──────────────────────┐
//! │ Receive sess.├───────────────────────►│ :50060 accept(Send)  │
//! │ Send sess.   ├───────────────────────►│ :50061 accept(Receive)│
//! └──────────────┘   send ──► receive    └──────────────────────┘
//! ```
//!
//! The vendor SDK is reached through [`RdmaProvider`]; [`LoopbackFabric`]
//! is the in-process implementation.

mod listener;
pub mod loopback;
pub mod provider;
mod transport;

pub use listener::{RdmaListenerLoop, RdmaRequest};
pub use loopback::LoopbackFabric;
pub use provider::{BufferRegion, Direction, RdmaError, RdmaListener, RdmaProvider, RdmaSession};
pub use transport::RdmaTransport;

use std::time::Duration;

use crate::config::SidebandConfig;
use crate::error::{Result, SidebandError};

/// Sessions an RDMA owner waits for, named from the owner's side
///
/// The client connects the opposite direction of each: a send session for
/// the owner's reader, a receive session for its writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RdmaDirections {
    /// The owner receives on this channel
    pub reader: bool,
    /// The owner sends on this channel
    pub writer: bool,
}

impl RdmaDirections {
    /// Both sessions
    pub const BOTH: Self = Self {
        reader: true,
        writer: true,
    };

    /// Directions from the owner's wait flags
    #[must_use]
    pub fn new(reader: bool, writer: bool) -> Self {
        Self { reader, writer }
    }

    /// Whether the owner waits for a session it uses as `direction`
    #[must_use]
    pub fn wants(self, direction: Direction) -> bool {
        match direction {
            Direction::Receive => self.reader,
            Direction::Send => self.writer,
        }
    }
}

impl Default for RdmaDirections {
    fn default() -> Self {
        Self::BOTH
    }
}

/// Per-session settings taken from [`SidebandConfig`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RdmaSettings {
    /// Vendor timeout; `None` waits forever
    pub timeout: Option<Duration>,
    /// Regions in flight per session
    pub max_concurrent_transactions: usize,
}

impl RdmaSettings {
    /// Settings for `config`
    #[must_use]
    pub fn from_config(config: &SidebandConfig) -> Self {
        Self {
            timeout: config.rdma_timeout(),
            max_concurrent_transactions: config.rdma_max_concurrent_transactions,
        }
    }
}

impl Default for RdmaSettings {
    fn default() -> Self {
        Self::from_config(&SidebandConfig::default())
    }
}

/// Address of the RDMA interface to listen and connect on
///
/// With several interfaces the first one is used.
///
/// # Errors
///
/// Returns `NoInterface` if the provider reports none, or the provider's
/// enumeration error.
pub fn discover_interface(provider: &dyn RdmaProvider) -> Result<String> {
    let interfaces = provider.enumerate_interfaces()?;
    if interfaces.len() > 1 {
        tracing::warn!(
            count = interfaces.len(),
            using = %interfaces[0],
            "Multiple RDMA interfaces found, using the first"
        );
    }
    interfaces
        .into_iter()
        .next()
        .ok_or(SidebandError::NoInterface)
}
