//! Sideband Core - Out-of-Band Bulk Data Transport
//!
//! Moves large payloads beside an RPC control plane. The RPC layer only
//! carries a strategy, a usage id, an address and a buffer size; the bytes
//! themselves travel over shared memory, a TCP stream or an RDMA session
//! pair, all behind one read/write/framing contract.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SidebandContext                           │
//! │  init_owner / init_client / owner_handle / close                 │
//! │                                                                  │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │ RendezvousQueue  │  │ RendezvousQueue  │  │ Connection     │  │
//! │  │  <SocketRequest> │  │  <RdmaRequest>   │  │ Registry       │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └───────▲────────┘  │
//! │           │ fulfill             │ fulfill            │ register  │
//! │  ┌────────┴─────────┐  ┌────────┴─────────┐          │           │
//! │  │  SocketListener  │  │ RdmaListenerLoop │──────────┘           │
//! │  └──────────────────┘  └──────────────────┘                      │
//! └──────────────────────────────────────────────────────────────────┘
//!                              │
//!                     SidebandHandle (Arc)
//!                              │
//! ┌────────────────────────────┴─────────────────────────────────────┐
//! │ Transport: SharedMemory │ DoubleBuffered │ Socket │ Rdma          │
//! │            (SidebandTransport + length-prefixed frames)          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`SidebandContext`]: owner and client construction, listeners
//! - [`SidebandHandle`]: registered channel; read, write and frame helpers,
//!   usable from one reader thread and one writer thread at once
//! - [`SidebandTransport`]: the contract every strategy implements
//! - [`Strategy`]: negotiated transport choice
//! - [`ConnectionRegistry`]: usage id to channel, with blocking lookup
//! - [`RendezvousQueue`]: single-slot pairing of intents with connections
//!
//! # Module Overview
//!
//! - [`channel`]: channel handles and roles
//! - [`config`]: ports, addresses and naming, from TOML and environment
//! - [`error`]: error type shared by every operation
//! - [`factory`]: the context object
//! - [`frame`]: 8-byte length-prefixed framing and message helpers
//! - [`registry`]: connection registry
//! - [`rendezvous`]: rendezvous queue
//! - [`strategy`]: strategy enumeration
//! - [`transport`]: the four strategy implementations
//! - [`usage_id`]: channel identifiers and the connection-id generator

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod error;
pub mod factory;
pub mod frame;
pub mod registry;
pub mod rendezvous;
pub mod strategy;
pub mod transport;
pub mod usage_id;

// Re-exports for convenience
pub use channel::{ChannelRole, SidebandChannel, SidebandHandle};
pub use error::{Result, SidebandError};
pub use factory::{ClientParams, OwnerChannel, OwnerOptions, SidebandContext};
pub use frame::LENGTH_PREFIX_SIZE;
pub use registry::ConnectionRegistry;
pub use rendezvous::{Fulfillment, RendezvousQueue};
pub use strategy::{Strategy, StrategyFamily};
pub use transport::{Lanes, SidebandTransport, Transport};
pub use usage_id::{ConnectionIdGenerator, UsageId, CONNECT_ID_LENGTH};

// Transport exports
pub use transport::rdma::{
    LoopbackFabric, RdmaDirections, RdmaError, RdmaProvider, RdmaSettings, RdmaTransport,
};
pub use transport::socket::{SocketInterrupt, SocketListener, SocketRequest};
pub use transport::{BufferSide, DoubleBufferedTransport, SharedMemoryTransport, SocketTransport};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    SidebandConfig,
};
