//! Transport Factory
//!
//! [`SidebandContext`] is the root object of the crate. It owns the
//! connection registry, one rendezvous queue per connection-oriented
//! strategy family, the connection-id generator and the optional RDMA
//! provider, and turns a [`Strategy`] plus a buffer size into a channel.
//!
//! # Owner / Client Flow
//!
//! ```text
//!   owner                        RPC layer                     client
//!   ─────                        ─────────                     ──────
//!   init_owner(strategy, size)
//!     shm:     create segment, register
//!     socket:  next id, queue request
//!     rdma:    next id, queue request
//!   ──── strategy, id, address, size ───────────────────────►
//!                                                  init_client(params)
//!                                                    shm:    attach
//!                                                    socket: connect, send id
//!                                                    rdma:   connect both directions
//!   listener thread accepts, completes the request, registers
//!   owner_handle(id)  (blocks until registered)
//! ```
//!
//! A context registers both owner and client channels, so a process that
//! plays both roles for the same id needs two contexts.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{ChannelRole, SidebandChannel, SidebandHandle};
use crate::config::{self, SidebandConfig};
use crate::error::{Result, SidebandError};
use crate::registry::ConnectionRegistry;
use crate::rendezvous::RendezvousQueue;
use crate::strategy::{Strategy, StrategyFamily};
use crate::transport::rdma::{
    discover_interface, Direction, RdmaDirections, RdmaListenerLoop, RdmaProvider, RdmaRequest,
    RdmaSettings,
};
use crate::transport::shared_memory::segment_name;
use crate::transport::socket::{SocketListener, SocketRequest};
use crate::transport::{
    DoubleBufferedTransport, RdmaTransport, SharedMemoryTransport, SocketTransport, Transport,
};
use crate::usage_id::{ConnectionIdGenerator, UsageId};

/// Host published for sockets when nothing better is known
const LOCALHOST: &str = "localhost";

// =============================================================================
// Parameters
// =============================================================================

/// Owner-side channel request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerOptions {
    /// Transport strategy
    pub strategy: Strategy,
    /// Negotiated buffer size in bytes
    pub buffer_size: usize,
    /// RDMA only: the sessions the owner waits for
    pub rdma_directions: RdmaDirections,
}

impl OwnerOptions {
    /// Bidirectional channel of `strategy`
    #[must_use]
    pub fn new(strategy: Strategy, buffer_size: usize) -> Self {
        Self {
            strategy,
            buffer_size,
            rdma_directions: RdmaDirections::BOTH,
        }
    }

    /// Restrict which RDMA directions the owner waits for
    #[must_use]
    pub fn with_rdma_directions(mut self, directions: RdmaDirections) -> Self {
        self.rdma_directions = directions;
        self
    }
}

/// What an owner publishes to its peer through the control plane
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerChannel {
    /// Transport strategy
    pub strategy: Strategy,
    /// Id the client must present
    pub usage_id: UsageId,
    /// `host:port` the client connects to
    pub connection_address: String,
    /// Negotiated buffer size in bytes
    pub buffer_size: usize,
    /// RDMA only: the sessions the client must open
    pub rdma_directions: RdmaDirections,
}

/// Client-side connection parameters, as received from the owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientParams {
    /// Published `host:port` (unused by shared-memory strategies)
    pub address: String,
    /// Transport strategy
    pub strategy: Strategy,
    /// Id published by the owner
    pub usage_id: UsageId,
    /// Negotiated buffer size in bytes
    pub buffer_size: usize,
    /// RDMA only: the sessions the owner waits for
    pub rdma_directions: RdmaDirections,
}

impl ClientParams {
    /// Collect the four published values; RDMA opens both directions
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        strategy: Strategy,
        usage_id: UsageId,
        buffer_size: usize,
    ) -> Self {
        Self {
            address: address.into(),
            strategy,
            usage_id,
            buffer_size,
            rdma_directions: RdmaDirections::BOTH,
        }
    }

    /// Open only the RDMA sessions the owner waits for
    #[must_use]
    pub fn with_rdma_directions(mut self, directions: RdmaDirections) -> Self {
        self.rdma_directions = directions;
        self
    }
}

impl From<&OwnerChannel> for ClientParams {
    fn from(owner: &OwnerChannel) -> Self {
        Self::new(
            owner.connection_address.clone(),
            owner.strategy,
            owner.usage_id.clone(),
            owner.buffer_size,
        )
        .with_rdma_directions(owner.rdma_directions)
    }
}

// =============================================================================
// Context
// =============================================================================

struct ContextInner {
    config: SidebandConfig,
    registry: ConnectionRegistry,
    socket_rendezvous: RendezvousQueue<SocketRequest>,
    rdma_rendezvous: RendezvousQueue<RdmaRequest>,
    ids: ConnectionIdGenerator,
    rdma: Option<Arc<dyn RdmaProvider>>,
    socket_address: Mutex<Option<SocketAddr>>,
    // held across id allocation and registration of shared-memory channels
    shared_memory_allocation: Mutex<()>,
}

/// Registry, rendezvous queues and configuration of one sideband endpoint
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SidebandContext {
    inner: Arc<ContextInner>,
}

impl SidebandContext {
    /// Context without RDMA support
    #[must_use]
    pub fn new(config: SidebandConfig) -> Self {
        Self::build(config, None)
    }

    /// Context using `provider` for RDMA strategies
    #[must_use]
    pub fn with_rdma_provider(config: SidebandConfig, provider: Arc<dyn RdmaProvider>) -> Self {
        Self::build(config, Some(provider))
    }

    /// Context from the default configuration file and environment
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read, parsed or validated.
    pub fn load() -> Result<Self> {
        let config = config::load_config()?;
        tracing::info!(source = %config.source(), "Sideband configuration loaded");
        Ok(Self::new(config))
    }

    fn build(config: SidebandConfig, rdma: Option<Arc<dyn RdmaProvider>>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                registry: ConnectionRegistry::new(),
                socket_rendezvous: RendezvousQueue::new("sockets"),
                rdma_rendezvous: RendezvousQueue::new("rdma"),
                ids: ConnectionIdGenerator::new(),
                rdma,
                socket_address: Mutex::new(None),
                shared_memory_allocation: Mutex::new(()),
            }),
        }
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &SidebandConfig {
        &self.inner.config
    }

    /// Channels registered in this context
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Installed RDMA provider, if any
    #[must_use]
    pub fn rdma_provider(&self) -> Option<&Arc<dyn RdmaProvider>> {
        self.inner.rdma.as_ref()
    }

    /// RDMA session settings derived from the configuration
    #[must_use]
    pub fn rdma_settings(&self) -> RdmaSettings {
        RdmaSettings::from_config(&self.inner.config)
    }

    fn require_rdma(&self) -> Result<&Arc<dyn RdmaProvider>> {
        self.rdma_provider().ok_or(SidebandError::RdmaUnavailable)
    }

    // =========================================================================
    // Owner side
    // =========================================================================

    /// Create an owner channel of `strategy` with default options
    ///
    /// # Errors
    ///
    /// See [`SidebandContext::init_owner_with`].
    pub fn init_owner(&self, strategy: Strategy, buffer_size: usize) -> Result<OwnerChannel> {
        self.init_owner_with(OwnerOptions::new(strategy, buffer_size))
    }

    /// Create an owner channel
    ///
    /// Shared-memory segments are created and registered immediately.
    /// Socket and RDMA channels get a fresh connection id and a queued
    /// request; this call blocks while another request of the same family
    /// is still waiting for its peer. Their handle appears in the registry
    /// once the listener has accepted the client (see
    /// [`SidebandContext::owner_handle`]).
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedStrategy` for `Unknown` and `Grpc`,
    /// `RdmaUnavailable` for RDMA without a provider, or the error creating
    /// the shared-memory segment.
    pub fn init_owner_with(&self, options: OwnerOptions) -> Result<OwnerChannel> {
        let strategy = options.strategy;
        let usage_id = match strategy.family() {
            None => return Err(SidebandError::UnsupportedStrategy(strategy)),
            Some(StrategyFamily::SharedMemory) => {
                self.create_shared_memory(strategy, options.buffer_size)?
            }
            Some(StrategyFamily::Sockets) => self.queue_new_connection(&options)?,
            Some(StrategyFamily::Rdma) => {
                self.require_rdma()?;
                self.queue_new_connection(&options)?
            }
        };

        let connection_address = self.connection_address(strategy)?;
        tracing::info!(
            usage_id = %usage_id,
            strategy = %strategy,
            address = %connection_address,
            buffer_size = options.buffer_size,
            "Sideband owner channel initialized"
        );
        Ok(OwnerChannel {
            strategy,
            usage_id,
            connection_address,
            buffer_size: options.buffer_size,
            rdma_directions: options.rdma_directions,
        })
    }

    /// Queue the connection intent for `usage_id`
    ///
    /// Blocks while another request of the same family is outstanding.
    /// Shared-memory strategies need no rendezvous and return immediately.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedStrategy` for `Unknown` and `Grpc`.
    pub fn queue_connection(&self, options: &OwnerOptions, usage_id: UsageId) -> Result<()> {
        match options.strategy.family() {
            None => Err(SidebandError::UnsupportedStrategy(options.strategy)),
            Some(StrategyFamily::SharedMemory) => Ok(()),
            Some(StrategyFamily::Sockets) => {
                self.inner.socket_rendezvous.queue(SocketRequest::new(
                    options.strategy,
                    usage_id,
                    options.buffer_size,
                ));
                Ok(())
            }
            Some(StrategyFamily::Rdma) => {
                self.inner.rdma_rendezvous.queue(
                    RdmaRequest::new(options.strategy, usage_id, options.buffer_size)
                        .with_directions(options.rdma_directions),
                );
                Ok(())
            }
        }
    }

    fn queue_new_connection(&self, options: &OwnerOptions) -> Result<UsageId> {
        let usage_id = self.inner.ids.next_id();
        self.queue_connection(options, usage_id.clone())?;
        Ok(usage_id)
    }

    /// Wait until the channel for `usage_id` is registered
    #[must_use]
    pub fn owner_handle(&self, usage_id: &UsageId) -> SidebandHandle {
        self.inner.registry.resolve_blocking(usage_id)
    }

    /// Wait at most `timeout` for the channel for `usage_id`
    ///
    /// # Errors
    ///
    /// Returns `ResolveTimeout` if it was not registered in time.
    pub fn owner_handle_timeout(
        &self,
        usage_id: &UsageId,
        timeout: Duration,
    ) -> Result<SidebandHandle> {
        self.inner.registry.resolve_timeout(usage_id, timeout)
    }

    fn create_shared_memory(&self, strategy: Strategy, buffer_size: usize) -> Result<UsageId> {
        let _allocation = self.inner.shared_memory_allocation.lock();
        let usage_id = self.allocate_shared_memory_id();
        let prefix = &self.inner.config.shared_memory_prefix;

        let transport: Transport = if strategy == Strategy::DoubleBufferedSharedMemory {
            DoubleBufferedTransport::create(usage_id.clone(), prefix, buffer_size)?.into()
        } else {
            let name = segment_name(prefix, &usage_id);
            SharedMemoryTransport::create(usage_id.clone(), &name, buffer_size)?.into()
        };

        self.inner.registry.register(SidebandHandle::new(SidebandChannel::new(
            strategy,
            ChannelRole::Owner,
            transport,
        )?))?;
        Ok(usage_id)
    }

    fn allocate_shared_memory_id(&self) -> UsageId {
        let base = &self.inner.config.shared_memory_base_id;
        if !self.inner.registry.contains(base) {
            return UsageId::new(base.clone());
        }
        let mut n = 1u64;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.inner.registry.contains(&candidate) {
                return UsageId::new(candidate);
            }
            n += 1;
        }
    }

    // =========================================================================
    // Client side
    // =========================================================================

    /// Attach or connect to an owner's channel and register it
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedStrategy` for `Unknown` and `Grpc`,
    /// `RdmaUnavailable` for RDMA without a provider, the attach or connect
    /// error of the transport, or `DuplicateUsageId` if this context already
    /// holds the id.
    pub fn init_client(&self, params: &ClientParams) -> Result<SidebandHandle> {
        let strategy = params.strategy;
        let usage_id = params.usage_id.clone();
        let prefix = &self.inner.config.shared_memory_prefix;

        let transport: Transport = match strategy {
            Strategy::SharedMemory => {
                let name = segment_name(prefix, &usage_id);
                SharedMemoryTransport::attach(usage_id, &name, params.buffer_size)?.into()
            }
            Strategy::DoubleBufferedSharedMemory => {
                DoubleBufferedTransport::attach(usage_id, prefix, params.buffer_size)?.into()
            }
            Strategy::Sockets | Strategy::SocketsLowLatency => SocketTransport::connect(
                &params.address,
                usage_id,
                params.buffer_size,
                strategy.is_low_latency(),
            )?
            .into(),
            Strategy::Rdma | Strategy::RdmaLowLatency => {
                RdmaTransport::connect(
                    self.require_rdma()?.as_ref(),
                    &params.address,
                    usage_id,
                    params.buffer_size,
                    strategy.is_low_latency(),
                    params.rdma_directions,
                    self.rdma_settings(),
                )?
                .into()
            }
            Strategy::Unknown | Strategy::Grpc => {
                return Err(SidebandError::UnsupportedStrategy(strategy))
            }
        };

        let handle =
            SidebandHandle::new(SidebandChannel::new(strategy, ChannelRole::Client, transport)?);
        self.inner.registry.register(handle.clone())?;
        tracing::info!(
            usage_id = %handle.usage_id(),
            strategy = %strategy,
            address = %params.address,
            "Sideband client channel initialized"
        );
        Ok(handle)
    }

    /// Unregister the channel and release its transport
    ///
    /// # Panics
    ///
    /// Panics if the channel is not registered in this context (double
    /// close).
    pub fn close(&self, handle: &SidebandHandle) {
        self.inner.registry.close(handle.usage_id());
    }

    // =========================================================================
    // Addresses and listeners
    // =========================================================================

    /// `host:port` a client of `strategy` should connect to
    ///
    /// RDMA publishes the send-direction port on the RDMA interface.
    /// Everything else publishes the socket port (the bound one if a
    /// listener is running) on the advertised host, else the RDMA
    /// interface, else `localhost`.
    ///
    /// # Errors
    ///
    /// For RDMA strategies, returns `RdmaUnavailable` or the interface
    /// discovery error.
    pub fn connection_address(&self, strategy: Strategy) -> Result<String> {
        let config = &self.inner.config;
        if strategy.family() == Some(StrategyFamily::Rdma) {
            let host = match &config.advertise_address {
                Some(host) => host.clone(),
                None => discover_interface(self.require_rdma()?.as_ref())?,
            };
            return Ok(format!("{host}:{}", config.rdma_send_port));
        }

        let host = config
            .advertise_address
            .clone()
            .or_else(|| {
                self.rdma_provider()
                    .and_then(|provider| discover_interface(provider.as_ref()).ok())
            })
            .unwrap_or_else(|| LOCALHOST.to_string());
        let bound = *self.inner.socket_address.lock();
        let port = bound.map_or(config.socket_port, |address| address.port());
        Ok(format!("{host}:{port}"))
    }

    /// Bind the socket listener without starting its accept loop
    ///
    /// The bound port is used by [`SidebandContext::connection_address`]
    /// from now on.
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if the configured address cannot be bound.
    pub fn bind_socket_listener(&self) -> Result<SocketListener> {
        let config = &self.inner.config;
        let listener = SocketListener::bind(&config.socket_listen_address, config.socket_port)?;
        *self.inner.socket_address.lock() = Some(listener.local_addr()?);
        Ok(listener)
    }

    /// Accept one socket connection and complete the queued request
    ///
    /// # Errors
    ///
    /// See [`SocketListener::accept_one`].
    pub fn accept_socket_connection(&self, listener: &SocketListener) -> Result<SidebandHandle> {
        listener.accept_one(&self.inner.socket_rendezvous, &self.inner.registry)
    }

    /// Bind the socket listener and run its accept loop on a thread
    ///
    /// The thread keeps the context alive for the rest of the process.
    ///
    /// # Errors
    ///
    /// Returns `BindFailed`, or the IO error if the thread cannot start.
    pub fn spawn_socket_listener(&self) -> Result<SocketAddr> {
        let listener = self.bind_socket_listener()?;
        let address = listener.local_addr()?;
        let context = self.clone();
        thread::Builder::new()
            .name("sideband-sockets".to_string())
            .spawn(move || {
                listener.run(&context.inner.socket_rendezvous, &context.inner.registry);
            })?;
        Ok(address)
    }

    /// Bind the send- and receive-direction RDMA listeners on the RDMA
    /// interface without starting their loops
    ///
    /// # Errors
    ///
    /// Returns `RdmaUnavailable`, the interface discovery error, or the
    /// provider's listen error.
    pub fn bind_rdma_listeners(&self) -> Result<(RdmaListenerLoop, RdmaListenerLoop)> {
        let provider = self.require_rdma()?;
        let address = discover_interface(provider.as_ref())?;
        let config = &self.inner.config;
        let send = RdmaListenerLoop::bind(
            provider.as_ref(),
            &address,
            config.rdma_send_port,
            Direction::Send,
        )?;
        let receive = RdmaListenerLoop::bind(
            provider.as_ref(),
            &address,
            config.rdma_receive_port,
            Direction::Receive,
        )?;
        Ok((send, receive))
    }

    /// Accept one RDMA session on `listener` and attach it to the queued
    /// request
    ///
    /// # Errors
    ///
    /// See [`RdmaListenerLoop::accept_one`].
    pub fn accept_rdma_session(
        &self,
        listener: &mut RdmaListenerLoop,
    ) -> Result<Option<SidebandHandle>> {
        listener.accept_one(
            &self.inner.rdma_rendezvous,
            &self.inner.registry,
            self.rdma_settings(),
        )
    }

    /// Bind both RDMA listeners and run each accept loop on its own thread
    ///
    /// # Errors
    ///
    /// See [`SidebandContext::bind_rdma_listeners`]; also the IO error if a
    /// thread cannot start.
    pub fn spawn_rdma_listeners(&self) -> Result<()> {
        let (send, receive) = self.bind_rdma_listeners()?;
        for listener in [send, receive] {
            let context = self.clone();
            let settings = self.rdma_settings();
            thread::Builder::new()
                .name(format!("sideband-rdma-{}", listener.direction()))
                .spawn(move || {
                    listener.run(
                        &context.inner.rdma_rendezvous,
                        &context.inner.registry,
                        settings,
                    );
                })?;
        }
        Ok(())
    }
}

impl fmt::Debug for SidebandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidebandContext")
            .field("config", &self.inner.config)
            .field("channels", &self.inner.registry.len())
            .field("rdma", &self.inner.rdma.is_some())
            .field("socket_address", &*self.inner.socket_address.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::transport::rdma::LoopbackFabric;

    fn shm_config() -> SidebandConfig {
        let prefix = format!("SBT{}_", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        SidebandConfig::default().with_shared_memory_prefix(prefix)
    }

    #[test]
    fn test_shared_memory_ids_are_allocated_from_base() {
        let context = SidebandContext::new(shm_config());

        let first = context.init_owner(Strategy::SharedMemory, 256).unwrap();
        let second = context.init_owner(Strategy::SharedMemory, 256).unwrap();
        assert_eq!(first.usage_id.as_str(), "TestBuffer");
        assert_eq!(second.usage_id.as_str(), "TestBuffer-1");

        // registered right away
        let handle = context.owner_handle(&first.usage_id);
        assert_eq!(handle.role(), ChannelRole::Owner);

        context.close(&handle);
        let third = context.init_owner(Strategy::SharedMemory, 256).unwrap();
        assert_eq!(third.usage_id.as_str(), "TestBuffer");
    }

    #[test]
    fn test_shared_memory_owner_and_client() {
        let config = shm_config();
        let owner_context = SidebandContext::new(config.clone());
        let client_context = SidebandContext::new(config);

        let owner = owner_context
            .init_owner(Strategy::DoubleBufferedSharedMemory, 128)
            .unwrap();
        let writer = owner_context.owner_handle(&owner.usage_id);
        let reader = client_context
            .init_client(&ClientParams::from(&owner))
            .unwrap();
        assert_eq!(reader.role(), ChannelRole::Client);

        writer.write_frame(b"first").unwrap();
        assert_eq!(reader.read_frame().unwrap(), b"first");
        writer.write_frame(b"second").unwrap();
        assert_eq!(reader.read_frame().unwrap(), b"second");
    }

    #[test]
    fn test_unsupported_strategies() {
        let context = SidebandContext::new(SidebandConfig::default());
        assert!(matches!(
            context.init_owner(Strategy::Grpc, 64),
            Err(SidebandError::UnsupportedStrategy(Strategy::Grpc))
        ));
        let params = ClientParams::new("localhost:1", Strategy::Unknown, "x".into(), 64);
        assert!(matches!(
            context.init_client(&params),
            Err(SidebandError::UnsupportedStrategy(Strategy::Unknown))
        ));
    }

    #[test]
    fn test_rdma_requires_provider() {
        let context = SidebandContext::new(SidebandConfig::default());
        assert!(matches!(
            context.init_owner(Strategy::Rdma, 64),
            Err(SidebandError::RdmaUnavailable)
        ));
        assert!(matches!(
            context.connection_address(Strategy::RdmaLowLatency),
            Err(SidebandError::RdmaUnavailable)
        ));
    }

    #[test]
    fn test_connection_addresses() {
        let plain = SidebandContext::new(SidebandConfig::default());
        assert_eq!(
            plain.connection_address(Strategy::Sockets).unwrap(),
            "localhost:50055"
        );

        let fabric = LoopbackFabric::with_interfaces(vec!["10.1.2.3".into()]);
        let rdma = SidebandContext::with_rdma_provider(SidebandConfig::default(), Arc::new(fabric));
        assert_eq!(
            rdma.connection_address(Strategy::Rdma).unwrap(),
            "10.1.2.3:50060"
        );
        assert_eq!(
            rdma.connection_address(Strategy::SocketsLowLatency).unwrap(),
            "10.1.2.3:50055"
        );

        let advertised = SidebandContext::new(
            SidebandConfig::default()
                .with_advertise_address("sideband.local")
                .with_socket_listener("127.0.0.1", 0),
        );
        let listener = advertised.bind_socket_listener().unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(
            advertised.connection_address(Strategy::Sockets).unwrap(),
            format!("sideband.local:{port}")
        );
    }

    #[test]
    fn test_socket_owner_waits_for_listener() {
        let owner_context = SidebandContext::new(
            SidebandConfig::default()
                .with_socket_listener("127.0.0.1", 0)
                .with_advertise_address("127.0.0.1"),
        );
        let client_context = SidebandContext::new(SidebandConfig::default());
        let listener = owner_context.bind_socket_listener().unwrap();

        let owner = owner_context.init_owner(Strategy::Sockets, 512).unwrap();
        assert_eq!(owner.usage_id.as_str(), "ID:         1");
        assert!(owner_context
            .owner_handle_timeout(&owner.usage_id, Duration::from_millis(10))
            .is_err());

        let params = ClientParams::from(&owner);
        let client = thread::spawn(move || client_context.init_client(&params));
        let accepted = owner_context.accept_socket_connection(&listener).unwrap();
        let client = client.join().unwrap().unwrap();

        let handle = owner_context.owner_handle(&owner.usage_id);
        assert!(handle.ptr_eq(&accepted));

        client.write_frame(b"hello owner").unwrap();
        assert_eq!(handle.read_frame().unwrap(), b"hello owner");
    }

    #[test]
    fn test_rdma_owner_and_client_through_listeners() {
        let fabric = Arc::new(LoopbackFabric::new());
        let config = SidebandConfig::default().with_rdma_base_port(9300);
        let owner_context = SidebandContext::with_rdma_provider(config.clone(), fabric.clone());
        let client_context = SidebandContext::with_rdma_provider(config, fabric);
        let (mut send, mut receive) = owner_context.bind_rdma_listeners().unwrap();

        let owner = owner_context.init_owner(Strategy::Rdma, 256).unwrap();
        assert_eq!(owner.connection_address, "127.0.0.1:9300");

        let client = client_context
            .init_client(&ClientParams::from(&owner))
            .unwrap();
        assert!(owner_context.accept_rdma_session(&mut send).unwrap().is_none());
        let accepted = owner_context
            .accept_rdma_session(&mut receive)
            .unwrap()
            .unwrap();
        assert_eq!(accepted.usage_id(), &owner.usage_id);

        client.write_frame(b"up").unwrap();
        assert_eq!(accepted.read_frame().unwrap(), b"up");
        accepted.write_frame(b"down").unwrap();
        assert_eq!(client.read_frame().unwrap(), b"down");
    }

    #[test]
    fn test_one_way_rdma_owners_do_not_share_sessions() {
        let fabric = Arc::new(LoopbackFabric::new());
        let config = SidebandConfig::default().with_rdma_base_port(9320);
        let owner_context = SidebandContext::with_rdma_provider(config.clone(), fabric.clone());
        let client_context = SidebandContext::with_rdma_provider(config, fabric);
        let (mut send, mut receive) = owner_context.bind_rdma_listeners().unwrap();

        let send_only = owner_context
            .init_owner_with(
                OwnerOptions::new(Strategy::Rdma, 64)
                    .with_rdma_directions(RdmaDirections::new(false, true)),
            )
            .unwrap();
        assert_eq!(send_only.rdma_directions, RdmaDirections::new(false, true));
        let first_client = client_context
            .init_client(&ClientParams::from(&send_only))
            .unwrap();
        let first = owner_context
            .accept_rdma_session(&mut send)
            .unwrap()
            .unwrap();
        assert!(!first.is_split());

        let both = owner_context.init_owner(Strategy::Rdma, 64).unwrap();
        let second_client = client_context
            .init_client(&ClientParams::from(&both))
            .unwrap();
        assert!(owner_context
            .accept_rdma_session(&mut receive)
            .unwrap()
            .is_none());
        let second = owner_context
            .accept_rdma_session(&mut send)
            .unwrap()
            .unwrap();
        assert_eq!(second.usage_id(), &both.usage_id);
        assert!(second.is_split());

        first.write_frame(b"to the first client").unwrap();
        assert_eq!(first_client.read_frame().unwrap(), b"to the first client");
        assert!(matches!(
            first_client.write_frame(b"nowhere"),
            Err(SidebandError::DirectionUnavailable(Direction::Send))
        ));

        second_client.write_frame(b"from the second client").unwrap();
        assert_eq!(second.read_frame().unwrap(), b"from the second client");
    }

    #[test]
    #[should_panic(expected = "close of unregistered sideband channel")]
    fn test_double_close_panics() {
        let context = SidebandContext::new(shm_config());
        let owner = context.init_owner(Strategy::SharedMemory, 64).unwrap();
        let handle = context.owner_handle(&owner.usage_id);
        context.close(&handle);
        context.close(&handle);
    }
}
