//! Socket accept loop.

use std::net::{SocketAddr, TcpListener, TcpStream};

use crate::channel::{ChannelRole, SidebandChannel, SidebandHandle};
use crate::error::{Result, SidebandError};
use crate::registry::ConnectionRegistry;
use crate::rendezvous::{Fulfillment, RendezvousQueue};
use crate::strategy::Strategy;
use crate::usage_id::UsageId;

use super::stream::{read_connect_id, SocketTransport};

/// Connection intent queued by a socket owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketRequest {
    /// `Sockets` or `SocketsLowLatency`
    pub strategy: Strategy,
    /// Id the owner published
    pub usage_id: UsageId,
    /// Negotiated buffer size
    pub buffer_size: usize,
}

impl SocketRequest {
    /// Describe the next socket connection
    #[must_use]
    pub fn new(strategy: Strategy, usage_id: UsageId, buffer_size: usize) -> Self {
        Self {
            strategy,
            usage_id,
            buffer_size,
        }
    }
}

/// Bound TCP listener for sideband sockets
#[derive(Debug)]
pub struct SocketListener {
    listener: TcpListener,
}

impl SocketListener {
    /// Bind `address:port` (port 0 picks a free port)
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if the address cannot be bound.
    pub fn bind(address: &str, port: u16) -> Result<Self> {
        let listener =
            TcpListener::bind((address, port)).map_err(|e| SidebandError::BindFailed {
                address: format!("{address}:{port}"),
                source: e,
            })?;
        tracing::info!(address, port, "Sideband socket listener bound");
        Ok(Self { listener })
    }

    /// Address actually bound
    ///
    /// # Errors
    ///
    /// Returns the IO error from the OS.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and complete the queued request with it
    ///
    /// The peer's usage id is read before the rendezvous is touched, so a
    /// connection that never finishes its handshake leaves the queued
    /// request for the next one. Once the id is in, the request is consumed
    /// whether or not the transport could be registered.
    ///
    /// # Errors
    ///
    /// Returns the accept or handshake error, or the error building or
    /// registering the transport.
    pub fn accept_one(
        &self,
        rendezvous: &RendezvousQueue<SocketRequest>,
        registry: &ConnectionRegistry,
    ) -> Result<SidebandHandle> {
        let (stream, peer) = self.listener.accept()?;
        Self::complete(stream, peer, rendezvous, registry)
    }

    fn complete(
        mut stream: TcpStream,
        peer: SocketAddr,
        rendezvous: &RendezvousQueue<SocketRequest>,
        registry: &ConnectionRegistry,
    ) -> Result<SidebandHandle> {
        let usage_id = read_connect_id(&mut stream)?;
        tracing::debug!(peer = %peer, usage_id = %usage_id, "Sideband socket handshake received");

        let outcome = rendezvous.fulfill(|request| {
            if request.usage_id != usage_id {
                tracing::warn!(
                    queued = %request.usage_id,
                    received = %usage_id,
                    "Socket connection id differs from the queued request"
                );
            }
            let built = SocketTransport::from_accepted(
                stream,
                usage_id,
                request.buffer_size,
                request.strategy.is_low_latency(),
            )
            .and_then(|transport| {
                let handle = SidebandHandle::new(SidebandChannel::new(
                    request.strategy,
                    ChannelRole::Owner,
                    transport.into(),
                )?);
                registry.register(handle.clone())?;
                Ok(handle)
            });
            Ok(Fulfillment::Complete(built))
        })?;

        let Fulfillment::Complete(built) = outcome else {
            return Err(SidebandError::ConnectionClosed);
        };
        let handle = built?;
        tracing::info!(
            usage_id = %handle.usage_id(),
            strategy = %handle.strategy(),
            peer = %peer,
            "Sideband socket connection established"
        );
        Ok(handle)
    }

    /// Accept connections until the listener itself fails
    ///
    /// Failed handshakes and registrations are logged and skipped.
    pub fn run(self, rendezvous: &RendezvousQueue<SocketRequest>, registry: &ConnectionRegistry) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = Self::complete(stream, peer, rendezvous, registry) {
                        tracing::warn!(peer = %peer, error = %e, "Sideband socket connection rejected");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!(error = %e, "Sideband socket listener stopped");
                    return;
                }
            }
        }
    }
}
