//! RDMA accept loops.
//!
//! The owner runs one loop per direction. Each accepted session is parked in
//! the queued [`RdmaRequest`] until every direction it asked for has arrived;
//! only then is the transport built and registered.

use std::fmt;

use crate::channel::{ChannelRole, SidebandChannel, SidebandHandle};
use crate::error::Result;
use crate::registry::ConnectionRegistry;
use crate::rendezvous::{Fulfillment, RendezvousQueue};
use crate::strategy::Strategy;
use crate::usage_id::UsageId;

use super::provider::{Direction, RdmaError, RdmaListener, RdmaProvider, RdmaSession};
use super::transport::RdmaTransport;
use super::{RdmaDirections, RdmaSettings};

/// Connection intent queued by an RDMA owner
pub struct RdmaRequest {
    /// `Rdma` or `RdmaLowLatency`
    pub strategy: Strategy,
    /// Id the owner published
    pub usage_id: UsageId,
    /// Negotiated buffer size
    pub buffer_size: usize,
    /// Sessions the owner waits for
    pub directions: RdmaDirections,
    pending_write: Option<Box<dyn RdmaSession>>,
    pending_read: Option<Box<dyn RdmaSession>>,
}

impl RdmaRequest {
    /// Request for a bidirectional channel
    #[must_use]
    pub fn new(strategy: Strategy, usage_id: UsageId, buffer_size: usize) -> Self {
        Self {
            strategy,
            usage_id,
            buffer_size,
            directions: RdmaDirections::BOTH,
            pending_write: None,
            pending_read: None,
        }
    }

    /// Restrict the directions the owner waits for
    #[must_use]
    pub fn with_directions(mut self, directions: RdmaDirections) -> Self {
        self.directions = directions;
        self
    }

    /// Whether every requested direction has a session
    #[must_use]
    pub fn is_ready(&self) -> bool {
        (self.pending_write.is_some() || !self.directions.writer)
            && (self.pending_read.is_some() || !self.directions.reader)
    }

    /// Park `session` until the request is ready
    ///
    /// A session for a direction the owner did not ask for is dropped, which
    /// disconnects it, rather than left for the next request.
    fn attach(&mut self, session: Box<dyn RdmaSession>) {
        if !self.directions.wants(session.direction()) {
            tracing::warn!(
                usage_id = %self.usage_id,
                direction = %session.direction(),
                "Dropping RDMA session for a direction the owner did not request"
            );
            return;
        }
        let slot = match session.direction() {
            Direction::Send => &mut self.pending_write,
            Direction::Receive => &mut self.pending_read,
        };
        if slot.is_some() {
            tracing::warn!(
                usage_id = %self.usage_id,
                direction = %session.direction(),
                "Replacing RDMA session that was already attached"
            );
        }
        *slot = Some(session);
    }
}

impl fmt::Debug for RdmaRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaRequest")
            .field("strategy", &self.strategy)
            .field("usage_id", &self.usage_id)
            .field("buffer_size", &self.buffer_size)
            .field("directions", &self.directions)
            .field("has_write_session", &self.pending_write.is_some())
            .field("has_read_session", &self.pending_read.is_some())
            .finish()
    }
}

/// One bound RDMA listener accepting sessions of a single direction
pub struct RdmaListenerLoop {
    listener: Box<dyn RdmaListener>,
    direction: Direction,
    port: u16,
}

impl RdmaListenerLoop {
    /// Listen on `address:port` for sessions the owner uses as `direction`
    ///
    /// # Errors
    ///
    /// Returns the provider's listen error, e.g. `AddressInUse`.
    pub fn bind(
        provider: &dyn RdmaProvider,
        address: &str,
        port: u16,
        direction: Direction,
    ) -> Result<Self> {
        let listener = provider.listen(address, port)?;
        tracing::info!(address, port, direction = %direction, "RDMA listener bound");
        Ok(Self {
            listener,
            direction,
            port,
        })
    }

    /// Direction of the sessions this loop hands to the owner
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Accept one session and attach it to the queued request
    ///
    /// Returns the registered handle once the request has every direction it
    /// asked for, `None` while it still waits for the other one.
    ///
    /// # Errors
    ///
    /// Returns the provider's accept error (`Timeout` when the configured
    /// timeout elapses), or the error building or registering the transport.
    /// A build failure consumes the request.
    pub fn accept_one(
        &mut self,
        rendezvous: &RendezvousQueue<RdmaRequest>,
        registry: &ConnectionRegistry,
        settings: RdmaSettings,
    ) -> Result<Option<SidebandHandle>> {
        let session = self.listener.accept(self.direction, settings.timeout)?;
        tracing::debug!(port = self.port, direction = %session.direction(), "RDMA session accepted");
        Self::complete(session, rendezvous, registry, settings)
    }

    fn complete(
        session: Box<dyn RdmaSession>,
        rendezvous: &RendezvousQueue<RdmaRequest>,
        registry: &ConnectionRegistry,
        settings: RdmaSettings,
    ) -> Result<Option<SidebandHandle>> {
        let outcome = rendezvous.fulfill(|request| {
            request.attach(session);
            if !request.is_ready() {
                return Ok(Fulfillment::Pending);
            }

            let built = RdmaTransport::new(
                request.usage_id.clone(),
                request.pending_write.take(),
                request.pending_read.take(),
                request.buffer_size,
                request.strategy.is_low_latency(),
                settings,
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

        match outcome {
            Fulfillment::Pending => Ok(None),
            Fulfillment::Complete(built) => {
                let handle = built?;
                tracing::info!(
                    usage_id = %handle.usage_id(),
                    strategy = %handle.strategy(),
                    "Sideband RDMA connection established"
                );
                Ok(Some(handle))
            }
        }
    }

    /// Accept sessions until the listener fails
    ///
    /// Accept timeouts are retried. Failed transport builds are logged and
    /// skipped.
    pub fn run(
        mut self,
        rendezvous: &RendezvousQueue<RdmaRequest>,
        registry: &ConnectionRegistry,
        settings: RdmaSettings,
    ) {
        loop {
            let session = match self.listener.accept(self.direction, settings.timeout) {
                Ok(session) => session,
                Err(RdmaError::Timeout) => continue,
                Err(e) => {
                    tracing::error!(port = self.port, error = %e, "RDMA listener stopped");
                    return;
                }
            };
            tracing::debug!(port = self.port, direction = %session.direction(), "RDMA session accepted");
            if let Err(e) = Self::complete(session, rendezvous, registry, settings) {
                tracing::warn!(port = self.port, error = %e, "RDMA connection rejected");
            }
        }
    }
}

impl fmt::Debug for RdmaListenerLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaListenerLoop")
            .field("direction", &self.direction)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::SidebandError;

    use crate::transport::rdma::LoopbackFabric;
    use crate::transport::SidebandTransport;
    use crate::usage_id::ConnectionIdGenerator;

    fn loops(fabric: &LoopbackFabric, base: u16) -> (RdmaListenerLoop, RdmaListenerLoop) {
        let send = RdmaListenerLoop::bind(fabric, "127.0.0.1", base, Direction::Send).unwrap();
        let receive =
            RdmaListenerLoop::bind(fabric, "127.0.0.1", base + 1, Direction::Receive).unwrap();
        (send, receive)
    }

    #[test]
    fn test_channel_completes_after_both_directions() {
        let fabric = LoopbackFabric::new();
        let (mut send_loop, mut receive_loop) = loops(&fabric, 9200);
        let rendezvous = RendezvousQueue::new("rdma");
        let registry = ConnectionRegistry::new();
        let settings = RdmaSettings::default();

        let id = ConnectionIdGenerator::new().next_id();
        rendezvous.queue(RdmaRequest::new(Strategy::Rdma, id.clone(), 128));

        let mut client = RdmaTransport::connect(
            &fabric,
            "127.0.0.1:9200",
            id.clone(),
            128,
            false,
            RdmaDirections::BOTH,
            settings,
        )
        .unwrap();

        assert!(send_loop
            .accept_one(&rendezvous, &registry, settings)
            .unwrap()
            .is_none());
        assert!(rendezvous.is_pending());
        assert!(registry.is_empty());

        let handle = receive_loop
            .accept_one(&rendezvous, &registry, settings)
            .unwrap()
            .unwrap();
        assert!(!rendezvous.is_pending());
        assert_eq!(handle.role(), ChannelRole::Owner);
        assert!(registry.get(&id).unwrap().ptr_eq(&handle));

        client.write_length_prefixed(b"from client").unwrap();
        assert_eq!(handle.read_frame().unwrap(), b"from client");
        handle.write_frame(b"from owner").unwrap();
        let len = client.read_length_prefix().unwrap();
        let mut buf = vec![0u8; len];
        client.read_from_length_prefixed(&mut buf).unwrap();
        assert_eq!(buf, b"from owner");
    }

    #[test]
    fn test_single_direction_request() {
        let fabric = LoopbackFabric::new();
        let (mut send_loop, _receive_loop) = loops(&fabric, 9210);
        let rendezvous = RendezvousQueue::new("rdma");
        let registry = ConnectionRegistry::new();
        let settings = RdmaSettings::default();

        let id = ConnectionIdGenerator::new().next_id();
        rendezvous.queue(
            RdmaRequest::new(Strategy::RdmaLowLatency, id.clone(), 64)
                .with_directions(RdmaDirections::new(false, true)),
        );
        let _peer = fabric
            .connect("127.0.0.1", Direction::Receive, "127.0.0.1", 9210, None)
            .unwrap();

        let handle = send_loop
            .accept_one(&rendezvous, &registry, settings)
            .unwrap()
            .unwrap();
        assert!(!handle.is_split());
        let transport = handle.write_half().unwrap();
        let crate::transport::Transport::Rdma(rdma) = &*transport else {
            panic!("expected an RDMA transport");
        };
        assert!(rdma.has_direction(Direction::Send));
        assert!(!rdma.has_direction(Direction::Receive));
        assert!(rdma.is_low_latency());
    }

    #[test]
    fn test_unrequested_direction_is_not_left_for_the_next_request() {
        let fabric = LoopbackFabric::new();
        let (mut send_loop, mut receive_loop) = loops(&fabric, 9240);
        let rendezvous = RendezvousQueue::new("rdma");
        let registry = ConnectionRegistry::new();
        let settings = RdmaSettings::default();
        let ids = ConnectionIdGenerator::new();

        // the first owner only sends, but its client opens both directions
        let first = ids.next_id();
        rendezvous.queue(
            RdmaRequest::new(Strategy::Rdma, first.clone(), 64)
                .with_directions(RdmaDirections::new(false, true)),
        );
        let mut stray_client = RdmaTransport::connect(
            &fabric,
            "127.0.0.1:9240",
            first.clone(),
            64,
            false,
            RdmaDirections::BOTH,
            settings,
        )
        .unwrap();

        // the stray send session reaches the receive loop first
        assert!(receive_loop
            .accept_one(&rendezvous, &registry, settings)
            .unwrap()
            .is_none());
        let first_handle = send_loop
            .accept_one(&rendezvous, &registry, settings)
            .unwrap()
            .unwrap();
        assert_eq!(first_handle.usage_id(), &first);

        let second = ids.next_id();
        rendezvous.queue(RdmaRequest::new(Strategy::Rdma, second.clone(), 64));
        let mut client = RdmaTransport::connect(
            &fabric,
            "127.0.0.1:9240",
            second.clone(),
            64,
            false,
            RdmaDirections::BOTH,
            settings,
        )
        .unwrap();
        assert!(send_loop
            .accept_one(&rendezvous, &registry, settings)
            .unwrap()
            .is_none());
        let second_handle = receive_loop
            .accept_one(&rendezvous, &registry, settings)
            .unwrap()
            .unwrap();

        assert!(stray_client.write(b"from the first client").is_err());
        client.write(b"from the second client").unwrap();
        let mut buf = [0u8; 64];
        let n = second_handle.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"from the second client");
    }

    #[test]
    fn test_accept_timeout_is_reported() {
        let fabric = LoopbackFabric::new();
        let (mut send_loop, _receive_loop) = loops(&fabric, 9220);
        let rendezvous = RendezvousQueue::new("rdma");
        let registry = ConnectionRegistry::new();
        let settings = RdmaSettings {
            timeout: Some(Duration::from_millis(20)),
            ..RdmaSettings::default()
        };

        assert!(matches!(
            send_loop.accept_one(&rendezvous, &registry, settings),
            Err(SidebandError::Rdma(RdmaError::Timeout))
        ));
    }

    #[test]
    fn test_port_in_use() {
        let fabric = LoopbackFabric::new();
        let _first = RdmaListenerLoop::bind(&fabric, "127.0.0.1", 9230, Direction::Send).unwrap();
        assert!(matches!(
            RdmaListenerLoop::bind(&fabric, "127.0.0.1", 9230, Direction::Send),
            Err(SidebandError::Rdma(RdmaError::AddressInUse { .. }))
        ));
    }

    #[test]
    fn test_request_debug_hides_sessions() {
        let request = RdmaRequest::new(Strategy::Rdma, "ID:         7".into(), 32);
        let rendered = format!("{request:?}");
        assert!(rendered.contains("has_write_session: false"));
        assert!(!request.is_ready());
        assert!(request
            .with_directions(RdmaDirections::new(false, false))
            .is_ready());
    }
}
