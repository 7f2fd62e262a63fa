//! In-Process RDMA Fabric
//!
//! [`LoopbackFabric`] implements [`RdmaProvider`] without hardware: listeners
//! live in a shared table keyed by `(address, port)`, and every connected
//! session pair shares one pipe of queued regions. It behaves like the
//! vendor SDK where the transport can observe it:
//!
//! - a send session holds `count` credits from `configure_buffers` and
//!   `acquire_send_region` waits for one;
//! - releasing a received region returns its credit to the sender;
//! - dropping either end disconnects the pipe; regions already queued can
//!   still be received;
//! - with rx polling enabled the receiver spins instead of parking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::provider::{BufferRegion, Direction, RdmaError, RdmaListener, RdmaProvider, RdmaSession};

/// Wait on `condvar` until `deadline`; `None` waits without bound
///
/// Returns `true` if the deadline passed.
fn wait_until<T>(condvar: &Condvar, guard: &mut MutexGuard<'_, T>, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => condvar.wait_until(guard, deadline).timed_out(),
        None => {
            condvar.wait(guard);
            false
        }
    }
}

fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

// =============================================================================
// Pipe shared by one session pair
// =============================================================================

#[derive(Debug, Default)]
struct PipeState {
    queued: VecDeque<BufferRegion>,
    credits: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    changed: Condvar,
}

impl Pipe {
    fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_all();
    }
}

// =============================================================================
// Sessions
// =============================================================================

#[derive(Debug)]
struct LoopbackSession {
    direction: Direction,
    pipe: Arc<Pipe>,
    region_size: Option<usize>,
    rx_polling: bool,
}

impl LoopbackSession {
    fn new(direction: Direction, pipe: Arc<Pipe>) -> Self {
        Self {
            direction,
            pipe,
            region_size: None,
            rx_polling: false,
        }
    }

    fn require(&self, direction: Direction) -> Result<usize, RdmaError> {
        if self.direction != direction {
            return Err(RdmaError::WrongDirection(self.direction));
        }
        self.region_size.ok_or(RdmaError::NotConfigured)
    }

    fn poll_received(&self, deadline: Option<Instant>) -> Result<BufferRegion, RdmaError> {
        loop {
            {
                let mut state = self.pipe.state.lock();
                if let Some(region) = state.queued.pop_front() {
                    return Ok(region);
                }
                if state.closed {
                    return Err(RdmaError::Disconnected);
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(RdmaError::Timeout);
            }
            std::thread::yield_now();
        }
    }

    fn wait_received(&self, deadline: Option<Instant>) -> Result<BufferRegion, RdmaError> {
        let mut state = self.pipe.state.lock();
        loop {
            if let Some(region) = state.queued.pop_front() {
                return Ok(region);
            }
            if state.closed {
                return Err(RdmaError::Disconnected);
            }
            if wait_until(&self.pipe.changed, &mut state, deadline) && state.queued.is_empty() {
                return Err(RdmaError::Timeout);
            }
        }
    }
}

impl RdmaSession for LoopbackSession {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn configure_buffers(&mut self, region_size: usize, count: usize) -> Result<(), RdmaError> {
        if count == 0 {
            return Err(RdmaError::Vendor {
                code: -1,
                message: "at least one buffer region is required".to_string(),
            });
        }
        if self.direction == Direction::Send {
            self.pipe.state.lock().credits = count;
            self.pipe.changed.notify_all();
        }
        self.region_size = Some(region_size);
        Ok(())
    }

    fn set_rx_polling(&mut self, enabled: bool) -> Result<(), RdmaError> {
        if self.direction != Direction::Receive {
            return Err(RdmaError::WrongDirection(self.direction));
        }
        self.rx_polling = enabled;
        Ok(())
    }

    fn acquire_send_region(&mut self, timeout: Option<Duration>) -> Result<BufferRegion, RdmaError> {
        let region_size = self.require(Direction::Send)?;
        let deadline = deadline_after(timeout);

        let mut state = self.pipe.state.lock();
        loop {
            if state.closed {
                return Err(RdmaError::Disconnected);
            }
            if state.credits > 0 {
                state.credits -= 1;
                return Ok(BufferRegion::with_capacity(region_size));
            }
            if wait_until(&self.pipe.changed, &mut state, deadline) && state.credits == 0 {
                return Err(RdmaError::Timeout);
            }
        }
    }

    fn queue_region(&mut self, region: BufferRegion) -> Result<(), RdmaError> {
        self.require(Direction::Send)?;
        {
            let mut state = self.pipe.state.lock();
            if state.closed {
                return Err(RdmaError::Disconnected);
            }
            state.queued.push_back(region);
        }
        self.pipe.changed.notify_all();
        Ok(())
    }

    fn acquire_received_region(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<BufferRegion, RdmaError> {
        self.require(Direction::Receive)?;
        let deadline = deadline_after(timeout);
        if self.rx_polling {
            self.poll_received(deadline)
        } else {
            self.wait_received(deadline)
        }
    }

    fn release_received_region(&mut self, region: BufferRegion) -> Result<(), RdmaError> {
        self.require(Direction::Receive)?;
        drop(region);
        self.pipe.state.lock().credits += 1;
        self.pipe.changed.notify_all();
        Ok(())
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

// =============================================================================
// Listeners
// =============================================================================

#[derive(Debug)]
struct PendingConnect {
    direction: Direction,
    pipe: Arc<Pipe>,
}

#[derive(Debug, Default)]
struct Backlog {
    pending: Mutex<VecDeque<PendingConnect>>,
    arrived: Condvar,
}

type ListenerKey = (String, u16);

#[derive(Debug)]
struct LoopbackListener {
    key: ListenerKey,
    backlog: Arc<Backlog>,
    listeners: Arc<DashMap<ListenerKey, Arc<Backlog>>>,
}

impl RdmaListener for LoopbackListener {
    fn accept(
        &mut self,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn RdmaSession>, RdmaError> {
        let deadline = deadline_after(timeout);
        let mut pending = self.backlog.pending.lock();
        loop {
            // only a connector of the opposite direction pairs with us
            let position = pending
                .iter()
                .position(|p| p.direction == direction.opposite());
            if let Some(connect) = position.and_then(|i| pending.remove(i)) {
                return Ok(Box::new(LoopbackSession::new(direction, connect.pipe)));
            }
            if wait_until(&self.backlog.arrived, &mut pending, deadline) {
                return Err(RdmaError::Timeout);
            }
        }
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.listeners.remove(&self.key);
        for connect in self.backlog.pending.lock().drain(..) {
            connect.pipe.close();
        }
    }
}

// =============================================================================
// Fabric
// =============================================================================

/// In-process [`RdmaProvider`]
///
/// Clones share the same listener table, so a listener bound through one
/// clone accepts connections made through another.
#[derive(Clone, Debug)]
pub struct LoopbackFabric {
    interfaces: Vec<String>,
    listeners: Arc<DashMap<ListenerKey, Arc<Backlog>>>,
}

impl LoopbackFabric {
    /// Fabric with a single `127.0.0.1` interface
    #[must_use]
    pub fn new() -> Self {
        Self::with_interfaces(vec!["127.0.0.1".to_string()])
    }

    /// Fabric reporting the given interfaces
    #[must_use]
    pub fn with_interfaces(interfaces: Vec<String>) -> Self {
        Self {
            interfaces,
            listeners: Arc::new(DashMap::new()),
        }
    }

    /// Whether something listens on `address:port`
    #[must_use]
    pub fn is_listening(&self, address: &str, port: u16) -> bool {
        self.listeners.contains_key(&(address.to_string(), port))
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl RdmaProvider for LoopbackFabric {
    fn enumerate_interfaces(&self) -> Result<Vec<String>, RdmaError> {
        Ok(self.interfaces.clone())
    }

    fn listen(&self, address: &str, port: u16) -> Result<Box<dyn RdmaListener>, RdmaError> {
        let key = (address.to_string(), port);
        let backlog = Arc::new(Backlog::default());
        match self.listeners.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RdmaError::AddressInUse {
                    address: address.to_string(),
                    port,
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&backlog));
            }
        }
        Ok(Box::new(LoopbackListener {
            key,
            backlog,
            listeners: Arc::clone(&self.listeners),
        }))
    }

    fn connect(
        &self,
        _local_address: &str,
        direction: Direction,
        remote_address: &str,
        port: u16,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn RdmaSession>, RdmaError> {
        let backlog = self
            .listeners
            .get(&(remote_address.to_string(), port))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RdmaError::ConnectionRefused {
                address: remote_address.to_string(),
                port,
            })?;

        let pipe = Arc::new(Pipe::default());
        backlog.pending.lock().push_back(PendingConnect {
            direction,
            pipe: Arc::clone(&pipe),
        });
        backlog.arrived.notify_all();

        Ok(Box::new(LoopbackSession::new(direction, pipe)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair(fabric: &LoopbackFabric, count: usize) -> (Box<dyn RdmaSession>, Box<dyn RdmaSession>) {
        let mut listener = fabric.listen("127.0.0.1", 7000).unwrap();
        let mut receiver = fabric
            .connect("127.0.0.1", Direction::Receive, "127.0.0.1", 7000, None)
            .unwrap();
        let mut sender = listener.accept(Direction::Send, None).unwrap();
        sender.configure_buffers(64, count).unwrap();
        receiver.configure_buffers(64, count).unwrap();
        (sender, receiver)
    }

    #[test]
    fn test_region_travels_to_peer() {
        let fabric = LoopbackFabric::new();
        let (mut sender, mut receiver) = pair(&fabric, 2);

        let mut region = sender.acquire_send_region(None).unwrap();
        assert_eq!(region.capacity(), 64);
        region.as_mut_slice()[..2].copy_from_slice(b"hi");
        region.set_used(2);
        sender.queue_region(region).unwrap();

        let received = receiver.acquire_received_region(None).unwrap();
        assert_eq!(received.data(), b"hi");
        receiver.release_received_region(received).unwrap();
    }

    #[test]
    fn test_credits_bound_in_flight_regions() {
        let fabric = LoopbackFabric::new();
        let (mut sender, mut receiver) = pair(&fabric, 1);

        let region = sender.acquire_send_region(None).unwrap();
        sender.queue_region(region).unwrap();
        assert_eq!(
            sender.acquire_send_region(Some(Duration::from_millis(20))),
            Err(RdmaError::Timeout)
        );

        let received = receiver.acquire_received_region(None).unwrap();
        receiver.release_received_region(received).unwrap();
        assert!(sender.acquire_send_region(Some(Duration::from_millis(20))).is_ok());
    }

    #[test]
    fn test_receive_timeout_and_polling() {
        let fabric = LoopbackFabric::new();
        let (_sender, mut receiver) = pair(&fabric, 1);

        assert_eq!(
            receiver.acquire_received_region(Some(Duration::from_millis(10))),
            Err(RdmaError::Timeout)
        );
        receiver.set_rx_polling(true).unwrap();
        assert_eq!(
            receiver.acquire_received_region(Some(Duration::from_millis(10))),
            Err(RdmaError::Timeout)
        );
    }

    #[test]
    fn test_drop_disconnects_after_drain() {
        let fabric = LoopbackFabric::new();
        let (mut sender, mut receiver) = pair(&fabric, 2);

        let region = sender.acquire_send_region(None).unwrap();
        sender.queue_region(region).unwrap();
        drop(sender);

        assert!(receiver.acquire_received_region(None).is_ok());
        assert_eq!(
            receiver.acquire_received_region(None),
            Err(RdmaError::Disconnected)
        );
    }

    #[test]
    fn test_wrong_direction_and_unconfigured() {
        let fabric = LoopbackFabric::new();
        let _listener = fabric.listen("127.0.0.1", 7000).unwrap();
        let mut session = fabric
            .connect("127.0.0.1", Direction::Send, "127.0.0.1", 7000, None)
            .unwrap();

        assert_eq!(
            session.acquire_send_region(None),
            Err(RdmaError::NotConfigured)
        );
        assert_eq!(
            session.set_rx_polling(true),
            Err(RdmaError::WrongDirection(Direction::Send))
        );
        session.configure_buffers(8, 1).unwrap();
        assert_eq!(
            session.acquire_received_region(None),
            Err(RdmaError::WrongDirection(Direction::Send))
        );
    }

    #[test]
    fn test_listen_and_connect_errors() {
        let fabric = LoopbackFabric::new();
        assert!(matches!(
            fabric.connect("127.0.0.1", Direction::Send, "127.0.0.1", 7001, None),
            Err(RdmaError::ConnectionRefused { port: 7001, .. })
        ));

        let listener = fabric.listen("127.0.0.1", 7001).unwrap();
        assert!(matches!(
            fabric.listen("127.0.0.1", 7001),
            Err(RdmaError::AddressInUse { port: 7001, .. })
        ));
        drop(listener);
        assert!(!fabric.is_listening("127.0.0.1", 7001));
    }

    #[test]
    fn test_accept_matches_direction() {
        let fabric = LoopbackFabric::new();
        let mut listener = fabric.listen("127.0.0.1", 7002).unwrap();

        let remote = fabric.clone();
        let connector = thread::spawn(move || {
            remote
                .connect("127.0.0.1", Direction::Send, "127.0.0.1", 7002, None)
                .map(|s| s.direction())
        });

        let accepted = listener.accept(Direction::Receive, None).unwrap();
        assert_eq!(accepted.direction(), Direction::Receive);
        assert_eq!(connector.join().unwrap(), Ok(Direction::Send));
    }
}
