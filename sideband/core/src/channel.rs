//! Sideband Channels and Handles
//!
//! A [`SidebandChannel`] binds a usage id and strategy to the live transport.
//! Callers hold it through a [`SidebandHandle`], an opaque reference-counted
//! handle that replaces raw pointers handed across the control plane.
//!
//! Socket and two-way RDMA channels keep their read half and write half
//! behind separate locks, so one thread can wait for data while another
//! writes. Shared-memory channels read and write one buffer and use a single
//! lock.
//!
//! Closing a channel releases the transport immediately (unmap, socket close,
//! RDMA session close), even if other handle clones are still around; those
//! clones then fail with [`SidebandError::Closed`]. A socket is shut down
//! before its halves are released, so a read blocked on it returns. An RDMA
//! operation already in progress is waited for.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SidebandError};
use crate::frame;
use crate::strategy::Strategy;
use crate::transport::{Lanes, SidebandTransport, SocketInterrupt, Transport};
use crate::usage_id::UsageId;

/// Which side created the channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRole {
    /// Created the usage id and, for connection strategies, accepted the peer
    Owner,
    /// Joined using a published address and usage id
    Client,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner => f.write_str("owner"),
            Self::Client => f.write_str("client"),
        }
    }
}

type Lane = Mutex<Option<Transport>>;

#[derive(Debug)]
enum LaneLocks {
    Shared(Lane),
    Split {
        reader: Lane,
        writer: Lane,
        interrupt: Option<SocketInterrupt>,
    },
}

impl LaneLocks {
    fn reader(&self) -> &Lane {
        match self {
            Self::Shared(lane) | Self::Split { reader: lane, .. } => lane,
        }
    }

    fn writer(&self) -> &Lane {
        match self {
            Self::Shared(lane) | Self::Split { writer: lane, .. } => lane,
        }
    }
}

impl From<Lanes> for LaneLocks {
    fn from(lanes: Lanes) -> Self {
        match lanes {
            Lanes::Shared(transport) => Self::Shared(Mutex::new(Some(transport))),
            Lanes::Split {
                reader,
                writer,
                interrupt,
            } => Self::Split {
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                interrupt,
            },
        }
    }
}

/// One logical sideband channel
#[derive(Debug)]
pub struct SidebandChannel {
    usage_id: UsageId,
    strategy: Strategy,
    role: ChannelRole,
    buffer_size: usize,
    lanes: LaneLocks,
    closed: AtomicBool,
}

impl SidebandChannel {
    /// Bind `transport` to a channel; the usage id is the transport's
    ///
    /// # Errors
    ///
    /// Returns the IO error if a socket cannot be split into its read and
    /// write halves.
    pub fn new(strategy: Strategy, role: ChannelRole, transport: Transport) -> Result<Self> {
        let usage_id = transport.usage_id().clone();
        let buffer_size = transport.buffer_size();
        Ok(Self {
            usage_id,
            strategy,
            role,
            buffer_size,
            lanes: transport.into_lanes()?.into(),
            closed: AtomicBool::new(false),
        })
    }

    /// Release the transport; later access fails with `Closed`
    ///
    /// Returns whether a transport was still held.
    pub(crate) fn shutdown(&self) -> bool {
        self.closed.store(true, Ordering::Release);
        match &self.lanes {
            LaneLocks::Shared(lane) => lane.lock().take().is_some(),
            LaneLocks::Split {
                reader,
                writer,
                interrupt,
            } => {
                if let Some(interrupt) = interrupt {
                    interrupt.trigger();
                }
                let wrote = writer.lock().take().is_some();
                let read = reader.lock().take().is_some();
                wrote || read
            }
        }
    }
}

/// Opaque handle to a registered sideband channel
///
/// Cheap to clone. Reads lock the channel's read half and writes its write
/// half, so one reader thread and one writer thread can share a handle.
/// Concurrent readers (or writers) are serialized.
#[derive(Clone)]
pub struct SidebandHandle(Arc<SidebandChannel>);

impl SidebandHandle {
    /// Wrap a channel
    #[must_use]
    pub fn new(channel: SidebandChannel) -> Self {
        Self(Arc::new(channel))
    }

    /// Usage id of the channel
    #[must_use]
    pub fn usage_id(&self) -> &UsageId {
        &self.0.usage_id
    }

    /// Strategy the channel was created with
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.0.strategy
    }

    /// Side that created this handle's transport
    #[must_use]
    pub fn role(&self) -> ChannelRole {
        self.0.role
    }

    /// Whether the channel has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Whether reads and writes have their own locks
    #[must_use]
    pub fn is_split(&self) -> bool {
        matches!(self.0.lanes, LaneLocks::Split { .. })
    }

    /// Whether two handles refer to the same channel
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn shutdown(&self) -> bool {
        self.0.shutdown()
    }

    fn lock<'a>(&'a self, lane: &'a Lane) -> Result<MappedMutexGuard<'a, Transport>> {
        MutexGuard::try_map(lane.lock(), Option::as_mut)
            .map_err(|_| SidebandError::Closed(self.0.usage_id.clone()))
    }

    /// Lock the transport that serves reads, for a sequence of operations
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the channel has been closed.
    pub fn read_half(&self) -> Result<MappedMutexGuard<'_, Transport>> {
        self.lock(self.0.lanes.reader())
    }

    /// Lock the transport that serves writes, for a sequence of operations
    ///
    /// On shared-memory channels this is the same lock as
    /// [`SidebandHandle::read_half`].
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the channel has been closed.
    pub fn write_half(&self) -> Result<MappedMutexGuard<'_, Transport>> {
        self.lock(self.0.lanes.writer())
    }

    /// Negotiated buffer size
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the channel has been closed.
    pub fn buffer_size(&self) -> Result<usize> {
        if self.is_closed() {
            return Err(SidebandError::Closed(self.0.usage_id.clone()));
        }
        Ok(self.0.buffer_size)
    }

    /// Raw write, see [`SidebandTransport::write`]
    ///
    /// # Errors
    ///
    /// Returns `Closed` or the transport's error.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.write_half()?.write(bytes)
    }

    /// Raw read, see [`SidebandTransport::read`]
    ///
    /// # Errors
    ///
    /// Returns `Closed` or the transport's error.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_half()?.read(buf)
    }

    /// Send one length-prefixed frame
    ///
    /// # Errors
    ///
    /// Returns `Closed` or the error of [`frame::write_frame`].
    pub fn write_frame(&self, payload: &[u8]) -> Result<()> {
        frame::write_frame(&mut *self.write_half()?, payload)
    }

    /// Receive one length-prefixed frame
    ///
    /// # Errors
    ///
    /// Returns `Closed` or the error of [`frame::read_frame`].
    pub fn read_frame(&self) -> Result<Vec<u8>> {
        frame::read_frame(&mut *self.read_half()?)
    }

    /// Send a JSON-encoded message as one frame
    ///
    /// # Errors
    ///
    /// Returns `Closed` or the error of [`frame::write_message`].
    pub fn write_message<M: Serialize + ?Sized>(&self, message: &M) -> Result<()> {
        frame::write_message(&mut *self.write_half()?, message)
    }

    /// Receive one frame and decode it from JSON
    ///
    /// # Errors
    ///
    /// Returns `Closed` or the error of [`frame::read_message`].
    pub fn read_message<M: DeserializeOwned>(&self) -> Result<M> {
        frame::read_message(&mut *self.read_half()?)
    }
}

impl fmt::Debug for SidebandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidebandHandle")
            .field("usage_id", &self.0.usage_id)
            .field("strategy", &self.0.strategy)
            .field("role", &self.0.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SharedMemoryTransport;

    fn shm_handle() -> SidebandHandle {
        let name = format!("/sbtest_{}", uuid::Uuid::new_v4().simple());
        let transport = SharedMemoryTransport::create("TestBuffer".into(), &name, 256).unwrap();
        SidebandHandle::new(
            SidebandChannel::new(Strategy::SharedMemory, ChannelRole::Owner, transport.into())
                .unwrap(),
        )
    }

    #[test]
    fn test_handle_frames() {
        let handle = shm_handle();
        assert_eq!(handle.usage_id().as_str(), "TestBuffer");
        assert_eq!(handle.buffer_size().unwrap(), 256);
        assert!(!handle.is_split());

        handle.write_frame(b"payload").unwrap();
        assert_eq!(handle.read_frame().unwrap(), b"payload");

        handle.write_message(&vec!["a", "b"]).unwrap();
        let decoded: Vec<String> = handle.read_message().unwrap();
        assert_eq!(decoded, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_shutdown_closes_all_clones() {
        let handle = shm_handle();
        let clone = handle.clone();
        assert!(handle.ptr_eq(&clone));

        assert!(handle.shutdown());
        assert!(!handle.shutdown());
        assert!(clone.is_closed());
        assert!(matches!(clone.buffer_size(), Err(SidebandError::Closed(_))));
        assert!(matches!(
            clone.write_frame(b"late"),
            Err(SidebandError::Closed(ref id)) if id.as_str() == "TestBuffer"
        ));
    }
}
