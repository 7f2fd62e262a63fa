//! Sideband Transports
//!
//! One read/write/framing contract, four media:
//!
//! | Strategy                       | Transport                          | Direct access |
//! |--------------------------------|------------------------------------|---------------|
//! | `SharedMemory`                 | [`SharedMemoryTransport`]          | yes           |
//! | `DoubleBufferedSharedMemory`   | [`DoubleBufferedTransport`]        | yes           |
//! | `Sockets`, `SocketsLowLatency` | [`SocketTransport`]                | no            |
//! | `Rdma`, `RdmaLowLatency`       | [`RdmaTransport`]                  | yes           |
//!
//! The concrete type is picked once when the channel is created and stored
//! in the [`Transport`] enum; callers only see [`SidebandTransport`].
//!
//! # Direct Access
//!
//! `begin_direct_*` lends a slice of the transport's own buffer. The
//! matching `finish_direct_*` must be called before any other operation on
//! the same transport. Direct writes always reserve the frame header, so the
//! slice from [`SidebandTransport::begin_direct_write`] starts after it and
//! `finish_direct_write(len)` stamps `len` into the header.

pub mod double_buffered;
pub mod rdma;
pub mod shared_memory;
pub mod socket;

pub use double_buffered::{BufferSide, DoubleBufferedTransport};
pub use rdma::RdmaTransport;
pub use shared_memory::{SegmentRole, SharedMemoryTransport};
pub use socket::{SocketInterrupt, SocketTransport};

use crate::error::{Result, SidebandError};
use crate::usage_id::UsageId;

use self::rdma::Direction;

/// Read/write contract shared by every sideband strategy
///
/// An instance serves one operation at a time. Channels that need a reader
/// thread and a writer thread at once use [`Transport::into_lanes`].
pub trait SidebandTransport: Send {
    /// Id of the logical channel this transport serves
    fn usage_id(&self) -> &UsageId;

    /// Negotiated buffer size
    fn buffer_size(&self) -> usize;

    /// Largest payload a single frame may carry
    fn max_frame_len(&self) -> usize {
        self.buffer_size()
    }

    /// Copy `bytes` to the peer
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` if `bytes` does not fit the medium, or the
    /// medium's IO/vendor error.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Fill `buf` from the medium, returning the number of bytes read
    ///
    /// # Errors
    ///
    /// Returns the medium's IO/vendor error, or `ConnectionClosed` on EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write an 8-byte length followed by `bytes` as one frame
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` if the frame does not fit the medium.
    fn write_length_prefixed(&mut self, bytes: &[u8]) -> Result<()>;

    /// Declared length of the next frame; the payload stays unconsumed
    ///
    /// # Errors
    ///
    /// Returns the medium's IO/vendor error.
    fn read_length_prefix(&mut self) -> Result<usize>;

    /// Consume `buf.len()` payload bytes of the frame whose length was just
    /// read
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` if `buf` asks for more than the frame holds.
    fn read_from_length_prefixed(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether the `begin_direct_*` family is available
    fn supports_direct_read_write(&self) -> bool {
        false
    }

    /// Borrow the next `len` received bytes in place
    ///
    /// # Errors
    ///
    /// Returns `DirectAccessUnsupported` on stream transports.
    fn begin_direct_read(&mut self, _len: usize) -> Result<&[u8]> {
        Err(SidebandError::DirectAccessUnsupported)
    }

    /// Borrow the payload of the next frame in place
    ///
    /// # Errors
    ///
    /// Returns `DirectAccessUnsupported` on stream transports.
    fn begin_direct_read_length_prefixed(&mut self) -> Result<&[u8]> {
        Err(SidebandError::DirectAccessUnsupported)
    }

    /// Release what the last `begin_direct_read*` lent
    ///
    /// # Errors
    ///
    /// Returns `DirectAccessUnsupported` on stream transports.
    fn finish_direct_read(&mut self) -> Result<()> {
        Err(SidebandError::DirectAccessUnsupported)
    }

    /// Borrow the outgoing payload area, after the frame header
    ///
    /// # Errors
    ///
    /// Returns `DirectAccessUnsupported` on stream transports.
    fn begin_direct_write(&mut self) -> Result<&mut [u8]> {
        Err(SidebandError::DirectAccessUnsupported)
    }

    /// Publish the first `len` bytes of the area from `begin_direct_write`
    ///
    /// # Errors
    ///
    /// Returns `DirectAccessUnsupported` on stream transports.
    fn finish_direct_write(&mut self, _len: usize) -> Result<()> {
        Err(SidebandError::DirectAccessUnsupported)
    }
}

/// Live transport of one channel
#[derive(Debug)]
pub enum Transport {
    /// Single shared-memory segment
    SharedMemory(SharedMemoryTransport),
    /// Two alternating shared-memory segments
    DoubleBuffered(DoubleBufferedTransport),
    /// Connected TCP stream
    Socket(SocketTransport),
    /// RDMA send/receive session pair
    Rdma(RdmaTransport),
}

macro_rules! dispatch {
    ($self:ident, $t:ident => $body:expr) => {
        match $self {
            Transport::SharedMemory($t) => $body,
            Transport::DoubleBuffered($t) => $body,
            Transport::Socket($t) => $body,
            Transport::Rdma($t) => $body,
        }
    };
}

impl Transport {
    /// Short name of the medium, for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SharedMemory(_) => "shared_memory",
            Self::DoubleBuffered(_) => "double_buffered_shared_memory",
            Self::Socket(_) => "socket",
            Self::Rdma(_) => "rdma",
        }
    }

    /// The double-buffered variant, if that is what this is
    #[must_use]
    pub fn as_double_buffered(&self) -> Option<&DoubleBufferedTransport> {
        match self {
            Self::DoubleBuffered(t) => Some(t),
            _ => None,
        }
    }

    /// Separate the read half from the write half where the medium allows
    ///
    /// Sockets and RDMA channels with both sessions split. Shared memory
    /// reads and writes one buffer, and a one-way RDMA channel has only one
    /// session, so those stay whole.
    ///
    /// # Errors
    ///
    /// Returns the IO error if a socket cannot be cloned.
    pub fn into_lanes(self) -> Result<Lanes> {
        match self {
            Self::Socket(socket) => {
                let (reader, writer, interrupt) = socket.split()?;
                Ok(Lanes::Split {
                    reader: reader.into(),
                    writer: writer.into(),
                    interrupt: Some(interrupt),
                })
            }
            Self::Rdma(rdma)
                if rdma.has_direction(Direction::Send) && rdma.has_direction(Direction::Receive) =>
            {
                let (reader, writer) = rdma.split();
                Ok(Lanes::Split {
                    reader: reader.into(),
                    writer: writer.into(),
                    interrupt: None,
                })
            }
            whole => Ok(Lanes::Shared(whole)),
        }
    }
}

/// A transport laid out for one reader thread and one writer thread
#[derive(Debug)]
pub enum Lanes {
    /// Reads and writes go through the same transport
    Shared(Transport),
    /// Reads and writes go through independent halves
    Split {
        /// Half serving reads
        reader: Transport,
        /// Half serving writes
        writer: Transport,
        /// Ends IO blocked on either half; sockets only
        interrupt: Option<SocketInterrupt>,
    },
}

impl SidebandTransport for Transport {
    fn usage_id(&self) -> &UsageId {
        dispatch!(self, t => t.usage_id())
    }

    fn buffer_size(&self) -> usize {
        dispatch!(self, t => t.buffer_size())
    }

    fn max_frame_len(&self) -> usize {
        dispatch!(self, t => t.max_frame_len())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        dispatch!(self, t => t.write(bytes))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        dispatch!(self, t => t.read(buf))
    }

    fn write_length_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        dispatch!(self, t => t.write_length_prefixed(bytes))
    }

    fn read_length_prefix(&mut self) -> Result<usize> {
        dispatch!(self, t => t.read_length_prefix())
    }

    fn read_from_length_prefixed(&mut self, buf: &mut [u8]) -> Result<usize> {
        dispatch!(self, t => t.read_from_length_prefixed(buf))
    }

    fn supports_direct_read_write(&self) -> bool {
        dispatch!(self, t => t.supports_direct_read_write())
    }

    fn begin_direct_read(&mut self, len: usize) -> Result<&[u8]> {
        dispatch!(self, t => t.begin_direct_read(len))
    }

    fn begin_direct_read_length_prefixed(&mut self) -> Result<&[u8]> {
        dispatch!(self, t => t.begin_direct_read_length_prefixed())
    }

    fn finish_direct_read(&mut self) -> Result<()> {
        dispatch!(self, t => t.finish_direct_read())
    }

    fn begin_direct_write(&mut self) -> Result<&mut [u8]> {
        dispatch!(self, t => t.begin_direct_write())
    }

    fn finish_direct_write(&mut self, len: usize) -> Result<()> {
        dispatch!(self, t => t.finish_direct_write(len))
    }
}

impl From<SharedMemoryTransport> for Transport {
    fn from(t: SharedMemoryTransport) -> Self {
        Self::SharedMemory(t)
    }
}

impl From<DoubleBufferedTransport> for Transport {
    fn from(t: DoubleBufferedTransport) -> Self {
        Self::DoubleBuffered(t)
    }
}

impl From<SocketTransport> for Transport {
    fn from(t: SocketTransport) -> Self {
        Self::Socket(t)
    }
}

impl From<RdmaTransport> for Transport {
    fn from(t: RdmaTransport) -> Self {
        Self::Rdma(t)
    }
}
