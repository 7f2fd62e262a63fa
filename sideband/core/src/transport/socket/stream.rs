//! TCP stream transport.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use crate::error::{Result, SidebandError};
use crate::frame::{self, LENGTH_PREFIX_SIZE};
use crate::transport::SidebandTransport;
use crate::usage_id::{UsageId, CONNECT_ID_LENGTH};

/// Sideband transport over one connected TCP stream
///
/// Every read and write loops until the full byte count has moved. In
/// low-latency mode Nagle is disabled and the socket is non-blocking, so a
/// read with nothing to receive spins instead of parking the thread.
#[derive(Debug)]
pub struct SocketTransport {
    usage_id: UsageId,
    stream: TcpStream,
    buffer_size: usize,
    low_latency: bool,
}

impl SocketTransport {
    /// Connect to a published `host:port` and announce `usage_id` (client side)
    ///
    /// The listener reads exactly [`CONNECT_ID_LENGTH`] bytes before it
    /// knows which request the connection belongs to, so only ids from
    /// [`ConnectionIdGenerator`](crate::usage_id::ConnectionIdGenerator)
    /// (`"ID:"` plus ten right-aligned digits) can be announced. Any other
    /// id is rejected up front: a shorter one such as `"ID: 1"` would leave
    /// the listener waiting for the missing bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUsageId` if the id is not [`CONNECT_ID_LENGTH`] bytes,
    /// `InvalidAddress` for a malformed address, `ConnectFailed` if the
    /// connection is refused, or the IO error of the handshake write.
    pub fn connect(
        address: &str,
        usage_id: UsageId,
        buffer_size: usize,
        low_latency: bool,
    ) -> Result<Self> {
        if !usage_id.is_connect_id() {
            return Err(SidebandError::InvalidUsageId(usage_id.to_string()));
        }
        let (host, port) = super::split_address(address)?;

        let stream =
            TcpStream::connect((host, port)).map_err(|e| SidebandError::ConnectFailed {
                address: address.to_string(),
                source: e,
            })?;
        Self::configure(&stream, low_latency)?;

        let mut transport = Self {
            usage_id,
            stream,
            buffer_size,
            low_latency,
        };
        let announce = transport.usage_id.as_str().as_bytes().to_vec();
        write_fully(&mut transport.stream, &announce)?;

        tracing::debug!(
            usage_id = %transport.usage_id,
            address = %address,
            low_latency,
            "Connected sideband socket"
        );
        Ok(transport)
    }

    /// Wrap an accepted stream and read the peer's usage id (listener side)
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the peer hangs up before sending a full
    /// id, or `InvalidUsageId` if the id is not UTF-8.
    pub fn accept(mut stream: TcpStream, buffer_size: usize, low_latency: bool) -> Result<Self> {
        let usage_id = read_connect_id(&mut stream)?;
        Self::from_accepted(stream, usage_id, buffer_size, low_latency)
    }

    /// Wrap an accepted stream whose usage id has already been read
    ///
    /// # Errors
    ///
    /// Returns the IO error if the socket options cannot be applied.
    pub fn from_accepted(
        stream: TcpStream,
        usage_id: UsageId,
        buffer_size: usize,
        low_latency: bool,
    ) -> Result<Self> {
        Self::configure(&stream, low_latency)?;
        Ok(Self {
            usage_id,
            stream,
            buffer_size,
            low_latency,
        })
    }

    fn configure(stream: &TcpStream, low_latency: bool) -> Result<()> {
        if low_latency {
            stream.set_nodelay(true)?;
            stream.set_nonblocking(true)?;
        }
        Ok(())
    }

    /// Whether Nagle is off and reads busy-poll
    #[must_use]
    pub fn is_low_latency(&self) -> bool {
        self.low_latency
    }

    /// Address of the remote end
    ///
    /// # Errors
    ///
    /// Returns the IO error if the socket is no longer connected.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Split into `(reader, writer)` halves over clones of one socket
    ///
    /// A thread blocked reading on one half never holds up a thread writing
    /// on the other. The [`SocketInterrupt`] shuts the shared socket down,
    /// which ends IO blocked on either half.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the socket cannot be cloned.
    pub fn split(self) -> Result<(Self, Self, SocketInterrupt)> {
        let interrupt = SocketInterrupt(self.stream.try_clone()?);
        let writer = Self {
            usage_id: self.usage_id.clone(),
            stream: self.stream.try_clone()?,
            buffer_size: self.buffer_size,
            low_latency: self.low_latency,
        };
        Ok((self, writer, interrupt))
    }
}

/// Shuts down a split socket so IO blocked on either half returns
#[derive(Debug)]
pub struct SocketInterrupt(TcpStream);

impl SocketInterrupt {
    /// Shut the socket down in both directions
    pub fn trigger(&self) {
        if let Err(e) = self.0.shutdown(Shutdown::Both) {
            tracing::debug!(error = %e, "Sideband socket already shut down");
        }
    }
}

/// Read the fixed-width usage id a client sends right after connecting
pub(crate) fn read_connect_id(stream: &mut impl Read) -> Result<UsageId> {
    let mut id = [0u8; CONNECT_ID_LENGTH];
    read_fully(stream, &mut id)?;
    let id = std::str::from_utf8(&id)
        .map_err(|_| SidebandError::InvalidUsageId(String::from_utf8_lossy(&id).into_owned()))?;
    Ok(UsageId::from(id))
}

/// Read exactly `buf.len()` bytes, retrying partial and would-block reads
pub(crate) fn read_fully(stream: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(SidebandError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::hint::spin_loop(),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Write all of `bytes`, retrying partial and would-block writes
pub(crate) fn write_fully(stream: &mut impl Write, bytes: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => return Err(SidebandError::ConnectionClosed),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::hint::spin_loop(),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl SidebandTransport for SocketTransport {
    fn usage_id(&self) -> &UsageId {
        &self.usage_id
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        write_fully(&mut self.stream, bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        read_fully(&mut self.stream, buf)?;
        Ok(buf.len())
    }

    fn write_length_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        frame::ensure_fits(bytes.len(), self.buffer_size)?;
        write_fully(&mut self.stream, &frame::encode_length(bytes.len()))?;
        write_fully(&mut self.stream, bytes)
    }

    fn read_length_prefix(&mut self) -> Result<usize> {
        let mut header = [0u8; LENGTH_PREFIX_SIZE];
        read_fully(&mut self.stream, &mut header)?;
        let len = frame::decode_length(header);
        frame::ensure_fits(len, self.buffer_size)?;
        Ok(len)
    }

    fn read_from_length_prefixed(&mut self, buf: &mut [u8]) -> Result<usize> {
        frame::ensure_fits(buf.len(), self.buffer_size)?;
        read_fully(&mut self.stream, buf)?;
        Ok(buf.len())
    }
}
