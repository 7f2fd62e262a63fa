//! RDMA session-pair transport.

use std::fmt;

use crate::error::{Result, SidebandError};
use crate::frame::{self, LENGTH_PREFIX_SIZE};
use crate::transport::socket::split_address;
use crate::transport::SidebandTransport;
use crate::usage_id::UsageId;

use super::provider::{BufferRegion, Direction, RdmaError, RdmaProvider, RdmaSession};
use super::{discover_interface, RdmaDirections, RdmaSettings};

/// Sideband transport over one send and one receive RDMA session
///
/// Regions are `buffer_size + 8` bytes so a full-size payload still fits
/// behind a frame header. A frame always travels in a single region.
///
/// Receives retry on vendor timeout without limit; only a disconnect or
/// another vendor error ends a blocked read.
pub struct RdmaTransport {
    usage_id: UsageId,
    buffer_size: usize,
    low_latency: bool,
    settings: RdmaSettings,
    send: Option<Box<dyn RdmaSession>>,
    receive: Option<Box<dyn RdmaSession>>,
    write_region: Option<BufferRegion>,
    read_region: Option<BufferRegion>,
}

impl RdmaTransport {
    /// Wrap connected sessions and configure their regions
    ///
    /// Either session may be absent when the owner asked for only one
    /// direction; operations needing it fail with `DirectionUnavailable`.
    ///
    /// # Errors
    ///
    /// Returns the vendor error of `configure_buffers` or `set_rx_polling`.
    pub fn new(
        usage_id: UsageId,
        send: Option<Box<dyn RdmaSession>>,
        receive: Option<Box<dyn RdmaSession>>,
        buffer_size: usize,
        low_latency: bool,
        settings: RdmaSettings,
    ) -> Result<Self> {
        let region_size = buffer_size + LENGTH_PREFIX_SIZE;
        let mut transport = Self {
            usage_id,
            buffer_size,
            low_latency,
            settings,
            send,
            receive,
            write_region: None,
            read_region: None,
        };

        if let Some(session) = transport.send.as_mut() {
            session.configure_buffers(region_size, settings.max_concurrent_transactions)?;
        }
        if let Some(session) = transport.receive.as_mut() {
            session.configure_buffers(region_size, settings.max_concurrent_transactions)?;
            if low_latency {
                session.set_rx_polling(true)?;
            }
        }
        Ok(transport)
    }

    /// Connect to an owner's published address from the local RDMA
    /// interface (client side)
    ///
    /// Only the sessions the owner waits for are opened: the receive
    /// session goes to the published port when the owner writes, the send
    /// session to the port after it when the owner reads.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` for a malformed address, the interface
    /// discovery error, or the provider's connect error.
    pub fn connect(
        provider: &dyn RdmaProvider,
        address: &str,
        usage_id: UsageId,
        buffer_size: usize,
        low_latency: bool,
        directions: RdmaDirections,
        settings: RdmaSettings,
    ) -> Result<Self> {
        let (host, port) = split_address(address)?;
        let send_port = port
            .checked_add(1)
            .ok_or_else(|| SidebandError::InvalidAddress(address.to_string()))?;
        let local_address = discover_interface(provider)?;

        let mut receive = None;
        if directions.writer {
            tracing::debug!(host, port, direction = %Direction::Receive, "Connecting RDMA session");
            receive = Some(provider.connect(
                &local_address,
                Direction::Receive,
                host,
                port,
                settings.timeout,
            )?);
        }
        let mut send = None;
        if directions.reader {
            tracing::debug!(host, port = send_port, direction = %Direction::Send, "Connecting RDMA session");
            send = Some(provider.connect(
                &local_address,
                Direction::Send,
                host,
                send_port,
                settings.timeout,
            )?);
        }

        Self::new(usage_id, send, receive, buffer_size, low_latency, settings)
    }

    /// Whether receives busy-poll
    #[must_use]
    pub fn is_low_latency(&self) -> bool {
        self.low_latency
    }

    /// Whether the session for `direction` is connected
    #[must_use]
    pub fn has_direction(&self, direction: Direction) -> bool {
        match direction {
            Direction::Send => self.send.is_some(),
            Direction::Receive => self.receive.is_some(),
        }
    }

    /// Split into a `(reader, writer)` pair, one session each
    ///
    /// A region held by an unfinished direct read or write stays with the
    /// half that owns its session.
    #[must_use]
    pub fn split(self) -> (Self, Self) {
        let Self {
            usage_id,
            buffer_size,
            low_latency,
            settings,
            send,
            receive,
            write_region,
            read_region,
        } = self;
        let reader = Self {
            usage_id: usage_id.clone(),
            buffer_size,
            low_latency,
            settings,
            send: None,
            receive,
            write_region: None,
            read_region,
        };
        let writer = Self {
            usage_id,
            buffer_size,
            low_latency,
            settings,
            send,
            receive: None,
            write_region,
            read_region: None,
        };
        (reader, writer)
    }

    fn send_session(&mut self) -> Result<&mut Box<dyn RdmaSession>> {
        self.send
            .as_mut()
            .ok_or(SidebandError::DirectionUnavailable(Direction::Send))
    }

    fn receive_session(&mut self) -> Result<&mut Box<dyn RdmaSession>> {
        self.receive
            .as_mut()
            .ok_or(SidebandError::DirectionUnavailable(Direction::Receive))
    }

    fn acquire_send(&mut self) -> Result<BufferRegion> {
        let timeout = self.settings.timeout;
        Ok(self.send_session()?.acquire_send_region(timeout)?)
    }

    fn queue(&mut self, region: BufferRegion) -> Result<()> {
        Ok(self.send_session()?.queue_region(region)?)
    }

    fn acquire_received(&mut self) -> Result<BufferRegion> {
        let timeout = self.settings.timeout;
        let session = self.receive_session()?;
        loop {
            match session.acquire_received_region(timeout) {
                Err(RdmaError::Timeout) => {
                    tracing::trace!("RDMA receive timed out, retrying");
                }
                other => return Ok(other?),
            }
        }
    }

    fn release(&mut self, region: BufferRegion) -> Result<()> {
        Ok(self.receive_session()?.release_received_region(region)?)
    }

    /// Receive a region and validate its frame header
    fn acquire_frame(&mut self) -> Result<(BufferRegion, usize)> {
        let region = self.acquire_received()?;
        let len = frame::decode_length_from(region.data()).and_then(|len| {
            frame::ensure_fits(len, region.used() - LENGTH_PREFIX_SIZE)?;
            Ok(len)
        });
        match len {
            Ok(len) => Ok((region, len)),
            Err(e) => {
                self.release(region)?;
                Err(e)
            }
        }
    }

    fn assert_no_read_held(&self, operation: &str) {
        assert!(
            self.read_region.is_none(),
            "{operation} while a received RDMA region is still held"
        );
    }
}

impl SidebandTransport for RdmaTransport {
    fn usage_id(&self) -> &UsageId {
        &self.usage_id
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        frame::ensure_fits(bytes.len(), self.buffer_size)?;
        let mut region = self.acquire_send()?;
        region.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        region.set_used(bytes.len());
        self.queue(region)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.assert_no_read_held("read");
        let region = self.acquire_received()?;
        let used = region.used();
        if used > buf.len() {
            self.release(region)?;
            return Err(SidebandError::frame_too_large(used, buf.len()));
        }
        buf[..used].copy_from_slice(region.data());
        self.release(region)?;
        Ok(used)
    }

    fn write_length_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        frame::ensure_fits(bytes.len(), self.buffer_size)?;
        let mut region = self.acquire_send()?;
        let slice = region.as_mut_slice();
        slice[..LENGTH_PREFIX_SIZE].copy_from_slice(&frame::encode_length(bytes.len()));
        slice[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + bytes.len()].copy_from_slice(bytes);
        region.set_used(LENGTH_PREFIX_SIZE + bytes.len());
        self.queue(region)
    }

    fn read_length_prefix(&mut self) -> Result<usize> {
        self.assert_no_read_held("read_length_prefix");
        let (region, len) = self.acquire_frame()?;
        self.read_region = Some(region);
        Ok(len)
    }

    fn read_from_length_prefixed(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(region) = self.read_region.take() else {
            panic!("read_from_length_prefixed without a preceding read_length_prefix");
        };
        let available = region.used() - LENGTH_PREFIX_SIZE;
        if buf.len() > available {
            self.release(region)?;
            return Err(SidebandError::frame_too_large(buf.len(), available));
        }
        buf.copy_from_slice(&region.data()[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + buf.len()]);
        self.release(region)?;
        Ok(buf.len())
    }

    fn supports_direct_read_write(&self) -> bool {
        true
    }

    fn begin_direct_read(&mut self, len: usize) -> Result<&[u8]> {
        self.assert_no_read_held("begin_direct_read");
        let region = self.acquire_received()?;
        if len > region.used() {
            let used = region.used();
            self.release(region)?;
            return Err(SidebandError::frame_too_large(len, used));
        }
        let region = self.read_region.insert(region);
        Ok(&region.data()[..len])
    }

    fn begin_direct_read_length_prefixed(&mut self) -> Result<&[u8]> {
        self.assert_no_read_held("begin_direct_read_length_prefixed");
        let (region, len) = self.acquire_frame()?;
        let region = self.read_region.insert(region);
        Ok(&region.data()[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len])
    }

    fn finish_direct_read(&mut self) -> Result<()> {
        let Some(region) = self.read_region.take() else {
            panic!("finish_direct_read without a matching begin_direct_read");
        };
        self.release(region)
    }

    fn begin_direct_write(&mut self) -> Result<&mut [u8]> {
        assert!(
            self.write_region.is_none(),
            "begin_direct_write while a previous direct write is unfinished"
        );
        let region = self.acquire_send()?;
        let region = self.write_region.insert(region);
        Ok(&mut region.as_mut_slice()[LENGTH_PREFIX_SIZE..])
    }

    fn finish_direct_write(&mut self, len: usize) -> Result<()> {
        let Some(mut region) = self.write_region.take() else {
            panic!("finish_direct_write without a matching begin_direct_write");
        };
        let max = region.capacity() - LENGTH_PREFIX_SIZE;
        if len > max {
            self.write_region = Some(region);
            return Err(SidebandError::frame_too_large(len, max));
        }
        region.as_mut_slice()[..LENGTH_PREFIX_SIZE].copy_from_slice(&frame::encode_length(len));
        region.set_used(LENGTH_PREFIX_SIZE + len);
        self.queue(region)
    }
}

impl fmt::Debug for RdmaTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaTransport")
            .field("usage_id", &self.usage_id)
            .field("buffer_size", &self.buffer_size)
            .field("low_latency", &self.low_latency)
            .field("send", &self.send.is_some())
            .field("receive", &self.receive.is_some())
            .finish_non_exhaustive()
    }
}
