//! Double-Buffered Shared-Memory Transport
//!
//! Two shared-memory segments, `"{id}_A"` and `"{id}_B"`, behind one usage
//! id. Every completed operation moves `current` to the other segment, so a
//! producer can fill one half while the consumer drains the other. Producer
//! and consumer each keep their own `current` and stay in step by pairing
//! operations one-for-one.
//!
//! `current` flips after `write`, `read`, `read_from_length_prefixed`,
//! `finish_direct_read` and `finish_direct_write` even when the underlying
//! copy failed. `write_length_prefixed` only flips once both the header and
//! the payload are in place. `read_length_prefix` and the `begin_direct_*`
//! calls never flip.

use crate::error::Result;
use crate::frame::{self, LENGTH_PREFIX_SIZE};
use crate::transport::shared_memory::{segment_name, SharedMemoryTransport};
use crate::transport::SidebandTransport;
use crate::usage_id::UsageId;

/// One half of a double-buffered channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferSide {
    /// First segment, `current` at construction
    A,
    /// Second segment
    B,
}

impl BufferSide {
    /// The other half
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Usage id suffix naming this half's segment
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::A => "_A",
            Self::B => "_B",
        }
    }
}

/// Sideband transport alternating between two shared-memory segments
#[derive(Debug)]
pub struct DoubleBufferedTransport {
    usage_id: UsageId,
    buffer_a: SharedMemoryTransport,
    buffer_b: SharedMemoryTransport,
    current: BufferSide,
}

impl DoubleBufferedTransport {
    /// Create both segments (owner side)
    ///
    /// # Errors
    ///
    /// Returns the error of whichever segment could not be created; a
    /// segment created before the failure is unlinked again.
    pub fn create(usage_id: UsageId, prefix: &str, buffer_size: usize) -> Result<Self> {
        let (id_a, id_b) = Self::half_ids(&usage_id);
        let buffer_a =
            SharedMemoryTransport::create(id_a.clone(), &segment_name(prefix, &id_a), buffer_size)?;
        let buffer_b =
            SharedMemoryTransport::create(id_b.clone(), &segment_name(prefix, &id_b), buffer_size)?;
        Ok(Self::from_parts(usage_id, buffer_a, buffer_b))
    }

    /// Attach to both segments (client side)
    ///
    /// # Errors
    ///
    /// Returns the error of whichever segment could not be attached.
    pub fn attach(usage_id: UsageId, prefix: &str, buffer_size: usize) -> Result<Self> {
        let (id_a, id_b) = Self::half_ids(&usage_id);
        let buffer_a =
            SharedMemoryTransport::attach(id_a.clone(), &segment_name(prefix, &id_a), buffer_size)?;
        let buffer_b =
            SharedMemoryTransport::attach(id_b.clone(), &segment_name(prefix, &id_b), buffer_size)?;
        Ok(Self::from_parts(usage_id, buffer_a, buffer_b))
    }

    /// Combine two already-open segments, starting at `A`
    #[must_use]
    pub fn from_parts(
        usage_id: UsageId,
        buffer_a: SharedMemoryTransport,
        buffer_b: SharedMemoryTransport,
    ) -> Self {
        Self {
            usage_id,
            buffer_a,
            buffer_b,
            current: BufferSide::A,
        }
    }

    fn half_ids(usage_id: &UsageId) -> (UsageId, UsageId) {
        (
            usage_id.with_suffix(BufferSide::A.suffix()),
            usage_id.with_suffix(BufferSide::B.suffix()),
        )
    }

    /// Half that the next operation will use
    #[must_use]
    pub fn current_buffer(&self) -> BufferSide {
        self.current
    }

    fn current_mut(&mut self) -> &mut SharedMemoryTransport {
        match self.current {
            BufferSide::A => &mut self.buffer_a,
            BufferSide::B => &mut self.buffer_b,
        }
    }

    fn flip(&mut self) {
        self.current = self.current.other();
    }
}

impl SidebandTransport for DoubleBufferedTransport {
    fn usage_id(&self) -> &UsageId {
        &self.usage_id
    }

    fn buffer_size(&self) -> usize {
        self.buffer_a.buffer_size()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let result = self.current_mut().write(bytes);
        self.flip();
        result
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.current_mut().read(buf);
        self.flip();
        result
    }

    fn write_length_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        frame::ensure_fits(bytes.len(), self.max_frame_len())?;
        let current = self.current_mut();
        current.write_at(0, &frame::encode_length(bytes.len()))?;
        current.write_at(LENGTH_PREFIX_SIZE, bytes)?;
        self.flip();
        Ok(())
    }

    fn read_length_prefix(&mut self) -> Result<usize> {
        self.current_mut().read_length_prefix()
    }

    fn read_from_length_prefixed(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.current_mut().read_from_length_prefixed(buf);
        self.flip();
        result
    }

    fn supports_direct_read_write(&self) -> bool {
        true
    }

    fn begin_direct_read(&mut self, len: usize) -> Result<&[u8]> {
        self.current_mut().begin_direct_read(len)
    }

    fn begin_direct_read_length_prefixed(&mut self) -> Result<&[u8]> {
        self.current_mut().begin_direct_read_length_prefixed()
    }

    fn finish_direct_read(&mut self) -> Result<()> {
        let result = self.current_mut().finish_direct_read();
        self.flip();
        result
    }

    fn begin_direct_write(&mut self) -> Result<&mut [u8]> {
        self.current_mut().begin_direct_write()
    }

    fn finish_direct_write(&mut self, len: usize) -> Result<()> {
        let result = self.current_mut().finish_direct_write(len);
        self.flip();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SidebandError;
    use pretty_assertions::assert_eq;

    fn unique_prefix() -> String {
        format!("sbtest_{}_", uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_write_alternates_starting_at_a() {
        let prefix = unique_prefix();
        let mut owner = DoubleBufferedTransport::create("TestBuffer".into(), &prefix, 64).unwrap();

        for n in 0..6 {
            let expected = if n % 2 == 0 { BufferSide::A } else { BufferSide::B };
            assert_eq!(owner.current_buffer(), expected);
            owner.write(&[n]).unwrap();
        }
        assert_eq!(owner.current_buffer(), BufferSide::A);
    }

    #[test]
    fn test_failed_raw_write_still_flips() {
        let prefix = unique_prefix();
        let mut owner = DoubleBufferedTransport::create("TestBuffer".into(), &prefix, 16).unwrap();

        assert!(owner.write(&[0u8; 32]).is_err());
        assert_eq!(owner.current_buffer(), BufferSide::B);
    }

    #[test]
    fn test_failed_length_prefixed_write_does_not_flip() {
        let prefix = unique_prefix();
        let mut owner = DoubleBufferedTransport::create("TestBuffer".into(), &prefix, 16).unwrap();

        assert!(matches!(
            owner.write_length_prefixed(&[0u8; 17]),
            Err(SidebandError::FrameTooLarge { .. })
        ));
        assert_eq!(owner.current_buffer(), BufferSide::A);
    }

    #[test]
    fn test_producer_and_consumer_pair_up() {
        let prefix = unique_prefix();
        let mut owner = DoubleBufferedTransport::create("TestBuffer".into(), &prefix, 64).unwrap();
        let mut client = DoubleBufferedTransport::attach("TestBuffer".into(), &prefix, 64).unwrap();

        owner.write_length_prefixed(b"first").unwrap();
        owner.write_length_prefixed(b"second").unwrap();

        // reading the prefix leaves the consumer on the same half
        assert_eq!(client.read_length_prefix().unwrap(), 5);
        assert_eq!(client.current_buffer(), BufferSide::A);
        let mut first = [0u8; 5];
        client.read_from_length_prefixed(&mut first).unwrap();
        assert_eq!(&first, b"first");

        assert_eq!(client.current_buffer(), BufferSide::B);
        assert_eq!(client.begin_direct_read_length_prefixed().unwrap(), b"second");
        client.finish_direct_read().unwrap();
        assert_eq!(client.current_buffer(), BufferSide::A);
    }

    #[test]
    fn test_direct_write_flips_on_finish() {
        let prefix = unique_prefix();
        let mut owner = DoubleBufferedTransport::create("TestBuffer".into(), &prefix, 64).unwrap();

        owner.begin_direct_write().unwrap()[..3].copy_from_slice(b"abc");
        assert_eq!(owner.current_buffer(), BufferSide::A);
        owner.finish_direct_write(3).unwrap();
        assert_eq!(owner.current_buffer(), BufferSide::B);
    }

    #[test]
    fn test_half_segments_are_suffixed() {
        let prefix = unique_prefix();
        let owner = DoubleBufferedTransport::create("TestBuffer".into(), &prefix, 64).unwrap();
        assert_eq!(owner.buffer_a.segment_name(), format!("/{prefix}TestBuffer_A"));
        assert_eq!(owner.buffer_b.segment_name(), format!("/{prefix}TestBuffer_B"));
        assert_eq!(owner.usage_id().as_str(), "TestBuffer");
    }
}
