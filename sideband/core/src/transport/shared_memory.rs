//! Shared-Memory Transport
//!
//! One POSIX shared-memory object (`shm_open`) per channel, named
//! `"/" + prefix + usage_id`. The owner creates and sizes the object and
//! unlinks it on drop; clients only attach to an object that already exists.
//!
//! The object is opened when the transport is built so a missing or
//! undersized segment is reported immediately, but the mapping itself is
//! established on first access.
//!
//! The segment is `buffer_size + 8` bytes, so a frame carries a full
//! `buffer_size` payload just like the stream transports. Raw `write`/`read`
//! copy up to `buffer_size` bytes from offset 0. Frames put the 8-byte
//! header at offset 0 and the payload right after it. Nothing synchronizes readers
//! with writers: a reader that runs while the peer is writing can observe a
//! partial frame, so callers pair operations through their control plane.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::error::{Result, SidebandError};
use crate::frame::{self, LENGTH_PREFIX_SIZE};
use crate::transport::SidebandTransport;
use crate::usage_id::UsageId;

/// Which side of the channel a segment handle belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentRole {
    /// Created the OS object; unlinks it when dropped
    Owner,
    /// Attached to an existing OS object
    Client,
}

/// OS object name for a usage id
#[must_use]
pub fn segment_name(prefix: &str, usage_id: &UsageId) -> String {
    format!("/{prefix}{usage_id}")
}

// =============================================================================
// OS object
// =============================================================================

#[derive(Debug)]
struct SharedMemoryObject {
    name: String,
    fd: OwnedFd,
    role: SegmentRole,
}

impl SharedMemoryObject {
    fn c_name(name: &str) -> Result<CString> {
        CString::new(name).map_err(|_| SidebandError::InvalidUsageId(name.to_string()))
    }

    fn create(name: &str, len: usize) -> Result<Self> {
        let c_name = Self::c_name(name)?;
        let size = libc::off_t::try_from(len).map_err(|_| SidebandError::InvalidBufferSize {
            size: len,
            reason: "exceeds the platform file size limit",
        })?;

        // SAFETY: c_name is a valid NUL-terminated string for the call.
        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            )
        };
        if raw == -1 {
            return Err(SidebandError::shared_memory_os(name));
        }
        // SAFETY: shm_open returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let object = Self {
            name: name.to_string(),
            fd,
            role: SegmentRole::Owner,
        };

        // SAFETY: fd is open for writing.
        if unsafe { libc::ftruncate(object.fd.as_raw_fd(), size) } == -1 {
            // object drops here and unlinks the half-created segment
            return Err(SidebandError::shared_memory_os(name));
        }

        tracing::debug!(segment = %name, size = len, "Created shared memory segment");
        Ok(object)
    }

    fn open(name: &str, len: usize) -> Result<Self> {
        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string for the call.
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if raw == -1 {
            return Err(SidebandError::shared_memory_os(name));
        }
        // SAFETY: shm_open returned a fresh descriptor that nothing else owns.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(raw) });
        let existing = file.metadata().map_err(|e| SidebandError::SharedMemory {
            name: name.to_string(),
            source: e,
        })?;
        if existing.len() < len as u64 {
            return Err(SidebandError::InvalidBufferSize {
                size: len,
                reason: "larger than the existing shared memory segment",
            });
        }

        tracing::debug!(segment = %name, size = len, "Attached to shared memory segment");
        Ok(Self {
            name: name.to_string(),
            fd: OwnedFd::from(file),
            role: SegmentRole::Client,
        })
    }
}

impl Drop for SharedMemoryObject {
    fn drop(&mut self) {
        if self.role != SegmentRole::Owner {
            return;
        }
        let Ok(c_name) = CString::new(self.name.as_str()) else {
            return;
        };
        // SAFETY: c_name is a valid NUL-terminated string for the call.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
            tracing::warn!(
                segment = %self.name,
                error = %std::io::Error::last_os_error(),
                "Failed to unlink shared memory segment"
            );
        }
    }
}

// =============================================================================
// Mapping
// =============================================================================

#[derive(Debug)]
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory owned by this value; moving it
// between threads is fine, and all access goes through &self / &mut self.
unsafe impl Send for Mapping {}

impl Mapping {
    fn new(object: &SharedMemoryObject, len: usize) -> Result<Self> {
        // SAFETY: fd refers to a shared-memory object at least `len` bytes
        // long; a null hint lets the kernel pick the address.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                object.fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(SidebandError::shared_memory_os(&object.name));
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| SidebandError::shared_memory_os(&object.name))?;
        Ok(Self { ptr, len })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr..ptr+len is a live read/write mapping for as long as
        // self exists, and &mut self guarantees no other borrow in-process.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Sideband transport over one shared-memory segment
#[derive(Debug)]
pub struct SharedMemoryTransport {
    usage_id: UsageId,
    buffer_size: usize,
    mapping: Option<Mapping>,
    object: SharedMemoryObject,
}

impl SharedMemoryTransport {
    /// Create the OS object for a new channel (owner side)
    ///
    /// # Errors
    ///
    /// Returns `InvalidBufferSize` for a zero size, or `SharedMemory` if the
    /// object cannot be created and sized.
    pub fn create(usage_id: UsageId, name: &str, buffer_size: usize) -> Result<Self> {
        let object = SharedMemoryObject::create(name, Self::segment_len(buffer_size)?)?;
        Ok(Self {
            usage_id,
            buffer_size,
            mapping: None,
            object,
        })
    }

    /// Attach to the OS object of an existing channel (client side)
    ///
    /// # Errors
    ///
    /// Returns `SharedMemory` if no such object exists, or
    /// `InvalidBufferSize` if it is smaller than `buffer_size`.
    pub fn attach(usage_id: UsageId, name: &str, buffer_size: usize) -> Result<Self> {
        let object = SharedMemoryObject::open(name, Self::segment_len(buffer_size)?)?;
        Ok(Self {
            usage_id,
            buffer_size,
            mapping: None,
            object,
        })
    }

    /// Bytes of OS object behind a channel of `buffer_size`
    fn segment_len(buffer_size: usize) -> Result<usize> {
        if buffer_size == 0 {
            return Err(SidebandError::InvalidBufferSize {
                size: 0,
                reason: "shared memory segments cannot be empty",
            });
        }
        buffer_size
            .checked_add(LENGTH_PREFIX_SIZE)
            .ok_or(SidebandError::InvalidBufferSize {
                size: buffer_size,
                reason: "no room for the frame header",
            })
    }

    /// OS object name
    #[must_use]
    pub fn segment_name(&self) -> &str {
        &self.object.name
    }

    /// Whether this handle created the segment
    #[must_use]
    pub fn role(&self) -> SegmentRole {
        self.object.role
    }

    /// Whether the mapping has been established yet
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    fn buffer(&mut self) -> Result<&mut [u8]> {
        let mapping = match self.mapping.take() {
            Some(mapping) => mapping,
            None => Mapping::new(&self.object, self.buffer_size + LENGTH_PREFIX_SIZE)?,
        };
        Ok(self.mapping.insert(mapping).as_mut_slice())
    }

    pub(crate) fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let buffer = self.buffer()?;
        let end = offset.saturating_add(bytes.len());
        frame::ensure_fits(end, buffer.len())?;
        buffer[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let buffer = self.buffer()?;
        let end = offset.saturating_add(buf.len());
        frame::ensure_fits(end, buffer.len())?;
        buf.copy_from_slice(&buffer[offset..end]);
        Ok(())
    }
}

impl SidebandTransport for SharedMemoryTransport {
    fn usage_id(&self) -> &UsageId {
        &self.usage_id
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        frame::ensure_fits(bytes.len(), self.buffer_size)?;
        self.write_at(0, bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        frame::ensure_fits(buf.len(), self.buffer_size)?;
        self.read_at(0, buf)?;
        Ok(buf.len())
    }

    fn write_length_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        frame::ensure_fits(bytes.len(), self.max_frame_len())?;
        self.write_at(0, &frame::encode_length(bytes.len()))?;
        self.write_at(LENGTH_PREFIX_SIZE, bytes)
    }

    fn read_length_prefix(&mut self) -> Result<usize> {
        frame::decode_length_from(self.buffer()?)
    }

    fn read_from_length_prefixed(&mut self, buf: &mut [u8]) -> Result<usize> {
        frame::ensure_fits(buf.len(), self.max_frame_len())?;
        self.read_at(LENGTH_PREFIX_SIZE, buf)?;
        Ok(buf.len())
    }

    fn supports_direct_read_write(&self) -> bool {
        true
    }

    fn begin_direct_read(&mut self, len: usize) -> Result<&[u8]> {
        let buffer = self.buffer()?;
        frame::ensure_fits(len, buffer.len())?;
        Ok(&buffer[..len])
    }

    fn begin_direct_read_length_prefixed(&mut self) -> Result<&[u8]> {
        let buffer = self.buffer()?;
        let len = frame::decode_length_from(buffer)?;
        frame::ensure_fits(len, buffer.len() - LENGTH_PREFIX_SIZE)?;
        Ok(&buffer[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len])
    }

    fn finish_direct_read(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin_direct_write(&mut self) -> Result<&mut [u8]> {
        let buffer = self.buffer()?;
        frame::ensure_fits(LENGTH_PREFIX_SIZE, buffer.len())?;
        Ok(&mut buffer[LENGTH_PREFIX_SIZE..])
    }

    fn finish_direct_write(&mut self, len: usize) -> Result<()> {
        frame::ensure_fits(len, self.max_frame_len())?;
        self.write_at(0, &frame::encode_length(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn unique_name() -> String {
        format!("/sbtest_{}", uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_owner_and_client_share_bytes() {
        let name = unique_name();
        let mut owner = SharedMemoryTransport::create("TestBuffer".into(), &name, 4096).unwrap();
        let mut client = SharedMemoryTransport::attach("TestBuffer".into(), &name, 4096).unwrap();

        assert!(!owner.is_mapped());
        owner.write(b"hello").unwrap();
        assert!(owner.is_mapped());

        let mut buf = [0u8; 5];
        assert_eq!(client.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(client.role(), SegmentRole::Client);
    }

    #[test]
    fn test_length_prefixed_frame() {
        let name = unique_name();
        let mut owner = SharedMemoryTransport::create("TestBuffer".into(), &name, 64).unwrap();

        owner.write_length_prefixed(b"0123456789").unwrap();
        assert_eq!(owner.read_length_prefix().unwrap(), 10);
        let mut payload = [0u8; 10];
        owner.read_from_length_prefixed(&mut payload).unwrap();
        assert_eq!(&payload, b"0123456789");
    }

    #[test]
    fn test_zero_length_frame() {
        let name = unique_name();
        let mut owner = SharedMemoryTransport::create("TestBuffer".into(), &name, 16).unwrap();
        owner.write_length_prefixed(&[]).unwrap();
        assert_eq!(owner.read_length_prefix().unwrap(), 0);
        assert!(owner.begin_direct_read_length_prefixed().unwrap().is_empty());
    }

    #[test]
    fn test_oversized_writes_rejected() {
        let name = unique_name();
        let mut owner = SharedMemoryTransport::create("TestBuffer".into(), &name, 16).unwrap();

        assert!(owner.write(&[0u8; 16]).is_ok());
        assert!(matches!(
            owner.write(&[0u8; 17]),
            Err(SidebandError::FrameTooLarge { len: 17, max: 16 })
        ));
        // the segment has room for the header on top of a full payload
        assert!(owner.write_length_prefixed(&[0u8; 16]).is_ok());
        assert_eq!(owner.read_length_prefix().unwrap(), 16);
        assert!(matches!(
            owner.write_length_prefixed(&[0u8; 17]),
            Err(SidebandError::FrameTooLarge { len: 17, max: 16 })
        ));
    }

    #[test]
    fn test_direct_write_is_readable_as_frame() {
        let name = unique_name();
        let mut owner = SharedMemoryTransport::create("TestBuffer".into(), &name, 128).unwrap();

        let slot = owner.begin_direct_write().unwrap();
        assert_eq!(slot.len(), 128);
        slot[..4].copy_from_slice(b"abcd");
        owner.finish_direct_write(4).unwrap();

        assert_eq!(owner.read_length_prefix().unwrap(), 4);
        assert_eq!(owner.begin_direct_read_length_prefixed().unwrap(), b"abcd");
        owner.finish_direct_read().unwrap();
        assert_eq!(&owner.begin_direct_read(12).unwrap()[8..], b"abcd");
    }

    #[test]
    fn test_attach_missing_segment_fails() {
        let result = SharedMemoryTransport::attach("nope".into(), &unique_name(), 64);
        assert!(matches!(result, Err(SidebandError::SharedMemory { .. })));
    }

    #[test]
    fn test_attach_larger_than_segment_fails() {
        let name = unique_name();
        let _owner = SharedMemoryTransport::create("small".into(), &name, 64).unwrap();
        let result = SharedMemoryTransport::attach("small".into(), &name, 4096);
        assert!(matches!(result, Err(SidebandError::InvalidBufferSize { .. })));
    }

    #[test]
    fn test_owner_drop_unlinks() {
        let name = unique_name();
        let owner = SharedMemoryTransport::create("gone".into(), &name, 64).unwrap();
        drop(owner);
        assert!(SharedMemoryTransport::attach("gone".into(), &name, 64).is_err());
    }

    #[test]
    fn test_zero_size_rejected() {
        let result = SharedMemoryTransport::create("empty".into(), &unique_name(), 0);
        assert!(matches!(result, Err(SidebandError::InvalidBufferSize { size: 0, .. })));
    }

    #[test]
    fn test_segment_name() {
        let id = UsageId::from("TestBuffer");
        assert_eq!(segment_name("TESTBUFFER_", &id), "/TESTBUFFER_TestBuffer");
    }
}
