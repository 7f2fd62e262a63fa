//! Length-Prefixed Framing
//!
//! Every strategy speaks the same frame format: an 8-byte unsigned length in
//! native byte order followed by that many payload bytes. There is no
//! checksum; integrity is left to the medium.
//!
//! The helpers here pick the cheapest path a transport offers. Transports
//! with direct access have the payload copied (or decoded) in place inside
//! the shared buffer; stream transports go through
//! `write_length_prefixed` / `read_length_prefix` / `read_from_length_prefixed`.
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ length: u64 (native) │ payload: [u8; length]        │
//! └──────────────────────┴──────────────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SidebandError};
use crate::transport::SidebandTransport;

/// Size of the frame header in bytes
pub const LENGTH_PREFIX_SIZE: usize = std::mem::size_of::<u64>();

/// Encode a frame length as a native-endian header
#[must_use]
pub fn encode_length(len: usize) -> [u8; LENGTH_PREFIX_SIZE] {
    (len as u64).to_ne_bytes()
}

/// Decode a native-endian header
///
/// Lengths that do not fit `usize` saturate so the following size check
/// rejects them.
#[must_use]
pub fn decode_length(header: [u8; LENGTH_PREFIX_SIZE]) -> usize {
    usize::try_from(u64::from_ne_bytes(header)).unwrap_or(usize::MAX)
}

/// Decode the header at the start of `bytes`
///
/// # Errors
///
/// Returns `FrameTooLarge` if `bytes` is shorter than a header.
pub fn decode_length_from(bytes: &[u8]) -> Result<usize> {
    let header: [u8; LENGTH_PREFIX_SIZE] = bytes
        .get(..LENGTH_PREFIX_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SidebandError::frame_too_large(LENGTH_PREFIX_SIZE, bytes.len()))?;
    Ok(decode_length(header))
}

/// Fail with `FrameTooLarge` unless `len <= max`
///
/// # Errors
///
/// Returns `FrameTooLarge` when the frame exceeds the capacity.
pub fn ensure_fits(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(SidebandError::frame_too_large(len, max));
    }
    Ok(())
}

/// Write one frame, using direct access when the transport supports it
///
/// # Errors
///
/// Returns `FrameTooLarge` if the payload exceeds the transport's frame
/// capacity, or any error of the underlying transport.
pub fn write_frame<T>(transport: &mut T, payload: &[u8]) -> Result<()>
where
    T: SidebandTransport + ?Sized,
{
    ensure_fits(payload.len(), transport.max_frame_len())?;

    if transport.supports_direct_read_write() {
        let slot = transport.begin_direct_write()?;
        slot[..payload.len()].copy_from_slice(payload);
        transport.finish_direct_write(payload.len())
    } else {
        transport.write_length_prefixed(payload)
    }
}

/// Read one frame, using direct access when the transport supports it
///
/// # Errors
///
/// Returns `FrameTooLarge` if the declared length exceeds the transport's
/// frame capacity, or any error of the underlying transport.
pub fn read_frame<T>(transport: &mut T) -> Result<Vec<u8>>
where
    T: SidebandTransport + ?Sized,
{
    if transport.supports_direct_read_write() {
        let payload = transport.begin_direct_read_length_prefixed()?.to_vec();
        transport.finish_direct_read()?;
        return Ok(payload);
    }

    let len = transport.read_length_prefix()?;
    ensure_fits(len, transport.max_frame_len())?;
    let mut payload = vec![0u8; len];
    transport.read_from_length_prefixed(&mut payload)?;
    Ok(payload)
}

/// Encode `message` as JSON and send it as one frame
///
/// # Errors
///
/// Returns `Serialization` if encoding fails, otherwise as [`write_frame`].
pub fn write_message<T, M>(transport: &mut T, message: &M) -> Result<()>
where
    T: SidebandTransport + ?Sized,
    M: Serialize + ?Sized,
{
    let encoded = serde_json::to_vec(message)?;
    write_frame(transport, &encoded)
}

/// Receive one frame and decode it from JSON
///
/// Direct-access transports decode in place; the region is released even
/// when decoding fails.
///
/// # Errors
///
/// Returns `Serialization` if the frame is not a valid `M`, otherwise as
/// [`read_frame`].
pub fn read_message<T, M>(transport: &mut T) -> Result<M>
where
    T: SidebandTransport + ?Sized,
    M: DeserializeOwned,
{
    if transport.supports_direct_read_write() {
        let decoded = {
            let payload = transport.begin_direct_read_length_prefixed()?;
            serde_json::from_slice::<M>(payload)
        };
        transport.finish_direct_read()?;
        return Ok(decoded?);
    }

    let payload = read_frame(transport)?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_native_endian_u64() {
        let header = encode_length(10);
        assert_eq!(header, 10u64.to_ne_bytes());
        assert_eq!(decode_length(header), 10);
        assert_eq!(decode_length(encode_length(0)), 0);
    }

    #[test]
    fn test_decode_from_short_buffer() {
        assert!(matches!(
            decode_length_from(&[1, 2, 3]),
            Err(SidebandError::FrameTooLarge { len: 8, max: 3 })
        ));

        let mut bytes = encode_length(4096).to_vec();
        bytes.extend_from_slice(b"trailing");
        assert_eq!(decode_length_from(&bytes).unwrap(), 4096);
    }

    #[test]
    fn test_ensure_fits() {
        assert!(ensure_fits(0, 0).is_ok());
        assert!(ensure_fits(4096, 4096).is_ok());
        assert!(matches!(
            ensure_fits(4097, 4096),
            Err(SidebandError::FrameTooLarge { len: 4097, max: 4096 })
        ));
    }
}
