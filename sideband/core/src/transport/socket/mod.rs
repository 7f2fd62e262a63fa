//! Socket Transport
//!
//! Sideband channels over plain TCP.
//!
//! # Handshake
//!
//! ```text
//! ┌──────────────┐                          ┌──────────────────┐
//! │    Client    │   connect host:port      │  SocketListener  │
//! │              ├─────────────────────────►│                  │
//! │              │   "ID:         7"        │ read 13 bytes    │
//! │              ├─────────────────────────►│ fulfill queued   │
//! │              │                          │ request, register│
//! │              │◄──── frames ────────────►│                  │
//! └──────────────┘                          └──────────────────┘
//! ```
//!
//! The first bytes on every accepted connection are the client's
//! fixed-width usage id. The listener registers the accepted transport under
//! that id, using the buffer size and latency mode of the request currently
//! queued on the context's socket rendezvous.

mod listener;
mod stream;

pub use listener::{SocketListener, SocketRequest};
pub use stream::{SocketInterrupt, SocketTransport};

use crate::error::{Result, SidebandError};

/// Split a published `host:port` address
///
/// The port is everything after the last `:`.
///
/// # Errors
///
/// Returns `InvalidAddress` when there is no `:`, the host is empty, or the
/// port is not a `u16`.
pub fn split_address(address: &str) -> Result<(&str, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| SidebandError::InvalidAddress(address.to_string()))?;
    if host.is_empty() {
        return Err(SidebandError::InvalidAddress(address.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| SidebandError::InvalidAddress(address.to_string()))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("localhost:50055").unwrap(), ("localhost", 50055));
        assert_eq!(split_address("10.0.0.1:50060").unwrap(), ("10.0.0.1", 50060));
    }

    #[test]
    fn test_split_address_rejects_malformed() {
        for bad in ["localhost", ":50055", "localhost:", "localhost:99999", "host:port"] {
            assert!(
                matches!(split_address(bad), Err(SidebandError::InvalidAddress(_))),
                "{bad} should be rejected"
            );
        }
    }
}
