//! Sideband Strategy Selection
//!
//! The owner picks a [`Strategy`] once per channel and publishes it through
//! the control plane. Discriminants match the values carried by the RPC
//! messages, so `TryFrom<i32>` accepts what a peer sends and rejects the
//! reserved value 6.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport strategy negotiated between owner and client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Strategy {
    /// Not negotiated
    Unknown = 0,
    /// Data stays on the RPC channel; no sideband transport
    Grpc = 1,
    /// One shared-memory mapping
    SharedMemory = 2,
    /// Two alternating shared-memory mappings
    DoubleBufferedSharedMemory = 3,
    /// TCP stream
    Sockets = 4,
    /// TCP stream with Nagle disabled and busy-polling reads
    SocketsLowLatency = 5,
    /// RDMA send/receive session pair
    Rdma = 7,
    /// RDMA with receive-side polling
    RdmaLowLatency = 8,
}

/// Strategies grouped by the transport that implements them
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StrategyFamily {
    /// `SharedMemory` and `DoubleBufferedSharedMemory`
    SharedMemory,
    /// `Sockets` and `SocketsLowLatency`
    Sockets,
    /// `Rdma` and `RdmaLowLatency`
    Rdma,
}

impl Strategy {
    /// All strategies that carry a sideband transport
    pub const SIDEBAND: [Strategy; 6] = [
        Strategy::SharedMemory,
        Strategy::DoubleBufferedSharedMemory,
        Strategy::Sockets,
        Strategy::SocketsLowLatency,
        Strategy::Rdma,
        Strategy::RdmaLowLatency,
    ];

    /// Transport family, `None` for `Unknown` and `Grpc`
    #[must_use]
    pub fn family(self) -> Option<StrategyFamily> {
        match self {
            Self::SharedMemory | Self::DoubleBufferedSharedMemory => {
                Some(StrategyFamily::SharedMemory)
            }
            Self::Sockets | Self::SocketsLowLatency => Some(StrategyFamily::Sockets),
            Self::Rdma | Self::RdmaLowLatency => Some(StrategyFamily::Rdma),
            Self::Unknown | Self::Grpc => None,
        }
    }

    /// Whether a sideband transport exists for this strategy
    #[must_use]
    pub fn has_sideband_transport(self) -> bool {
        self.family().is_some()
    }

    /// Whether connection setup goes through a rendezvous queue
    #[must_use]
    pub fn needs_rendezvous(self) -> bool {
        matches!(
            self.family(),
            Some(StrategyFamily::Sockets | StrategyFamily::Rdma)
        )
    }

    /// Whether the low-latency variant was selected
    #[must_use]
    pub fn is_low_latency(self) -> bool {
        matches!(self, Self::SocketsLowLatency | Self::RdmaLowLatency)
    }

    /// Wire value used by the control plane
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for Strategy {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Grpc),
            2 => Ok(Self::SharedMemory),
            3 => Ok(Self::DoubleBufferedSharedMemory),
            4 => Ok(Self::Sockets),
            5 => Ok(Self::SocketsLowLatency),
            7 => Ok(Self::Rdma),
            8 => Ok(Self::RdmaLowLatency),
            other => Err(other),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Grpc => "grpc",
            Self::SharedMemory => "shared_memory",
            Self::DoubleBufferedSharedMemory => "double_buffered_shared_memory",
            Self::Sockets => "sockets",
            Self::SocketsLowLatency => "sockets_low_latency",
            Self::Rdma => "rdma",
            Self::RdmaLowLatency => "rdma_low_latency",
        };
        f.write_str(name)
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "unknown" => Ok(Self::Unknown),
            "grpc" => Ok(Self::Grpc),
            "shared_memory" | "shm" => Ok(Self::SharedMemory),
            "double_buffered_shared_memory" | "double_buffered" => {
                Ok(Self::DoubleBufferedSharedMemory)
            }
            "sockets" | "socket" => Ok(Self::Sockets),
            "sockets_low_latency" => Ok(Self::SocketsLowLatency),
            "rdma" => Ok(Self::Rdma),
            "rdma_low_latency" => Ok(Self::RdmaLowLatency),
            other => Err(format!("unknown sideband strategy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_roundtrip() {
        for strategy in Strategy::SIDEBAND {
            assert_eq!(Strategy::try_from(strategy.as_i32()), Ok(strategy));
        }
        assert_eq!(Strategy::try_from(0), Ok(Strategy::Unknown));
        assert_eq!(Strategy::try_from(1), Ok(Strategy::Grpc));
    }

    #[test]
    fn test_reserved_value_rejected() {
        assert_eq!(Strategy::try_from(6), Err(6));
        assert_eq!(Strategy::try_from(42), Err(42));
    }

    #[test]
    fn test_families() {
        assert_eq!(
            Strategy::DoubleBufferedSharedMemory.family(),
            Some(StrategyFamily::SharedMemory)
        );
        assert_eq!(
            Strategy::SocketsLowLatency.family(),
            Some(StrategyFamily::Sockets)
        );
        assert_eq!(Strategy::Grpc.family(), None);
        assert!(!Strategy::Unknown.has_sideband_transport());
    }

    #[test]
    fn test_rendezvous_only_for_connection_oriented() {
        assert!(Strategy::Sockets.needs_rendezvous());
        assert!(Strategy::RdmaLowLatency.needs_rendezvous());
        assert!(!Strategy::SharedMemory.needs_rendezvous());
        assert!(!Strategy::Grpc.needs_rendezvous());
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("rdma-low-latency".parse::<Strategy>(), Ok(Strategy::RdmaLowLatency));
        assert_eq!("SHM".parse::<Strategy>(), Ok(Strategy::SharedMemory));
        assert!("carrier-pigeon".parse::<Strategy>().is_err());
        assert_eq!(Strategy::SocketsLowLatency.to_string(), "sockets_low_latency");
    }
}
