//! Services the overlay consumes but does not implement.

use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::error::{GridError, Result};

/// Clear-signs outbound task payloads and verifies inbound ones.
pub trait TaskSigner: Send + Sync {
    /// Produce a detached signature over `content`.
    fn clear_sign(&self, content: &[u8]) -> Result<String>;

    /// Check `signature` over `content` against a trust-anchor public key.
    fn verify(&self, content: &[u8], signature: &str, public_key: &str) -> bool;
}

/// Records every signing operation.
pub trait SigningLedger: Send + Sync {
    fn record_signing(&self, content_hash: &blake3::Hash, signature: &str);
}

/// Ledger that keeps records in memory for the life of the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    records: Arc<Mutex<Vec<(blake3::Hash, String)>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(blake3::Hash, String)> {
        self.records.lock().clone()
    }
}

impl SigningLedger for MemoryLedger {
    fn record_signing(&self, content_hash: &blake3::Hash, signature: &str) {
        self.records.lock().push((*content_hash, signature.to_string()));
    }
}

/// Addresses of this host on the segment discovery runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddresses {
    pub address: IpAddr,
    pub broadcast: IpAddr,
}

impl LocalAddresses {
    /// Assume a /24 for IPv4; fall back to the limited broadcast address.
    pub fn from_address(address: IpAddr) -> Self {
        let broadcast = match address {
            IpAddr::V4(v4) if v4.is_loopback() => IpAddr::V4(Ipv4Addr::new(127, 255, 255, 255)),
            IpAddr::V4(v4) => {
                let [a, b, c, _] = v4.octets();
                IpAddr::V4(Ipv4Addr::new(a, b, c, 255))
            }
            IpAddr::V6(_) => IpAddr::V4(Ipv4Addr::BROADCAST),
        };
        Self { address, broadcast }
    }
}

/// Must be consulted before any discovery channel starts.
pub trait LocalNetworkInfo: Send + Sync {
    fn load_local_addresses(&self) -> Result<LocalAddresses>;
}

/// Addresses supplied by configuration.
#[derive(Debug, Clone)]
pub struct StaticNetworkInfo {
    addresses: LocalAddresses,
}

impl StaticNetworkInfo {
    pub fn new(address: IpAddr, broadcast: Option<IpAddr>) -> Self {
        let mut addresses = LocalAddresses::from_address(address);
        if let Some(broadcast) = broadcast {
            addresses.broadcast = broadcast;
        }
        Self { addresses }
    }
}

impl LocalNetworkInfo for StaticNetworkInfo {
    fn load_local_addresses(&self) -> Result<LocalAddresses> {
        Ok(self.addresses)
    }
}

/// Finds the outward-facing address by routing a connected UDP socket.
/// No datagram is sent.
#[derive(Debug, Clone)]
pub struct ProbedNetworkInfo {
    probe_target: SocketAddr,
}

impl ProbedNetworkInfo {
    pub fn new() -> Self {
        Self {
            probe_target: SocketAddr::from(([192, 0, 2, 1], 9)),
        }
    }

    pub fn with_target(probe_target: SocketAddr) -> Self {
        Self { probe_target }
    }
}

impl Default for ProbedNetworkInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetworkInfo for ProbedNetworkInfo {
    fn load_local_addresses(&self) -> Result<LocalAddresses> {
        let probe = || -> std::io::Result<IpAddr> {
            let socket = UdpSocket::bind(("0.0.0.0", 0))?;
            socket.connect(self.probe_target)?;
            Ok(socket.local_addr()?.ip())
        };
        let address = probe().map_err(|e| {
            GridError::Configuration(format!("could not determine local address: {}", e))
        })?;
        if address.is_unspecified() {
            return Err(GridError::Configuration(
                "no routable local address".to_string(),
            ));
        }
        Ok(LocalAddresses::from_address(address))
    }
}
