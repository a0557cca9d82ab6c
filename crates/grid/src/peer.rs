use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;

use crate::wire::FrameBuffer;

/// Fresh opaque identifier for a local node.
pub fn generate_identifier() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Identity packet payload: who the sender is and where it accepts
/// connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub identifier: Option<String>,
    pub address: IpAddr,
    /// TCP listening port of the announcing node.
    pub port: u16,
}

impl PeerAnnouncement {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Disconnect packet payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub identifier: Option<String>,
    pub reason: String,
}

/// PeerGroup packet payload: a list of peers the sender knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerGroup {
    pub peers: Vec<PeerAnnouncement>,
}

/// A live connection plus any bytes already read past the preamble.
#[derive(Debug)]
pub struct Transport {
    pub stream: TcpStream,
    pub leftover: FrameBuffer,
}

impl Transport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            leftover: FrameBuffer::new(),
        }
    }
}

/// A remote endpoint, optionally holding the transport that reaches it.
///
/// The transport is owned exclusively: once taken by a channel the identity
/// only describes the peer.
#[derive(Debug)]
pub struct PeerIdentity {
    pub address: IpAddr,
    pub port: u16,
    pub identifier: Option<String>,
    transport: Option<Transport>,
}

impl PeerIdentity {
    pub fn new(address: IpAddr, port: u16, identifier: Option<String>) -> Self {
        Self {
            address,
            port,
            identifier,
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn take_transport(&mut self) -> Option<Transport> {
        self.transport.take()
    }

    pub fn announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            identifier: self.identifier.clone(),
            address: self.address,
            port: self.port,
        }
    }
}

impl From<PeerAnnouncement> for PeerIdentity {
    fn from(a: PeerAnnouncement) -> Self {
        PeerIdentity::new(a.address, a.port, a.identifier)
    }
}

/// Point-in-time view of one registered peer, suitable for handing to
/// callers outside the overlay (status output, an HTTP façade).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub address: IpAddr,
    pub port: u16,
    pub identifier: Option<String>,
    pub trusted: bool,
    pub inbound: bool,
    pub idle_secs: u64,
}

impl PeerSummary {
    pub fn announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            identifier: self.identifier.clone(),
            address: self.address,
            port: self.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_identity_from_announcement() {
        let a = PeerAnnouncement {
            identifier: Some("peer-1".to_string()),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 50000,
        };
        let identity = PeerIdentity::from(a.clone());
        assert_eq!(identity.socket_addr(), "127.0.0.1:50000".parse().unwrap());
        assert!(!identity.has_transport());
        assert_eq!(identity.announcement(), a);
    }

    #[test]
    fn test_generated_identifiers_are_unique() {
        assert_ne!(generate_identifier(), generate_identifier());
    }
}
