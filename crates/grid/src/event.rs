use std::net::SocketAddr;

use crate::registry::PendingConnection;
use crate::wire::{DataPayload, Packet, PacketKind};

/// Registry-wide notifications, published on a broadcast stream.
///
/// Slow subscribers lag and lose the oldest events; nothing in the overlay
/// depends on every notification being observed.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    PeerAdded {
        peer: SocketAddr,
        identifier: Option<String>,
        inbound: bool,
    },
    PeerRemoved {
        peer: SocketAddr,
    },
    PeerTrusted {
        peer: SocketAddr,
    },
    /// A frame was reassembled from the peer's byte stream.
    DataReceived {
        peer: SocketAddr,
        kind: PacketKind,
    },
    /// A pure message that is not part of the trust protocol.
    Message {
        peer: SocketAddr,
        text: String,
    },
    /// An inbound connection waiting to be claimed.
    ConnectionAttempt(PendingConnection),
}

/// A data payload that arrived over a trusted (or pre-trusted) channel.
#[derive(Debug, Clone)]
pub struct InboundData {
    pub from: SocketAddr,
    pub payload: DataPayload,
}

/// Traffic from a channel's loops to the registry router.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A packet that passed the channel's trust gate.
    Packet { from: SocketAddr, packet: Packet },
    /// The channel was promoted to trusted.
    Trusted(SocketAddr),
    /// A loop gave up on the transport.
    Faulted { peer: SocketAddr, reason: String },
}
