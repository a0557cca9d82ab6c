use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

/// Where accepted inbound connections are placed for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundPlacement {
    /// Only the pending queue (`Registry::next_pending`).
    Queue,
    /// Only a `PeerEvent::ConnectionAttempt` notification.
    Event,
    /// Both; whichever consumer claims first wins.
    Both,
}

/// Process-wide trust policy. Shared by the registry and every channel and
/// mutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    /// Untrusted channels may still act on Disconnect and PureMessage.
    pub default_communication: bool,
    /// New channels start trusted; untrusted channels may act on every kind.
    pub enhanced_exchange: bool,
    pub blocked_ips: HashSet<IpAddr>,
    pub blocked_identifiers: HashSet<String>,
    pub inbound_placement: InboundPlacement,
    /// Run the ping handshake on every new channel.
    pub auto_trust_protocol: bool,
    /// Slow discovery broadcasts once a channel becomes trusted.
    pub auto_throttle: bool,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            default_communication: true,
            enhanced_exchange: false,
            blocked_ips: HashSet::new(),
            blocked_identifiers: HashSet::new(),
            inbound_placement: InboundPlacement::Queue,
            auto_trust_protocol: true,
            auto_throttle: true,
        }
    }
}

impl TrustPolicy {
    pub fn is_blocked_ip(&self, ip: &IpAddr) -> bool {
        self.blocked_ips.contains(ip)
    }

    pub fn is_blocked_identifier(&self, identifier: Option<&str>) -> bool {
        identifier
            .map(|id| self.blocked_identifiers.contains(id))
            .unwrap_or(false)
    }
}
