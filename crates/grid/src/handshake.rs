//! Default trust protocol.
//!
//! Each side of a fresh channel sends `Ping from <address>` every
//! [`PING_INTERVAL`] until it has seen [`PINGS_TO_TRUST`] pings from the
//! other side, then promotes the channel to trusted. There is no timeout
//! promotion: a channel that never hears three pings stays untrusted.
//!
//! A trusted channel keeps pinging every [`KEEPALIVE_INTERVAL`] so that a
//! quiet but healthy link is never mistaken for an idle one.

use std::net::IpAddr;
use std::time::Duration;

pub const PING_INTERVAL: Duration = Duration::from_secs(3);
/// Ping cadence once trusted. Must stay well below the sweep's inactivity
/// threshold.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const PINGS_TO_TRUST: u32 = 3;
/// Observations past this count are answered with a ping.
pub const PING_BACK_AFTER: u32 = 5;

const PING_PREFIX: &str = "Ping from ";

pub fn ping_message(local: IpAddr) -> String {
    format!("{}{}", PING_PREFIX, local)
}

/// A message is a ping when it has the ping prefix followed by an address.
pub fn is_ping(text: &str) -> bool {
    text.strip_prefix(PING_PREFIX)
        .map(|rest| rest.trim().parse::<IpAddr>().is_ok())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Counting pings, still sending our own.
    Pinging,
    /// Enough pings seen; our pinger has stopped.
    Trusted,
    /// The peer keeps pinging after we trusted it; answer each ping.
    PingBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingAction {
    /// Counted, nothing to do.
    Counted,
    /// Threshold reached: promote the channel.
    Promote,
    /// Reply with one ping.
    PingBack,
}

#[derive(Debug)]
pub struct TrustHandshake {
    state: HandshakeState,
    observed: u32,
}

impl TrustHandshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Pinging,
            observed: 0,
        }
    }

    /// Feed one pure message. Returns `None` when the text is not a ping.
    pub fn observe(&mut self, text: &str) -> Option<PingAction> {
        if !is_ping(text) {
            return None;
        }

        if self.state == HandshakeState::PingBack {
            return Some(PingAction::PingBack);
        }

        self.observed += 1;
        let action = if self.observed == PINGS_TO_TRUST {
            self.state = HandshakeState::Trusted;
            PingAction::Promote
        } else if self.observed > PING_BACK_AFTER {
            self.state = HandshakeState::PingBack;
            PingAction::PingBack
        } else {
            PingAction::Counted
        };
        Some(action)
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn observed(&self) -> u32 {
        self.observed
    }

    /// Whether enough pings have been seen to justify trust.
    pub fn ready_for_trust(&self) -> bool {
        self.observed >= PINGS_TO_TRUST
    }

    /// Whether our own pinger should keep running.
    pub fn wants_pings(&self) -> bool {
        self.state == HandshakeState::Pinging
    }
}

impl Default for TrustHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ping() -> String {
        ping_message(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
    }

    #[test]
    fn test_ping_shape() {
        assert_eq!(ping(), "Ping from 192.168.1.20");
        assert!(is_ping("Ping from ::1"));
        assert!(!is_ping("Ping from somewhere"));
        assert!(!is_ping("hello"));
    }

    #[test]
    fn test_two_pings_never_promote() {
        let mut hs = TrustHandshake::new();
        assert_eq!(hs.observe(&ping()), Some(PingAction::Counted));
        assert_eq!(hs.observe(&ping()), Some(PingAction::Counted));
        for _ in 0..10 {
            assert_eq!(hs.observe("not a ping"), None);
        }
        assert!(!hs.ready_for_trust());
        assert_eq!(hs.state(), HandshakeState::Pinging);
    }

    #[test]
    fn test_third_ping_promotes() {
        let mut hs = TrustHandshake::new();
        hs.observe(&ping());
        hs.observe(&ping());
        assert_eq!(hs.observe(&ping()), Some(PingAction::Promote));
        assert!(hs.ready_for_trust());
        assert!(!hs.wants_pings());
    }

    #[test]
    fn test_ping_back_after_fifth() {
        let mut hs = TrustHandshake::new();
        for _ in 0..5 {
            assert_ne!(hs.observe(&ping()), Some(PingAction::PingBack));
        }
        assert_eq!(hs.state(), HandshakeState::Trusted);
        assert_eq!(hs.observe(&ping()), Some(PingAction::PingBack));
        assert_eq!(hs.state(), HandshakeState::PingBack);
        assert_eq!(hs.observe(&ping()), Some(PingAction::PingBack));
        assert_eq!(hs.observed(), 6);
    }
}
