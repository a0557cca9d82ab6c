use async_trait::async_trait;
use rand::seq::SliceRandom;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{GridError, Result};
use crate::peer::PeerAnnouncement;
use crate::rate::BroadcastRate;
use crate::wire::Packet;

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
    async fn discovered_peers(&self) -> Vec<PeerAnnouncement>;
}

/// How a candidate reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Lan,
    Multicast,
    Bootstrap,
    /// Named in a PeerGroup sent by a connected peer.
    Referral,
}

impl DiscoverySource {
    /// Both ends of a broadcast segment hear each other, so only one of them
    /// needs to dial.
    pub fn is_symmetric(self) -> bool {
        matches!(self, DiscoverySource::Lan | DiscoverySource::Multicast)
    }
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerDiscovered {
        announcement: PeerAnnouncement,
        via: DiscoverySource,
    },
    /// Trust-anchor public key obtained from an authority bootstrap.
    AuthorityKey(String),
}

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 70, 77);
pub const MULTICAST_PORTS: [u16; 3] = [7077, 7078, 7079];
pub const LOOPBACK_BROADCAST: Ipv4Addr = Ipv4Addr::new(127, 255, 255, 255);

const EVENT_CAPACITY: usize = 64;
const RECV_POLL: Duration = Duration::from_secs(1);

/// Candidates carried by one datagram: an Identity names its sender, a
/// PeerGroup names many peers. Our own announcements are dropped.
pub fn parse_datagram(data: &[u8], src: SocketAddr, local_identifier: Option<&str>) -> Vec<PeerAnnouncement> {
    let candidates = match Packet::from_frame(data) {
        Ok(Packet::Identity(announcement)) => vec![PeerAnnouncement {
            address: src.ip(),
            ..announcement
        }],
        Ok(Packet::PeerGroup(group)) => group.peers,
        Ok(other) => {
            debug!("Ignoring {:?} datagram from {}", other.kind(), src);
            return Vec::new();
        }
        Err(e) => {
            debug!("Ignoring malformed datagram from {}: {}", src, e);
            return Vec::new();
        }
    };

    candidates
        .into_iter()
        .filter(|c| local_identifier.is_none() || c.identifier.as_deref() != local_identifier)
        .collect()
}

/// The designated port set and which of them the broadcaster currently uses.
#[derive(Debug, Clone)]
pub struct ActivePort {
    ports: Arc<Vec<u16>>,
    active: Arc<AtomicU16>,
}

impl ActivePort {
    pub fn new(ports: Vec<u16>) -> Self {
        let first = ports.choose(&mut rand::thread_rng()).copied().unwrap_or(0);
        Self {
            ports: Arc::new(ports),
            active: Arc::new(AtomicU16::new(first)),
        }
    }

    pub fn get(&self) -> u16 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Switch to a different random designated port. With a single port
    /// this is a no-op.
    pub fn rotate(&self) -> u16 {
        let current = self.get();
        let others: Vec<u16> = self.ports.iter().copied().filter(|p| *p != current).collect();
        match others.choose(&mut rand::thread_rng()) {
            Some(next) => {
                self.active.store(*next, Ordering::Relaxed);
                *next
            }
            None => current,
        }
    }
}

fn reusable_udp(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

/// Shared machinery behind LAN and multicast discovery: one broadcaster on
/// the active port, one listener per designated port.
struct Beacon {
    label: &'static str,
    source: DiscoverySource,
    local: PeerAnnouncement,
    targets: Vec<IpAddr>,
    group: Option<Ipv4Addr>,
    ports: ActivePort,
    rate: BroadcastRate,
    discovered: Arc<RwLock<HashMap<SocketAddr, PeerAnnouncement>>>,
    running: Arc<RwLock<bool>>,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Beacon {
    async fn start(&mut self) -> Result<()> {
        if *self.running.read().await {
            return Ok(());
        }
        if self.ports.ports().is_empty() {
            return Err(GridError::Configuration(format!(
                "{} discovery has no designated ports",
                self.label
            )));
        }

        let mut listeners = Vec::with_capacity(self.ports.ports().len());
        for port in self.ports.ports() {
            let socket = reusable_udp(*port).map_err(|e| {
                GridError::Discovery(format!("bind {} port {}: {}", self.label, port, e))
            })?;
            if let Some(group) = self.group {
                socket
                    .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| GridError::Discovery(e.to_string()))?;
            }
            listeners.push(socket);
        }

        let sender = reusable_udp(0).map_err(|e| GridError::Discovery(e.to_string()))?;
        if self.group.is_some() {
            sender
                .set_multicast_loop_v4(true)
                .map_err(|e| GridError::Discovery(e.to_string()))?;
        }

        {
            *self.running.write().await = true;
        }

        let packet = Packet::Identity(self.local.clone()).to_wire()?.into_bytes();
        self.tasks.push(tokio::spawn(Self::run_broadcaster(
            sender,
            packet,
            self.targets.clone(),
            self.ports.clone(),
            self.rate.clone(),
            Arc::clone(&self.running),
        )));

        for socket in listeners {
            self.tasks.push(tokio::spawn(Self::run_listener(
                socket,
                self.source,
                self.local.identifier.clone(),
                Arc::clone(&self.discovered),
                self.event_tx.clone(),
                Arc::clone(&self.running),
            )));
        }
        self.rate.start();

        info!(
            "{} discovery started on ports {:?}",
            self.label,
            self.ports.ports()
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        *self.running.write().await = false;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.rate.stop();
        info!("{} discovery stopped", self.label);
        Ok(())
    }

    async fn run_broadcaster(
        socket: UdpSocket,
        packet: Vec<u8>,
        targets: Vec<IpAddr>,
        ports: ActivePort,
        rate: BroadcastRate,
        running: Arc<RwLock<bool>>,
    ) {
        loop {
            {
                if !*running.read().await {
                    break;
                }
            }

            let port = ports.get();
            for target in &targets {
                let dest = SocketAddr::new(*target, port);
                match socket.send_to(&packet, dest).await {
                    Ok(_) => debug!("Sent discovery announce to {}", dest),
                    Err(e) => debug!("Failed to send discovery announce to {}: {}", dest, e),
                }
            }

            tokio::time::sleep(rate.next_delay()).await;
        }
    }

    async fn run_listener(
        socket: UdpSocket,
        source: DiscoverySource,
        local_identifier: Option<String>,
        discovered: Arc<RwLock<HashMap<SocketAddr, PeerAnnouncement>>>,
        event_tx: mpsc::Sender<DiscoveryEvent>,
        running: Arc<RwLock<bool>>,
    ) {
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            {
                if !*running.read().await {
                    break;
                }
            }

            match tokio::time::timeout(RECV_POLL, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, src))) => {
                    for announcement in parse_datagram(&buf[..len], src, local_identifier.as_deref()) {
                        let addr = announcement.socket_addr();
                        let is_new = discovered
                            .write()
                            .await
                            .insert(addr, announcement.clone())
                            .is_none();
                        if is_new {
                            info!("Discovered new peer at {} via {:?}", addr, source);
                        }

                        let event = DiscoveryEvent::PeerDiscovered {
                            announcement,
                            via: source,
                        };
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("UDP recv error: {}", e);
                }
                Err(_) => {}
            }
        }
    }
}

/// Subnet broadcast discovery over a set of designated UDP ports.
pub struct LanDiscovery {
    beacon: Beacon,
}

impl LanDiscovery {
    /// `broadcast` is the subnet broadcast address; the loopback broadcast
    /// address is always targeted too so nodes on one host find each other.
    pub fn new(
        local: PeerAnnouncement,
        broadcast: IpAddr,
        ports: Vec<u16>,
        rate: BroadcastRate,
    ) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let mut targets = vec![broadcast];
        let loopback = IpAddr::V4(LOOPBACK_BROADCAST);
        if broadcast != loopback {
            targets.push(loopback);
        }
        (
            Self {
                beacon: Beacon {
                    label: "LAN",
                    source: DiscoverySource::Lan,
                    local,
                    targets,
                    group: None,
                    ports: ActivePort::new(ports),
                    rate,
                    discovered: Arc::new(RwLock::new(HashMap::new())),
                    running: Arc::new(RwLock::new(false)),
                    event_tx: tx,
                    tasks: Vec::new(),
                },
            },
            rx,
        )
    }

    /// Handle for rotating the broadcast port.
    pub fn active_port(&self) -> ActivePort {
        self.beacon.ports.clone()
    }

    pub fn rate(&self) -> BroadcastRate {
        self.beacon.rate.clone()
    }
}

#[async_trait]
impl Discovery for LanDiscovery {
    async fn start(&mut self) -> Result<()> {
        self.beacon.start().await
    }

    async fn stop(&mut self) -> Result<()> {
        self.beacon.stop().await
    }

    async fn discovered_peers(&self) -> Vec<PeerAnnouncement> {
        self.beacon.discovered.read().await.values().cloned().collect()
    }
}

/// Discovery over the fixed multicast group.
pub struct MulticastDiscovery {
    beacon: Beacon,
}

impl MulticastDiscovery {
    pub fn new(local: PeerAnnouncement, rate: BroadcastRate) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        Self::with_ports(local, MULTICAST_PORTS.to_vec(), rate)
    }

    pub fn with_ports(
        local: PeerAnnouncement,
        ports: Vec<u16>,
        rate: BroadcastRate,
    ) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        (
            Self {
                beacon: Beacon {
                    label: "Multicast",
                    source: DiscoverySource::Multicast,
                    local,
                    targets: vec![IpAddr::V4(MULTICAST_GROUP)],
                    group: Some(MULTICAST_GROUP),
                    ports: ActivePort::new(ports),
                    rate,
                    discovered: Arc::new(RwLock::new(HashMap::new())),
                    running: Arc::new(RwLock::new(false)),
                    event_tx: tx,
                    tasks: Vec::new(),
                },
            },
            rx,
        )
    }

    pub fn active_port(&self) -> ActivePort {
        self.beacon.ports.clone()
    }

    pub fn rate(&self) -> BroadcastRate {
        self.beacon.rate.clone()
    }
}

#[async_trait]
impl Discovery for MulticastDiscovery {
    async fn start(&mut self) -> Result<()> {
        self.beacon.start().await
    }

    async fn stop(&mut self) -> Result<()> {
        self.beacon.stop().await
    }

    async fn discovered_peers(&self) -> Vec<PeerAnnouncement> {
        self.beacon.discovered.read().await.values().cloned().collect()
    }
}
