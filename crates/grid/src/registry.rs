//! Process-wide authority over peers.
//!
//! The registry owns every [`PeerChannel`], the inbound listener, the router
//! that consumes channel traffic, and the notification stream. Peers are
//! keyed by their listening address, so two nodes on one host stay distinct.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelContext, ChannelLinks, PeerChannel};
use crate::collab::{LocalAddresses, LocalNetworkInfo};
use crate::discovery::{DiscoveryEvent, DiscoverySource};
use crate::error::{GridError, Result};
use crate::event::{ChannelEvent, InboundData, PeerEvent};
use crate::handshake::{KEEPALIVE_INTERVAL, PING_INTERVAL};
use crate::peer::{generate_identifier, PeerAnnouncement, PeerGroup, PeerIdentity, PeerSummary, Transport};
use crate::policy::{InboundPlacement, TrustPolicy};
use crate::rate::BroadcastRate;
use crate::wire::{read_packet, write_packet, FrameBuffer, Packet};

pub const LISTEN_PORT_RANGE: (u16, u16) = (50000, 60000);
/// Bound on the identity exchange that opens every connection.
pub const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Unclaimed inbound connections are dropped after this long.
pub const PENDING_TTL: Duration = Duration::from_secs(30);

const EVENT_CAPACITY: usize = 1024;
const BIND_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub identifier: String,
    /// Fixed listening port; `None` picks a random port in the range.
    pub listen_port: Option<u16>,
    pub listen_port_range: (u16, u16),
    pub ping_interval: Duration,
    /// Ping cadence on trusted channels.
    pub keepalive_interval: Duration,
    pub policy: TrustPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            identifier: generate_identifier(),
            listen_port: None,
            listen_port_range: LISTEN_PORT_RANGE,
            ping_interval: PING_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
            policy: TrustPolicy::default(),
        }
    }
}

/// Outcome of [`Registry::add_peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// Address or identifier already registered or being connected.
    Duplicate,
    SelfConnection,
    Blocked,
    ConnectFailed,
}

impl Admission {
    pub fn is_added(self) -> bool {
        self == Admission::Added
    }
}

/// An accepted, identified inbound connection awaiting admission.
///
/// Clones share one slot: the first [`claim`](Self::claim) takes the
/// identity and transport, every later claim gets `None`.
#[derive(Debug, Clone)]
pub struct PendingConnection {
    peer: SocketAddr,
    identifier: Option<String>,
    received: Instant,
    slot: Arc<Mutex<Option<PeerIdentity>>>,
}

impl PendingConnection {
    fn new(identity: PeerIdentity) -> Self {
        Self {
            peer: identity.socket_addr(),
            identifier: identity.identifier.clone(),
            received: Instant::now(),
            slot: Arc::new(Mutex::new(Some(identity))),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn claim(&self) -> Option<PeerIdentity> {
        self.slot.lock().take()
    }

    pub fn is_available(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn is_expired(&self) -> bool {
        self.received.elapsed() >= PENDING_TTL
    }

    /// Drop the held transport, closing the connection.
    fn discard(&self) {
        self.slot.lock().take();
    }
}

struct Inner<C: ChannelContext> {
    identifier: String,
    local: LocalAddresses,
    listen_port: u16,
    ping_interval: Duration,
    keepalive_interval: Duration,
    policy: Arc<RwLock<TrustPolicy>>,
    peers: Mutex<HashMap<SocketAddr, Arc<PeerChannel<C>>>>,
    connecting: Mutex<HashMap<SocketAddr, Option<String>>>,
    outstanding: Mutex<Vec<PendingConnection>>,
    queue: Mutex<VecDeque<PendingConnection>>,
    queue_notify: Notify,
    events: broadcast::Sender<PeerEvent>,
    router_tx: mpsc::UnboundedSender<ChannelEvent>,
    data_sink: RwLock<Option<mpsc::UnboundedSender<InboundData>>>,
    rate_controls: Mutex<Vec<BroadcastRate>>,
    authority_key: RwLock<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct Registry<C: ChannelContext = ()> {
    inner: Arc<Inner<C>>,
}

impl<C: ChannelContext> Clone for Registry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ChannelContext> Registry<C> {
    /// Load local addresses, bind the inbound listener and start the accept
    /// and router loops.
    pub async fn start(config: RegistryConfig, network: &dyn LocalNetworkInfo) -> Result<Self> {
        let local = network.load_local_addresses()?;
        let listener = bind_listener(&config).await?;
        let listen_port = listener.local_addr()?.port();

        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let registry = Self {
            inner: Arc::new(Inner {
                identifier: config.identifier,
                local,
                listen_port,
                ping_interval: config.ping_interval,
                keepalive_interval: config.keepalive_interval,
                policy: Arc::new(RwLock::new(config.policy)),
                peers: Mutex::new(HashMap::new()),
                connecting: Mutex::new(HashMap::new()),
                outstanding: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                queue_notify: Notify::new(),
                events,
                router_tx,
                data_sink: RwLock::new(None),
                rate_controls: Mutex::new(Vec::new()),
                authority_key: RwLock::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let accept = tokio::spawn(registry.clone().run_accept(listener));
        let router = tokio::spawn(registry.clone().run_router(router_rx));
        registry.inner.tasks.lock().extend([accept, router]);

        info!(
            "Peer registry {} listening on {}:{}",
            registry.inner.identifier, local.address, listen_port
        );
        Ok(registry)
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn listen_port(&self) -> u16 {
        self.inner.listen_port
    }

    pub fn local_addresses(&self) -> LocalAddresses {
        self.inner.local
    }

    /// This node as it announces itself to others.
    pub fn announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            identifier: Some(self.inner.identifier.clone()),
            address: self.inner.local.address,
            port: self.inner.listen_port,
        }
    }

    pub fn policy(&self) -> Arc<RwLock<TrustPolicy>> {
        Arc::clone(&self.inner.policy)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// Where DataTransmission payloads are delivered.
    pub fn set_data_sink(&self, sink: mpsc::UnboundedSender<InboundData>) {
        *self.inner.data_sink.write() = Some(sink);
    }

    pub fn register_rate_control(&self, rate: BroadcastRate) {
        self.inner.rate_controls.lock().push(rate);
    }

    /// Slow every registered discovery broadcaster.
    pub fn throttle_discovery(&self) {
        for rate in self.inner.rate_controls.lock().iter() {
            rate.down_throttle();
        }
    }

    pub fn authority_key(&self) -> Option<String> {
        self.inner.authority_key.read().clone()
    }

    pub fn set_authority_key(&self, key: String) {
        *self.inner.authority_key.write() = Some(key);
    }

    fn links(&self) -> ChannelLinks {
        ChannelLinks {
            local: self.announcement(),
            policy: Arc::clone(&self.inner.policy),
            router: self.inner.router_tx.clone(),
            events: self.inner.events.clone(),
            ping_interval: self.inner.ping_interval,
            keepalive_interval: self.inner.keepalive_interval,
        }
    }

    fn publish(&self, event: PeerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn is_self(&self, addr: SocketAddr, identifier: Option<&str>) -> bool {
        if identifier == Some(self.inner.identifier.as_str()) {
            return true;
        }
        let ip = addr.ip();
        addr.port() == self.inner.listen_port
            && (ip == self.inner.local.address || ip.is_loopback() || ip.is_unspecified())
    }

    fn is_blocked(&self, ip: &IpAddr, identifier: Option<&str>) -> bool {
        let policy = self.inner.policy.read();
        policy.is_blocked_ip(ip) || policy.is_blocked_identifier(identifier)
    }

    fn is_registered(&self, addr: SocketAddr, identifier: Option<&str>) -> bool {
        let peers = self.inner.peers.lock();
        peers.contains_key(&addr)
            || identifier.is_some_and(|id| {
                peers.values().any(|c| c.identifier().as_deref() == Some(id))
            })
    }

    fn is_connecting(&self, addr: SocketAddr, identifier: Option<&str>) -> bool {
        let connecting = self.inner.connecting.lock();
        connecting.contains_key(&addr)
            || identifier.is_some_and(|id| connecting.values().any(|c| c.as_deref() == Some(id)))
    }

    /// Policy checks that need no connection.
    fn screen(&self, addr: SocketAddr, identifier: Option<&str>) -> Option<Admission> {
        if self.is_self(addr, identifier) {
            Some(Admission::SelfConnection)
        } else if self.is_blocked(&addr.ip(), identifier) {
            Some(Admission::Blocked)
        } else if self.is_registered(addr, identifier) || self.is_connecting(addr, identifier) {
            Some(Admission::Duplicate)
        } else {
            None
        }
    }

    /// Screening for a connection the peer opened. While our own dial to
    /// the same peer is in flight, the side with the smaller identifier keeps
    /// its outbound connection and the other accepts it.
    fn screen_inbound(&self, addr: SocketAddr, identifier: Option<&str>) -> Option<Admission> {
        if self.is_self(addr, identifier) {
            Some(Admission::SelfConnection)
        } else if self.is_blocked(&addr.ip(), identifier) {
            Some(Admission::Blocked)
        } else if self.is_registered(addr, identifier)
            || (self.is_connecting(addr, identifier) && !self.yields_to(identifier))
        {
            Some(Admission::Duplicate)
        } else {
            None
        }
    }

    fn yields_to(&self, remote: Option<&str>) -> bool {
        remote.is_some_and(|theirs| theirs < self.inner.identifier.as_str())
    }

    /// Register a peer. Without a transport the registry dials it and runs
    /// the identity preamble first.
    pub async fn add_peer(&self, mut identity: PeerIdentity) -> Admission {
        let addr = identity.socket_addr();
        let identifier = identity.identifier.clone();
        if identity.has_transport() {
            if let Some(rejected) = self.screen_inbound(addr, identifier.as_deref()) {
                debug!("Not adding inbound peer {}: {:?}", addr, rejected);
                return rejected;
            }
            return self.establish(&mut identity).await;
        }

        if let Some(rejected) = self.screen(addr, identifier.as_deref()) {
            debug!("Not adding peer {}: {:?}", addr, rejected);
            return rejected;
        }
        {
            let mut connecting = self.inner.connecting.lock();
            if connecting.contains_key(&addr) {
                return Admission::Duplicate;
            }
            connecting.insert(addr, identity.identifier.clone());
        }

        let admission = self.establish(&mut identity).await;
        self.inner.connecting.lock().remove(&addr);
        admission
    }

    async fn establish(&self, identity: &mut PeerIdentity) -> Admission {
        let addr = identity.socket_addr();
        let (transport, inbound) = match identity.take_transport() {
            Some(transport) => (transport, true),
            None => match self.dial(addr).await {
                Ok((remote, transport)) => {
                    if remote.identifier.is_some() {
                        identity.identifier = remote.identifier;
                    }
                    let identifier = identity.identifier.as_deref();
                    if self.is_self(addr, identifier) {
                        return Admission::SelfConnection;
                    }
                    if self.is_blocked(&addr.ip(), identifier) {
                        return Admission::Blocked;
                    }
                    if self.is_registered(addr, identifier) {
                        return Admission::Duplicate;
                    }
                    (transport, false)
                }
                Err(e) => {
                    if self.is_registered(addr, identity.identifier.as_deref()) {
                        debug!("Dial to {} lost to its inbound connection", addr);
                        return Admission::Duplicate;
                    }
                    warn!("Failed to connect to peer {}: {}", addr, e);
                    return Admission::ConnectFailed;
                }
            },
        };

        let channel = PeerChannel::new(identity, inbound, self.links());
        {
            let mut peers = self.inner.peers.lock();
            if peers.contains_key(&addr) {
                return Admission::Duplicate;
            }
            peers.insert(addr, Arc::clone(&channel));
        }
        channel.start(transport);
        if self.inner.policy.read().enhanced_exchange {
            channel.trust();
        }

        info!(
            "Added peer {} ({})",
            addr,
            identity.identifier.as_deref().unwrap_or("unidentified")
        );
        self.publish(PeerEvent::PeerAdded {
            peer: addr,
            identifier: identity.identifier.clone(),
            inbound,
        });
        Admission::Added
    }

    async fn dial(&self, addr: SocketAddr) -> Result<(PeerAnnouncement, Transport)> {
        let local = Packet::Identity(self.announcement());
        let preamble = async {
            let mut stream = TcpStream::connect(addr).await?;
            write_packet(&mut stream, &local).await?;
            let mut frames = FrameBuffer::new();
            match read_packet(&mut stream, &mut frames).await? {
                Packet::Identity(remote) => Ok((
                    remote,
                    Transport {
                        stream,
                        leftover: frames,
                    },
                )),
                other => Err(GridError::Protocol(format!(
                    "expected Identity preamble, got {:?}",
                    other.kind()
                ))),
            }
        };
        tokio::time::timeout(PREAMBLE_TIMEOUT, preamble)
            .await
            .map_err(|_| GridError::Timeout)?
    }

    /// Close and forget a peer. Returns whether it was registered.
    pub fn remove_peer(&self, addr: SocketAddr) -> bool {
        let removed = self.inner.peers.lock().remove(&addr);
        match removed {
            Some(channel) => {
                channel.close();
                info!("Removed peer {}", addr);
                self.publish(PeerEvent::PeerRemoved { peer: addr });
                true
            }
            None => false,
        }
    }

    /// Like [`remove_peer`](Self::remove_peer), but tells the peer why first.
    pub async fn disconnect_peer(&self, addr: SocketAddr, reason: &str) -> bool {
        let removed = self.inner.peers.lock().remove(&addr);
        match removed {
            Some(channel) => {
                channel.close_gracefully(reason).await;
                info!("Disconnected peer {}: {}", addr, reason);
                self.publish(PeerEvent::PeerRemoved { peer: addr });
                true
            }
            None => false,
        }
    }

    /// Trust a peer explicitly. Returns whether the peer is registered.
    pub fn elevate_peer_permission(&self, addr: SocketAddr) -> bool {
        let Some(channel) = self.channel(&addr) else {
            return false;
        };
        if channel.trust() {
            info!("Elevated peer {} to trusted", addr);
        }
        if self.inner.policy.read().auto_throttle {
            self.throttle_discovery();
        }
        true
    }

    /// Block an address and drop any peer using it. Returns how many peers
    /// were removed.
    pub fn block_ip(&self, ip: IpAddr) -> usize {
        self.inner.policy.write().blocked_ips.insert(ip);
        let doomed: Vec<SocketAddr> = self
            .inner
            .peers
            .lock()
            .keys()
            .filter(|addr| addr.ip() == ip)
            .copied()
            .collect();
        doomed.into_iter().filter(|addr| self.remove_peer(*addr)).count()
    }

    pub fn block_identifier(&self, identifier: &str) -> usize {
        self.inner
            .policy
            .write()
            .blocked_identifiers
            .insert(identifier.to_string());
        let doomed: Vec<SocketAddr> = self
            .inner
            .peers
            .lock()
            .values()
            .filter(|c| c.identifier().as_deref() == Some(identifier))
            .map(|c| c.peer())
            .collect();
        doomed.into_iter().filter(|addr| self.remove_peer(*addr)).count()
    }

    pub fn channel(&self, addr: &SocketAddr) -> Option<Arc<PeerChannel<C>>> {
        self.inner.peers.lock().get(addr).cloned()
    }

    pub fn find_by_identifier(&self, identifier: &str) -> Option<Arc<PeerChannel<C>>> {
        self.inner
            .peers
            .lock()
            .values()
            .find(|c| c.identifier().as_deref() == Some(identifier))
            .cloned()
    }

    pub fn channels(&self) -> Vec<Arc<PeerChannel<C>>> {
        self.inner.peers.lock().values().cloned().collect()
    }

    pub fn trusted_channels(&self) -> Vec<Arc<PeerChannel<C>>> {
        self.inner
            .peers
            .lock()
            .values()
            .filter(|c| c.is_trusted())
            .cloned()
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    pub fn peer_snapshot(&self) -> Vec<PeerSummary> {
        let mut snapshot: Vec<PeerSummary> = self
            .inner
            .peers
            .lock()
            .values()
            .map(|c| c.summary())
            .collect();
        snapshot.sort_by_key(|s| (s.address, s.port));
        snapshot
    }

    /// Decide whether to dial a discovered peer. Returns whether a dial was
    /// started.
    ///
    /// For broadcast discovery both nodes see each other, so only the one
    /// with the smaller identifier dials.
    pub fn consider_candidate(&self, candidate: PeerAnnouncement, via: DiscoverySource) -> bool {
        let addr = candidate.socket_addr();
        if self.screen(addr, candidate.identifier.as_deref()).is_some() {
            return false;
        }
        if via.is_symmetric() {
            if let Some(theirs) = candidate.identifier.as_deref() {
                if self.inner.identifier.as_str() > theirs {
                    debug!("Leaving the dial to {} to the peer", addr);
                    return false;
                }
            }
        }
        if self.has_pending_from(addr) {
            return false;
        }

        debug!("Dialing candidate {} found via {:?}", addr, via);
        let registry = self.clone();
        tokio::spawn(async move {
            let admission = registry.add_peer(PeerIdentity::from(candidate)).await;
            debug!("Candidate {}: {:?}", addr, admission);
        });
        true
    }

    /// Feed a discovery channel's events into candidate intake.
    pub fn spawn_intake(&self, mut events: mpsc::Receiver<DiscoveryEvent>) {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    DiscoveryEvent::PeerDiscovered { announcement, via } => {
                        registry.consider_candidate(announcement, via);
                    }
                    DiscoveryEvent::AuthorityKey(key) => registry.set_authority_key(key),
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    async fn run_accept(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let registry = self.clone();
                    tokio::spawn(async move { registry.handle_inbound(stream, remote).await });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_inbound(&self, mut stream: TcpStream, remote: SocketAddr) {
        if self.inner.policy.read().is_blocked_ip(&remote.ip()) {
            debug!("Refusing connection from blocked address {}", remote);
            return;
        }

        let mut frames = FrameBuffer::new();
        let preamble = tokio::time::timeout(PREAMBLE_TIMEOUT, read_packet(&mut stream, &mut frames));
        let announcement = match preamble.await {
            Ok(Ok(Packet::Identity(announcement))) => announcement,
            Ok(Ok(other)) => {
                debug!("Connection from {} opened with {:?}", remote, other.kind());
                return;
            }
            Ok(Err(e)) => {
                debug!("Preamble from {} failed: {}", remote, e);
                return;
            }
            Err(_) => {
                debug!("Preamble from {} timed out", remote);
                return;
            }
        };

        let peer = SocketAddr::new(remote.ip(), announcement.port);
        let identifier = announcement.identifier.as_deref();
        if let Some(rejected) = self.screen_inbound(peer, identifier) {
            debug!("Rejecting inbound connection from {}: {:?}", peer, rejected);
            return;
        }
        if self.has_pending_from(peer) {
            debug!("Rejecting inbound connection from {}: already pending", peer);
            return;
        }

        if let Err(e) = write_packet(&mut stream, &Packet::Identity(self.announcement())).await {
            debug!("Failed to answer preamble from {}: {}", peer, e);
            return;
        }

        let identity = PeerIdentity::new(remote.ip(), announcement.port, announcement.identifier)
            .with_transport(Transport {
                stream,
                leftover: frames,
            });
        self.place(PendingConnection::new(identity));
    }

    fn place(&self, pending: PendingConnection) {
        let placement = self.inner.policy.read().inbound_placement;
        debug!("Inbound connection from {} placed ({:?})", pending.peer, placement);
        self.inner.outstanding.lock().push(pending.clone());

        if matches!(placement, InboundPlacement::Queue | InboundPlacement::Both) {
            self.inner.queue.lock().push_back(pending.clone());
            self.inner.queue_notify.notify_one();
        }
        if matches!(placement, InboundPlacement::Event | InboundPlacement::Both) {
            self.publish(PeerEvent::ConnectionAttempt(pending));
        }
    }

    fn has_pending_from(&self, addr: SocketAddr) -> bool {
        let mut outstanding = self.inner.outstanding.lock();
        outstanding.retain(|p| {
            let live = p.is_available() && !p.is_expired();
            if !live {
                p.discard();
            }
            live
        });
        outstanding.iter().any(|p| p.peer == addr)
    }

    /// Wait for the next queued inbound connection that nobody has claimed.
    pub async fn next_pending(&self) -> PendingConnection {
        loop {
            let notified = self.inner.queue_notify.notified();
            if let Some(pending) = self.pop_pending() {
                return pending;
            }
            notified.await;
        }
    }

    fn pop_pending(&self) -> Option<PendingConnection> {
        let mut queue = self.inner.queue.lock();
        while let Some(pending) = queue.pop_front() {
            if pending.is_available() && !pending.is_expired() {
                return Some(pending);
            }
            pending.discard();
        }
        None
    }

    /// Claim a pending connection and register it.
    pub async fn admit(&self, pending: &PendingConnection) -> Admission {
        match pending.claim() {
            Some(identity) => self.add_peer(identity).await,
            None => Admission::Duplicate,
        }
    }

    /// Admit every queued inbound connection as it arrives.
    pub fn run_admission(&self) {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let pending = registry.next_pending().await;
                let admission = registry.admit(&pending).await;
                debug!("Inbound {}: {:?}", pending.peer(), admission);
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    async fn run_router(self, mut traffic: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = traffic.recv().await {
            match event {
                ChannelEvent::Packet { from, packet } => self.route_packet(from, packet),
                ChannelEvent::Trusted(peer) => self.on_trusted(peer),
                ChannelEvent::Faulted { peer, reason } => {
                    if self.remove_peer(peer) {
                        debug!("Peer {} dropped: {}", peer, reason);
                    }
                }
            }
        }
    }

    fn route_packet(&self, from: SocketAddr, packet: Packet) {
        match packet {
            Packet::Identity(announcement) => {
                debug!(
                    "Identity from {}: {}",
                    from,
                    announcement.identifier.as_deref().unwrap_or("unidentified")
                );
            }
            Packet::Disconnect(notice) => {
                info!("Peer {} disconnected: {}", from, notice.reason);
                self.remove_peer(from);
            }
            Packet::PeerGroup(group) => {
                debug!("Peer {} referred {} peers", from, group.peers.len());
                for announcement in group.peers {
                    self.consider_candidate(announcement, DiscoverySource::Referral);
                }
            }
            Packet::DataTransmission(payload) => match self.inner.data_sink.read().as_ref() {
                Some(sink) => {
                    let _ = sink.send(InboundData { from, payload });
                }
                None => debug!("No data sink; dropping {} payload from {}", payload.format, from),
            },
            Packet::PureMessage(text) => self.publish(PeerEvent::Message { peer: from, text }),
        }
    }

    fn on_trusted(&self, peer: SocketAddr) {
        let Some(channel) = self.channel(&peer) else {
            return;
        };
        if !channel.is_trusted() {
            return;
        }

        self.publish(PeerEvent::PeerTrusted { peer });
        if self.inner.policy.read().auto_throttle {
            self.throttle_discovery();
        }

        let others: Vec<PeerAnnouncement> = self
            .channels()
            .iter()
            .filter(|c| c.peer() != peer)
            .map(|c| c.summary().announcement())
            .collect();
        if !others.is_empty() {
            channel.load_outgoing(&Packet::PeerGroup(PeerGroup { peers: others }));
        }
    }

    /// Stop every loop and close every channel with a disconnect notice.
    pub async fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let channels: Vec<(SocketAddr, Arc<PeerChannel<C>>)> =
            self.inner.peers.lock().drain().collect();
        join_all(
            channels
                .iter()
                .map(|(_, channel)| channel.close_gracefully("shutting down")),
        )
        .await;
        for (peer, _) in &channels {
            self.publish(PeerEvent::PeerRemoved { peer: *peer });
        }

        for pending in self.inner.outstanding.lock().drain(..) {
            pending.discard();
        }
        self.inner.queue.lock().clear();
        for rate in self.inner.rate_controls.lock().iter() {
            rate.stop();
        }

        info!("Peer registry {} shut down", self.inner.identifier);
    }
}

async fn bind_listener(config: &RegistryConfig) -> Result<TcpListener> {
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    if let Some(port) = config.listen_port {
        return Ok(TcpListener::bind(SocketAddr::new(any, port)).await?);
    }

    let (lo, hi) = config.listen_port_range;
    if lo > hi {
        return Err(GridError::Configuration(format!(
            "empty listen port range {}-{}",
            lo, hi
        )));
    }

    let mut last_error = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = rand::thread_rng().gen_range(lo..=hi);
        match TcpListener::bind(SocketAddr::new(any, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => GridError::Io(e),
        None => GridError::Configuration("no listen port available".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::StaticNetworkInfo;

    fn loopback() -> StaticNetworkInfo {
        StaticNetworkInfo::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None)
    }

    fn config(identifier: &str) -> RegistryConfig {
        RegistryConfig {
            identifier: identifier.to_string(),
            listen_port: Some(0),
            ping_interval: Duration::from_millis(50),
            ..RegistryConfig::default()
        }
    }

    fn identity_of<C: ChannelContext>(registry: &Registry<C>) -> PeerIdentity {
        PeerIdentity::new(IpAddr::V4(Ipv4Addr::LOCALHOST), registry.listen_port(), None)
    }

    #[test]
    fn test_pending_claim_is_exclusive() {
        let pending = PendingConnection::new(PeerIdentity::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            50001,
            Some("x".to_string()),
        ));
        let copy = pending.clone();
        assert!(copy.claim().is_some());
        assert!(pending.claim().is_none());
        assert!(!pending.is_available());
    }

    #[tokio::test]
    async fn test_empty_port_range_is_a_configuration_error() {
        let config = RegistryConfig {
            listen_port_range: (60000, 50000),
            ..RegistryConfig::default()
        };
        assert!(matches!(
            bind_listener(&config).await,
            Err(GridError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_random_port_comes_from_range() {
        let config = RegistryConfig {
            listen_port_range: (51000, 51999),
            ..RegistryConfig::default()
        };
        let listener = bind_listener(&config).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!((51000..=51999).contains(&port));
    }

    #[tokio::test]
    async fn test_self_connection_is_rejected() {
        let registry: Registry = Registry::start(config("self"), &loopback()).await.unwrap();
        assert_eq!(
            registry.add_peer(identity_of(&registry)).await,
            Admission::SelfConnection
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_to_connect() {
        let registry: Registry = Registry::start(config("lonely"), &loopback()).await.unwrap();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let identity = PeerIdentity::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, None);
        assert_eq!(registry.add_peer(identity).await, Admission::ConnectFailed);
        assert_eq!(registry.peer_count(), 0);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_blocked_address_is_rejected() {
        let a: Registry = Registry::start(config("a"), &loopback()).await.unwrap();
        let b: Registry = Registry::start(config("b"), &loopback()).await.unwrap();
        a.policy()
            .write()
            .blocked_ips
            .insert(IpAddr::V4(Ipv4Addr::LOCALHOST));

        assert_eq!(a.add_peer(identity_of(&b)).await, Admission::Blocked);
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_local_addresses_abort_startup() {
        struct Offline;
        impl LocalNetworkInfo for Offline {
            fn load_local_addresses(&self) -> Result<LocalAddresses> {
                Err(GridError::Configuration("offline".to_string()))
            }
        }

        let result: Result<Registry> = Registry::start(config("x"), &Offline).await;
        assert!(matches!(result, Err(GridError::Configuration(_))));
    }
}
