//! One live connection to one peer.
//!
//! A channel owns its transport and runs its duties on separate tasks:
//!
//! - **sender**: drains the outbound queue in order onto the socket
//! - **receiver**: reads bytes, reassembles frames, hands packets on
//! - **dispatch**: applies the trust gate and routes packets
//! - **pinger**: emits trust-protocol pings until the channel is trusted
//!
//! Three consecutive transport failures on the sender or receiver tear the
//! channel down: the loop reports [`ChannelEvent::Faulted`] and exits, and the
//! registry removes the peer.

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{ChannelEvent, PeerEvent};
use crate::handshake::{ping_message, PingAction, TrustHandshake, KEEPALIVE_INTERVAL, PING_INTERVAL};
use crate::peer::{DisconnectNotice, PeerAnnouncement, PeerIdentity, PeerSummary, Transport};
use crate::policy::TrustPolicy;
use crate::wire::{FrameBuffer, Packet, PacketKind};

pub const MAX_TRANSPORT_RETRIES: u32 = 3;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(250);
/// Upper bound on how long `close_gracefully` waits for its notice to flush.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Caller-defined per-channel state.
pub trait ChannelContext: Default + Send + Sync + 'static {}

impl<T: Default + Send + Sync + 'static> ChannelContext for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Untrusted,
    Trusted,
    Closed,
}

/// Everything a channel needs from the process around it.
#[derive(Clone)]
pub struct ChannelLinks {
    /// This node, as announced to peers.
    pub local: PeerAnnouncement,
    pub policy: Arc<RwLock<TrustPolicy>>,
    pub router: mpsc::UnboundedSender<ChannelEvent>,
    pub events: broadcast::Sender<PeerEvent>,
    pub ping_interval: Duration,
    pub keepalive_interval: Duration,
}

impl ChannelLinks {
    /// Links that are not attached to a registry; the caller drains the
    /// returned receivers.
    pub fn detached(
        local: PeerAnnouncement,
        policy: Arc<RwLock<TrustPolicy>>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<ChannelEvent>,
        broadcast::Receiver<PeerEvent>,
    ) {
        let (router, router_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = broadcast::channel(256);
        let links = Self {
            local,
            policy,
            router,
            events,
            ping_interval: PING_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
        };
        (links, router_rx, events_rx)
    }
}

enum Outbound {
    Frame(String),
    Flush(oneshot::Sender<()>),
}

pub struct PeerChannel<C: ChannelContext = ()> {
    peer: SocketAddr,
    identifier: RwLock<Option<String>>,
    inbound: bool,
    started: AtomicBool,
    trusted: AtomicBool,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
    handshake: Mutex<TrustHandshake>,
    last_ping_back: Mutex<Option<Instant>>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    context: RwLock<C>,
    links: ChannelLinks,
}

impl<C: ChannelContext> PeerChannel<C> {
    /// Create a channel in the `Connecting` state. Packets may be queued
    /// before [`start`](Self::start); they are sent once the loops run.
    pub fn new(identity: &PeerIdentity, inbound: bool, links: ChannelLinks) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peer: identity.socket_addr(),
            identifier: RwLock::new(identity.identifier.clone()),
            inbound,
            started: AtomicBool::new(false),
            trusted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            handshake: Mutex::new(TrustHandshake::new()),
            last_ping_back: Mutex::new(None),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
            context: RwLock::new(C::default()),
            links,
        })
    }

    /// Take ownership of the transport and spawn the loops.
    pub fn start(self: &Arc<Self>, transport: Transport) {
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            warn!("Channel to {} already started", self.peer);
            return;
        };
        if self.is_closed() {
            return;
        }

        let Transport { stream, leftover } = transport;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", self.peer, e);
        }
        let (reader, writer) = stream.into_split();
        let (parsed_tx, parsed_rx) = mpsc::unbounded_channel();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).run_sender(writer, outbound_rx)));
        tasks.push(tokio::spawn(
            Arc::clone(self).run_receiver(reader, leftover, parsed_tx),
        ));
        tasks.push(tokio::spawn(Arc::clone(self).run_dispatch(parsed_rx)));

        tasks.push(tokio::spawn(Arc::clone(self).run_pinger()));
        self.started.store(true, Ordering::SeqCst);

        debug!(
            "Channel to {} started ({})",
            self.peer,
            if self.inbound { "inbound" } else { "outbound" }
        );
    }

    async fn run_sender(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut queue: mpsc::UnboundedReceiver<Outbound>,
    ) {
        while let Some(item) = queue.recv().await {
            let frame = match item {
                Outbound::Frame(frame) => frame,
                Outbound::Flush(done) => {
                    let _ = done.send(());
                    continue;
                }
            };

            let mut failures = 0;
            loop {
                let result = match writer.write_all(frame.as_bytes()).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "Write to {} failed ({}/{}): {}",
                            self.peer, failures, MAX_TRANSPORT_RETRIES, e
                        );
                        if failures >= MAX_TRANSPORT_RETRIES {
                            self.fault(format!("write failed: {}", e));
                            return;
                        }
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
    }

    async fn run_receiver(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        mut frames: FrameBuffer,
        parsed: mpsc::UnboundedSender<Packet>,
    ) {
        self.drain_frames(&mut frames, &parsed);

        let mut chunk = vec![0u8; READ_CHUNK];
        let mut failures = 0;
        loop {
            let reason = match reader.read(&mut chunk).await {
                Ok(0) => "connection closed by peer".to_string(),
                Ok(n) => {
                    failures = 0;
                    self.touch();
                    frames.extend(&chunk[..n]);
                    self.drain_frames(&mut frames, &parsed);
                    continue;
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            debug!(
                "Read from {} failed ({}/{}): {}",
                self.peer, failures, MAX_TRANSPORT_RETRIES, reason
            );
            if failures >= MAX_TRANSPORT_RETRIES {
                self.fault(reason);
                return;
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }

    fn drain_frames(&self, frames: &mut FrameBuffer, parsed: &mpsc::UnboundedSender<Packet>) {
        while let Some(result) = frames.next_packet() {
            match result {
                Ok(packet) => {
                    let _ = self.links.events.send(PeerEvent::DataReceived {
                        peer: self.peer,
                        kind: packet.kind(),
                    });
                    let _ = parsed.send(packet);
                }
                Err(e) => debug!("Discarding frame from {}: {}", self.peer, e),
            }
        }
    }

    async fn run_dispatch(self: Arc<Self>, mut parsed: mpsc::UnboundedReceiver<Packet>) {
        while let Some(packet) = parsed.recv().await {
            if !self.permits(packet.kind()) {
                debug!(
                    "Dropping {:?} from untrusted peer {}",
                    packet.kind(),
                    self.peer
                );
                continue;
            }

            match packet {
                Packet::PureMessage(text) => self.handle_message(text),
                Packet::Identity(announcement) => {
                    if announcement.identifier.is_some() {
                        let mut identifier = self.identifier.write();
                        if identifier.is_none() {
                            *identifier = announcement.identifier.clone();
                        }
                    }
                    self.route(Packet::Identity(announcement));
                }
                other => self.route(other),
            }
        }
    }

    /// Handshake pings while untrusted, keepalive pings once trusted.
    async fn run_pinger(self: Arc<Self>) {
        while !self.is_closed() {
            if self.is_trusted() {
                tokio::time::sleep(self.links.keepalive_interval).await;
                if self.is_trusted() && !self.is_closed() {
                    self.send_ping();
                }
                continue;
            }

            let handshaking = self.links.policy.read().auto_trust_protocol
                && self.handshake.lock().wants_pings();
            if handshaking {
                self.send_ping();
            }
            tokio::time::sleep(self.links.ping_interval).await;
        }
    }

    /// Trust gate for one inbound packet kind.
    fn permits(&self, kind: PacketKind) -> bool {
        if self.is_trusted() {
            return true;
        }
        let policy = self.links.policy.read();
        match kind {
            PacketKind::Identity | PacketKind::PeerGroup | PacketKind::DataTransmission => {
                policy.enhanced_exchange
            }
            PacketKind::Disconnect | PacketKind::PureMessage => {
                policy.default_communication || policy.enhanced_exchange
            }
        }
    }

    fn handle_message(&self, text: String) {
        let action = self.handshake.lock().observe(&text);
        match action {
            None => self.route(Packet::PureMessage(text)),
            Some(PingAction::Counted) => {}
            Some(PingAction::PingBack) => self.ping_back(),
            Some(PingAction::Promote) => {
                if self.links.policy.read().auto_trust_protocol && self.trust() {
                    info!("Peer {} trusted after ping handshake", self.peer);
                    self.send_ping();
                }
            }
        }
    }

    /// At most one answer per ping interval, so two channels that are both
    /// answering cannot bounce pings between them unthrottled.
    fn ping_back(&self) {
        {
            let mut last = self.last_ping_back.lock();
            if last.is_some_and(|at| at.elapsed() < self.links.ping_interval) {
                return;
            }
            *last = Some(Instant::now());
        }
        self.send_ping();
    }

    fn route(&self, packet: Packet) {
        let _ = self.links.router.send(ChannelEvent::Packet {
            from: self.peer,
            packet,
        });
    }

    fn fault(&self, reason: String) {
        if self.is_closed() {
            return;
        }
        warn!("Channel to {} failed: {}", self.peer, reason);
        let _ = self.links.router.send(ChannelEvent::Faulted {
            peer: self.peer,
            reason,
        });
    }

    fn send_ping(&self) {
        self.load_outgoing(&Packet::PureMessage(ping_message(self.links.local.address)));
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Queue a packet for the sender loop. Never blocks; packets queued on a
    /// closed channel are discarded.
    pub fn load_outgoing(&self, packet: &Packet) {
        match packet.to_wire() {
            Ok(frame) => self.load_frame(frame),
            Err(e) => warn!("Failed to encode {:?} for {}: {}", packet.kind(), self.peer, e),
        }
    }

    /// Queue an already framed packet.
    pub fn load_frame(&self, frame: String) {
        if self.is_closed() {
            return;
        }
        let _ = self.outbound_tx.send(Outbound::Frame(frame));
    }

    /// Mark trusted. Returns whether the state changed.
    pub fn trust(&self) -> bool {
        if self.is_closed() || self.trusted.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.links.router.send(ChannelEvent::Trusted(self.peer));
        true
    }

    /// Mark untrusted. Returns whether the state changed.
    pub fn untrust(&self) -> bool {
        self.trusted.swap(false, Ordering::SeqCst)
    }

    /// Cancel every loop and drop anything still queued. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.trusted.store(false, Ordering::SeqCst);
        self.outbound_rx.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("Channel to {} closed", self.peer);
    }

    /// Send a disconnect notice, wait for it to reach the socket, then close.
    pub async fn close_gracefully(&self, reason: &str) {
        if self.is_closed() {
            return;
        }

        self.load_outgoing(&Packet::Disconnect(DisconnectNotice {
            identifier: self.links.local.identifier.clone(),
            reason: reason.to_string(),
        }));

        if self.started.load(Ordering::SeqCst) {
            let (done_tx, done_rx) = oneshot::channel();
            if self.outbound_tx.send(Outbound::Flush(done_tx)).is_ok()
                && tokio::time::timeout(FLUSH_TIMEOUT, done_rx).await.is_err()
            {
                debug!("Disconnect notice to {} not flushed in time", self.peer);
            }
        }
        self.close();
    }

    pub fn state(&self) -> ChannelState {
        if self.is_closed() {
            ChannelState::Closed
        } else if !self.started.load(Ordering::SeqCst) {
            ChannelState::Connecting
        } else if self.is_trusted() {
            ChannelState::Trusted
        } else {
            ChannelState::Untrusted
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn identifier(&self) -> Option<String> {
        self.identifier.read().clone()
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Pings observed from the peer so far.
    pub fn observed_pings(&self) -> u32 {
        self.handshake.lock().observed()
    }

    pub fn ready_for_trust(&self) -> bool {
        self.handshake.lock().ready_for_trust()
    }

    pub fn context(&self) -> RwLockReadGuard<'_, C> {
        self.context.read()
    }

    pub fn with_context_mut<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.context.write())
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            address: self.peer.ip(),
            port: self.peer.port(),
            identifier: self.identifier(),
            trusted: self.is_trusted(),
            inbound: self.inbound,
            idle_secs: self.idle_for().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerGroup;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn local(id: &str, port: u16) -> PeerAnnouncement {
        PeerAnnouncement {
            identifier: Some(id.to_string()),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    struct Side {
        channel: Arc<PeerChannel>,
        router: mpsc::UnboundedReceiver<ChannelEvent>,
    }

    fn side(me: PeerAnnouncement, peer: PeerAnnouncement, policy: TrustPolicy, stream: TcpStream) -> Side {
        let (mut links, router, _events) = ChannelLinks::detached(me, Arc::new(RwLock::new(policy)));
        links.ping_interval = Duration::from_millis(40);
        links.keepalive_interval = Duration::from_millis(120);
        let channel = PeerChannel::new(&PeerIdentity::from(peer), false, links);
        channel.start(Transport::new(stream));
        Side { channel, router }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("router closed")
    }

    #[tokio::test]
    async fn test_ping_handshake_trusts_both_sides() {
        let (a_stream, b_stream) = socket_pair().await;
        let mut a = side(local("a", 1), local("b", 2), TrustPolicy::default(), a_stream);
        let mut b = side(local("b", 2), local("a", 1), TrustPolicy::default(), b_stream);

        assert!(matches!(next_event(&mut a.router).await, ChannelEvent::Trusted(_)));
        assert!(matches!(next_event(&mut b.router).await, ChannelEvent::Trusted(_)));
        assert_eq!(a.channel.state(), ChannelState::Trusted);
        assert_eq!(b.channel.state(), ChannelState::Trusted);
        assert!(a.channel.observed_pings() >= 3);
    }

    #[tokio::test]
    async fn test_untrusted_channel_drops_gated_kinds() {
        let policy = TrustPolicy {
            auto_trust_protocol: false,
            ..TrustPolicy::default()
        };
        let (a_stream, b_stream) = socket_pair().await;
        let a = side(local("a", 1), local("b", 2), policy.clone(), a_stream);
        let mut b = side(local("b", 2), local("a", 1), policy, b_stream);

        a.channel.load_outgoing(&Packet::PeerGroup(PeerGroup::default()));
        a.channel.load_outgoing(&Packet::PureMessage("hello".to_string()));

        match next_event(&mut b.router).await {
            ChannelEvent::Packet { packet, .. } => {
                assert_eq!(packet, Packet::PureMessage("hello".to_string()))
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(b.channel.trust());
        assert!(!b.channel.trust());
        assert!(matches!(next_event(&mut b.router).await, ChannelEvent::Trusted(_)));

        a.channel.load_outgoing(&Packet::PeerGroup(PeerGroup::default()));
        match next_event(&mut b.router).await {
            ChannelEvent::Packet { packet, .. } => {
                assert_eq!(packet, Packet::PeerGroup(PeerGroup::default()))
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trusted_channel_keeps_link_active() {
        let policy = TrustPolicy {
            auto_trust_protocol: false,
            ..TrustPolicy::default()
        };
        let (a_stream, b_stream) = socket_pair().await;
        let a = side(local("a", 1), local("b", 2), policy.clone(), a_stream);
        let b = side(local("b", 2), local("a", 1), policy, b_stream);
        assert!(a.channel.trust());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(b.channel.observed_pings() >= 3);
        assert!(b.channel.idle_for() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_outbound_order_is_preserved() {
        let policy = TrustPolicy {
            auto_trust_protocol: false,
            ..TrustPolicy::default()
        };
        let (a_stream, b_stream) = socket_pair().await;
        let a = side(local("a", 1), local("b", 2), policy.clone(), a_stream);
        let mut b = side(local("b", 2), local("a", 1), policy, b_stream);

        for i in 0..50 {
            a.channel.load_outgoing(&Packet::PureMessage(format!("message {}", i)));
        }
        for i in 0..50 {
            match next_event(&mut b.router).await {
                ChannelEvent::Packet {
                    packet: Packet::PureMessage(text),
                    ..
                } => assert_eq!(text, format!("message {}", i)),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_hangup_faults_channel() {
        let policy = TrustPolicy {
            auto_trust_protocol: false,
            ..TrustPolicy::default()
        };
        let (a_stream, b_stream) = socket_pair().await;
        let mut a = side(local("a", 1), local("b", 2), policy, a_stream);
        drop(b_stream);

        assert!(matches!(
            next_event(&mut a.router).await,
            ChannelEvent::Faulted { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_demotes_and_discards() {
        let (a_stream, _b_stream) = socket_pair().await;
        let a = side(local("a", 1), local("b", 2), TrustPolicy::default(), a_stream);
        a.channel.trust();

        a.channel.close();
        a.channel.close();
        a.channel.load_outgoing(&Packet::PureMessage("ignored".to_string()));

        assert_eq!(a.channel.state(), ChannelState::Closed);
        assert!(!a.channel.is_trusted());
        assert!(!a.channel.trust());
    }

    #[tokio::test]
    async fn test_graceful_close_delivers_notice() {
        let policy = TrustPolicy {
            auto_trust_protocol: false,
            ..TrustPolicy::default()
        };
        let (a_stream, b_stream) = socket_pair().await;
        let a = side(local("a", 1), local("b", 2), policy.clone(), a_stream);
        let mut b = side(local("b", 2), local("a", 1), policy, b_stream);

        a.channel.close_gracefully("bye").await;
        assert!(a.channel.is_closed());

        match next_event(&mut b.router).await {
            ChannelEvent::Packet {
                packet: Packet::Disconnect(notice),
                ..
            } => {
                assert_eq!(notice.reason, "bye");
                assert_eq!(notice.identifier.as_deref(), Some("a"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typed_context() {
        #[derive(Default)]
        struct Hits(u32);

        let (links, _router, _events) = ChannelLinks::detached(
            local("a", 1),
            Arc::new(RwLock::new(TrustPolicy::default())),
        );
        let channel: Arc<PeerChannel<Hits>> =
            PeerChannel::new(&PeerIdentity::from(local("b", 2)), true, links);

        channel.with_context_mut(|hits| hits.0 += 2);
        assert_eq!(channel.context().0, 2);
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert!(channel.is_inbound());
    }
}
