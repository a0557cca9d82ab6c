//! WAN bootstrap: a single TCP request/response against a well-known node.
//!
//! In peer mode the client sends its Identity and receives a PeerGroup. In
//! authority mode it sends [`AUTHORITY_KEY_REQUEST`] as a pure message and
//! receives the trust-anchor public key as a pure message.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{Discovery, DiscoveryEvent, DiscoverySource};
use crate::error::{GridError, Result};
use crate::peer::{PeerAnnouncement, PeerGroup};
use crate::wire::{read_packet, write_packet, FrameBuffer, Packet};

pub const AUTHORITY_KEY_REQUEST: &str = "AUTHORITY KEY REQUEST";
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(30);
const REFRESH_INTERVAL: Duration = Duration::from_secs(300);
/// Requesters remembered by a responder and handed to later requesters.
const ROSTER_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    Peers,
    Authority,
}

async fn exchange(endpoint: SocketAddr, request: &Packet) -> Result<Packet> {
    let round_trip = async {
        let mut stream = TcpStream::connect(endpoint).await?;
        write_packet(&mut stream, request).await?;
        let mut frames = FrameBuffer::new();
        read_packet(&mut stream, &mut frames).await
    };
    tokio::time::timeout(EXCHANGE_TIMEOUT, round_trip)
        .await
        .map_err(|_| GridError::Timeout)?
}

/// Ask `endpoint` for the peers it knows.
pub async fn request_peers(endpoint: SocketAddr, local: &PeerAnnouncement) -> Result<Vec<PeerAnnouncement>> {
    match exchange(endpoint, &Packet::Identity(local.clone())).await? {
        Packet::PeerGroup(group) => Ok(group
            .peers
            .into_iter()
            .filter(|p| local.identifier.is_none() || p.identifier != local.identifier)
            .collect()),
        other => Err(GridError::Protocol(format!(
            "expected PeerGroup from bootstrap, got {:?}",
            other.kind()
        ))),
    }
}

/// Ask `endpoint` for the trust-anchor public key.
pub async fn request_authority_key(endpoint: SocketAddr) -> Result<String> {
    let request = Packet::PureMessage(AUTHORITY_KEY_REQUEST.to_string());
    match exchange(endpoint, &request).await? {
        Packet::PureMessage(key) if !key.is_empty() => Ok(key),
        other => Err(GridError::Protocol(format!(
            "expected authority key from bootstrap, got {:?}",
            other.kind()
        ))),
    }
}

pub struct WanBootstrap {
    endpoint: SocketAddr,
    local: PeerAnnouncement,
    mode: BootstrapMode,
    discovered: Arc<RwLock<Vec<PeerAnnouncement>>>,
    authority_key: Arc<RwLock<Option<String>>>,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    task: Option<JoinHandle<()>>,
}

impl WanBootstrap {
    pub fn new(
        endpoint: SocketAddr,
        local: PeerAnnouncement,
        mode: BootstrapMode,
    ) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                endpoint,
                local,
                mode,
                discovered: Arc::new(RwLock::new(Vec::new())),
                authority_key: Arc::new(RwLock::new(None)),
                event_tx: tx,
                task: None,
            },
            rx,
        )
    }

    pub async fn authority_key(&self) -> Option<String> {
        self.authority_key.read().await.clone()
    }

    async fn run(
        endpoint: SocketAddr,
        local: PeerAnnouncement,
        mode: BootstrapMode,
        discovered: Arc<RwLock<Vec<PeerAnnouncement>>>,
        authority_key: Arc<RwLock<Option<String>>>,
        event_tx: mpsc::Sender<DiscoveryEvent>,
    ) {
        loop {
            let wait = match mode {
                BootstrapMode::Peers => match request_peers(endpoint, &local).await {
                    Ok(peers) => {
                        info!("Bootstrap {} returned {} peers", endpoint, peers.len());
                        *discovered.write().await = peers.clone();
                        for announcement in peers {
                            let event = DiscoveryEvent::PeerDiscovered {
                                announcement,
                                via: DiscoverySource::Bootstrap,
                            };
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        REFRESH_INTERVAL
                    }
                    Err(e) => {
                        warn!("Bootstrap exchange with {} failed: {}", endpoint, e);
                        RETRY_DELAY
                    }
                },
                BootstrapMode::Authority => match request_authority_key(endpoint).await {
                    Ok(key) => {
                        info!("Received authority key from {}", endpoint);
                        *authority_key.write().await = Some(key.clone());
                        let _ = event_tx.send(DiscoveryEvent::AuthorityKey(key)).await;
                        return;
                    }
                    Err(e) => {
                        warn!("Authority key request to {} failed: {}", endpoint, e);
                        RETRY_DELAY
                    }
                },
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl Discovery for WanBootstrap {
    async fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        self.task = Some(tokio::spawn(Self::run(
            self.endpoint,
            self.local.clone(),
            self.mode,
            Arc::clone(&self.discovered),
            Arc::clone(&self.authority_key),
            self.event_tx.clone(),
        )));
        info!("WAN bootstrap started against {} ({:?})", self.endpoint, self.mode);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!("WAN bootstrap stopped");
        Ok(())
    }

    async fn discovered_peers(&self) -> Vec<PeerAnnouncement> {
        self.discovered.read().await.clone()
    }
}

/// Source of the peers a responder hands out.
pub type PeerDirectory = Arc<dyn Fn() -> Vec<PeerAnnouncement> + Send + Sync>;

/// Serves the other end of the bootstrap exchange.
pub struct BootstrapResponder {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl BootstrapResponder {
    pub async fn bind(
        addr: SocketAddr,
        directory: PeerDirectory,
        authority_key: Option<String>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let roster = Arc::new(Mutex::new(VecDeque::new()));
        let authority_key = authority_key.map(Arc::new);

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tokio::spawn(Self::serve(
                            stream,
                            remote,
                            Arc::clone(&directory),
                            Arc::clone(&roster),
                            authority_key.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Bootstrap accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        info!("Bootstrap responder listening on {}", local_addr);
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }

    async fn serve(
        mut stream: TcpStream,
        remote: SocketAddr,
        directory: PeerDirectory,
        roster: Arc<Mutex<VecDeque<PeerAnnouncement>>>,
        authority_key: Option<Arc<String>>,
    ) {
        let mut frames = FrameBuffer::new();
        let request =
            match tokio::time::timeout(EXCHANGE_TIMEOUT, read_packet(&mut stream, &mut frames)).await {
                Ok(Ok(packet)) => packet,
                Ok(Err(e)) => {
                    debug!("Bootstrap request from {} unreadable: {}", remote, e);
                    return;
                }
                Err(_) => {
                    debug!("Bootstrap request from {} timed out", remote);
                    return;
                }
            };

        let reply = match request {
            Packet::Identity(announcement) => {
                let requester = PeerAnnouncement {
                    address: remote.ip(),
                    ..announcement
                };
                let mut peers = directory();
                {
                    let mut roster = roster.lock();
                    for known in roster.iter() {
                        if !peers.iter().any(|p| p.socket_addr() == known.socket_addr()) {
                            peers.push(known.clone());
                        }
                    }
                    roster.retain(|p| p.socket_addr() != requester.socket_addr());
                    roster.push_back(requester.clone());
                    while roster.len() > ROSTER_LIMIT {
                        roster.pop_front();
                    }
                }
                peers.retain(|p| p.socket_addr() != requester.socket_addr());
                debug!("Answering bootstrap from {} with {} peers", remote, peers.len());
                Packet::PeerGroup(PeerGroup { peers })
            }
            Packet::PureMessage(text) if text == AUTHORITY_KEY_REQUEST => match &authority_key {
                Some(key) => Packet::PureMessage(key.to_string()),
                None => {
                    debug!("Authority key requested by {} but none configured", remote);
                    return;
                }
            },
            other => {
                debug!("Unexpected bootstrap request {:?} from {}", other.kind(), remote);
                return;
            }
        };

        if let Err(e) = write_packet(&mut stream, &reply).await {
            debug!("Failed to answer bootstrap from {}: {}", remote, e);
        }
    }
}

impl Drop for BootstrapResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn announcement(id: &str, port: u16) -> PeerAnnouncement {
        PeerAnnouncement {
            identifier: Some(id.to_string()),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    async fn responder(key: Option<&str>) -> BootstrapResponder {
        let directory: PeerDirectory = Arc::new(|| vec![announcement("seed", 52000)]);
        BootstrapResponder::bind(
            "127.0.0.1:0".parse().unwrap(),
            directory,
            key.map(str::to_string),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_peer_exchange_remembers_requesters() {
        let server = responder(None).await;

        let first = request_peers(server.local_addr(), &announcement("one", 53001))
            .await
            .unwrap();
        assert_eq!(first, vec![announcement("seed", 52000)]);

        let second = request_peers(server.local_addr(), &announcement("two", 53002))
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.contains(&announcement("one", 53001)));
    }

    #[tokio::test]
    async fn test_authority_key_exchange() {
        let server = responder(Some("anchor-public-key")).await;
        let key = request_authority_key(server.local_addr()).await.unwrap();
        assert_eq!(key, "anchor-public-key");
    }

    #[tokio::test]
    async fn test_authority_key_missing() {
        let server = responder(None).await;
        assert!(request_authority_key(server.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_discovery_emits_candidates() {
        let server = responder(None).await;
        let (mut wan, mut rx) = WanBootstrap::new(
            server.local_addr(),
            announcement("client", 53003),
            BootstrapMode::Peers,
        );
        wan.start().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DiscoveryEvent::PeerDiscovered { announcement: a, via } => {
                assert_eq!(a, announcement("seed", 52000));
                assert_eq!(via, DiscoverySource::Bootstrap);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(wan.discovered_peers().await.len(), 1);
        wan.stop().await.unwrap();
    }
}
