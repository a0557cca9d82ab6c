//! Remote-control tasks carried inside `<Task>` data payloads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{info, warn};

use crate::channel::ChannelContext;
use crate::error::Result;
use crate::registry::Registry;
use crate::wire::Packet;

/// Property naming the identifier of the peer a task is addressed to.
pub const RECIPIENT_KEY: &str = "Recipient";
/// Property holding a detached signature over the rest of the task.
pub const SIGNATURE_KEY: &str = "Signature";
pub const IDENTIFIER_KEY: &str = "Identifier";
pub const ADDRESS_KEY: &str = "Address";
pub const REASON_KEY: &str = "Reason";
pub const MESSAGE_KEY: &str = "Message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    BlockPeer,
    BlockIp,
    Disconnect,
    Ping,
    Authorize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTask {
    pub kind: TaskKind,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl NetworkTask {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            properties: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn to(self, recipient: impl Into<String>) -> Self {
        self.with(RECIPIENT_KEY, recipient)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn recipient(&self) -> Option<&str> {
        self.property(RECIPIENT_KEY)
    }

    pub fn signature(&self) -> Option<&str> {
        self.property(SIGNATURE_KEY)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Canonical bytes a signature covers: the task without its signature.
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.properties.remove(SIGNATURE_KEY);
        unsigned.encode()
    }
}

/// Reaction to inbound tasks, one method per kind. Every default logs.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn block_peer(&self, from: SocketAddr, task: &NetworkTask) {
        info!("Task BlockPeer from {}: {:?}", from, task.property(IDENTIFIER_KEY));
    }

    async fn block_ip(&self, from: SocketAddr, task: &NetworkTask) {
        info!("Task BlockIp from {}: {:?}", from, task.property(ADDRESS_KEY));
    }

    async fn disconnect(&self, from: SocketAddr, task: &NetworkTask) {
        info!("Task Disconnect from {}: {:?}", from, task.property(REASON_KEY));
    }

    async fn ping(&self, from: SocketAddr, task: &NetworkTask) {
        info!("Task Ping from {}: {:?}", from, task.property(MESSAGE_KEY));
    }

    async fn authorize(&self, from: SocketAddr, task: &NetworkTask) {
        info!("Task Authorize from {}: {:?}", from, task.property(IDENTIFIER_KEY));
    }
}

/// Handler that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTaskHandler;

impl TaskHandler for LoggingTaskHandler {}

pub async fn dispatch_task(handler: &dyn TaskHandler, from: SocketAddr, task: &NetworkTask) {
    match task.kind {
        TaskKind::BlockPeer => handler.block_peer(from, task).await,
        TaskKind::BlockIp => handler.block_ip(from, task).await,
        TaskKind::Disconnect => handler.disconnect(from, task).await,
        TaskKind::Ping => handler.ping(from, task).await,
        TaskKind::Authorize => handler.authorize(from, task).await,
    }
}

/// Handler that applies tasks to the local registry.
pub struct RegistryTaskHandler<C: ChannelContext = ()> {
    registry: Registry<C>,
}

impl<C: ChannelContext> RegistryTaskHandler<C> {
    pub fn new(registry: Registry<C>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<C: ChannelContext> TaskHandler for RegistryTaskHandler<C> {
    async fn block_peer(&self, from: SocketAddr, task: &NetworkTask) {
        match task.property(IDENTIFIER_KEY) {
            Some(identifier) => {
                let removed = self.registry.block_identifier(identifier);
                info!("Blocked peer {} at request of {} ({} removed)", identifier, from, removed);
            }
            None => warn!("BlockPeer task from {} names no identifier", from),
        }
    }

    async fn block_ip(&self, from: SocketAddr, task: &NetworkTask) {
        match task.property(ADDRESS_KEY).map(str::parse::<IpAddr>) {
            Some(Ok(ip)) => {
                let removed = self.registry.block_ip(ip);
                info!("Blocked address {} at request of {} ({} removed)", ip, from, removed);
            }
            Some(Err(e)) => warn!("BlockIp task from {} has a bad address: {}", from, e),
            None => warn!("BlockIp task from {} names no address", from),
        }
    }

    async fn disconnect(&self, from: SocketAddr, task: &NetworkTask) {
        let reason = task.property(REASON_KEY).unwrap_or("requested by peer");
        self.registry.disconnect_peer(from, reason).await;
    }

    async fn ping(&self, from: SocketAddr, task: &NetworkTask) {
        if let Some(channel) = self.registry.channel(&from) {
            let text = task.property(MESSAGE_KEY).unwrap_or("Pong");
            channel.load_outgoing(&Packet::PureMessage(text.to_string()));
        }
    }

    async fn authorize(&self, from: SocketAddr, task: &NetworkTask) {
        let target = task
            .property(IDENTIFIER_KEY)
            .and_then(|id| self.registry.find_by_identifier(id));
        match target {
            Some(channel) => {
                self.registry.elevate_peer_permission(channel.peer());
                info!("Authorized {} at request of {}", channel.peer(), from);
            }
            None => warn!("Authorize task from {} names no known peer", from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_task_codec() {
        let task = NetworkTask::new(TaskKind::BlockIp)
            .with(ADDRESS_KEY, "10.0.0.4")
            .to("node-b");
        let decoded = NetworkTask::decode(&task.encode().unwrap()).unwrap();
        assert_eq!(decoded, task);
        assert_eq!(decoded.recipient(), Some("node-b"));
    }

    #[test]
    fn test_signable_bytes_ignore_signature() {
        let task = NetworkTask::new(TaskKind::Ping).to("node-b");
        let signed = task.clone().with(SIGNATURE_KEY, "sig");
        assert_eq!(task.signable_bytes().unwrap(), signed.signable_bytes().unwrap());
        assert_eq!(signed.signature(), Some("sig"));
    }

    #[test]
    fn test_missing_properties_default_to_empty() {
        let task = NetworkTask::decode(br#"{"kind":"Authorize"}"#).unwrap();
        assert_eq!(task.kind, TaskKind::Authorize);
        assert!(task.properties.is_empty());
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<TaskKind>>,
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn block_ip(&self, _from: SocketAddr, task: &NetworkTask) {
            self.seen.lock().push(task.kind);
        }

        async fn authorize(&self, _from: SocketAddr, task: &NetworkTask) {
            self.seen.lock().push(task.kind);
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let recorder = Recorder::default();
        let from: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        for kind in [TaskKind::Ping, TaskKind::BlockIp, TaskKind::Authorize] {
            dispatch_task(&recorder, from, &NetworkTask::new(kind)).await;
        }
        assert_eq!(*recorder.seen.lock(), vec![TaskKind::BlockIp, TaskKind::Authorize]);
    }
}
