//! Outbound and inbound payload queues.
//!
//! Four workers, each fed by its own mpsc queue:
//!
//! - outbound data: frame once, push to every trusted channel
//! - inbound data: File payloads go to the content store, Task payloads are
//!   decoded and passed to the inbound task queue
//! - outbound tasks: resolve `Recipient`, optionally countersign, send
//! - inbound tasks: with signing configured, verify against the trust anchor
//!   (and refuse everything until one is known), then dispatch to the
//!   [`TaskHandler`]

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use weave_storage::{ContentStore, PayloadFormat};

use crate::channel::ChannelContext;
use crate::collab::{SigningLedger, TaskSigner};
use crate::error::{GridError, Result};
use crate::event::InboundData;
use crate::registry::Registry;
use crate::task::{dispatch_task, NetworkTask, TaskHandler, SIGNATURE_KEY};
use crate::wire::{DataPayload, Packet, MAX_MESSAGE_SIZE};

const RECEIVED_CAPACITY: usize = 256;

/// Countersigning of outbound tasks and verification of inbound ones.
#[derive(Clone)]
pub struct Signing {
    pub signer: Arc<dyn TaskSigner>,
    pub ledger: Arc<dyn SigningLedger>,
}

pub struct Distribution<C: ChannelContext = ()> {
    registry: Registry<C>,
    store: ContentStore,
    outbound_data: mpsc::UnboundedSender<DataPayload>,
    outbound_tasks: mpsc::UnboundedSender<NetworkTask>,
    inbound_data: mpsc::UnboundedSender<InboundData>,
    received: broadcast::Sender<InboundData>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: ChannelContext> Distribution<C> {
    /// Attach to `registry` as its data sink and spawn the workers.
    pub fn start(
        registry: Registry<C>,
        handler: Arc<dyn TaskHandler>,
        signing: Option<Signing>,
    ) -> Self {
        let store = ContentStore::new();
        let (outbound_data, outbound_data_rx) = mpsc::unbounded_channel();
        let (outbound_tasks, outbound_tasks_rx) = mpsc::unbounded_channel();
        let (inbound_data, inbound_data_rx) = mpsc::unbounded_channel();
        let (inbound_tasks, inbound_tasks_rx) = mpsc::unbounded_channel();
        let (received, _) = broadcast::channel(RECEIVED_CAPACITY);

        registry.set_data_sink(inbound_data.clone());

        let workers = vec![
            tokio::spawn(run_outbound_data(registry.clone(), outbound_data_rx)),
            tokio::spawn(run_inbound_data(
                inbound_data_rx,
                store.clone(),
                received.clone(),
                inbound_tasks,
            )),
            tokio::spawn(run_outbound_tasks(
                registry.clone(),
                outbound_tasks_rx,
                signing.clone(),
            )),
            tokio::spawn(run_inbound_tasks(
                registry.clone(),
                inbound_tasks_rx,
                handler,
                signing,
            )),
        ];

        info!("Distribution workers started");
        Self {
            registry,
            store,
            outbound_data,
            outbound_tasks,
            inbound_data,
            received,
            workers: Mutex::new(workers),
        }
    }

    /// Send a payload to every trusted peer.
    ///
    /// Payloads whose frame would exceed [`MAX_MESSAGE_SIZE`] are refused
    /// here; peers would discard them unread.
    pub fn queue_data_for_distribution(&self, payload: DataPayload) -> Result<()> {
        payload.check_size()?;
        self.outbound_data
            .send(payload)
            .map_err(|_| GridError::ChannelClosed)
    }

    /// Read a file and distribute it as a File payload. Returns its size.
    pub async fn distribute_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let len = tokio::fs::metadata(path).await?.len() as usize;
        let framed = DataPayload::framed_len(PayloadFormat::File, len);
        if framed > MAX_MESSAGE_SIZE {
            return Err(GridError::PayloadTooLarge {
                size: framed,
                limit: MAX_MESSAGE_SIZE,
            });
        }
        let content = tokio::fs::read(path).await?;
        let size = content.len();
        info!("Distributing {} ({} bytes)", path.display(), size);
        self.queue_data_for_distribution(DataPayload::new(PayloadFormat::File, content))?;
        Ok(size)
    }

    /// Send a task to the trusted peer named by its `Recipient` property.
    pub fn queue_task(&self, task: NetworkTask) -> Result<()> {
        if task.recipient().is_none() {
            return Err(GridError::Protocol("task has no Recipient".to_string()));
        }
        self.outbound_tasks
            .send(task)
            .map_err(|_| GridError::ChannelClosed)
    }

    /// Inject a payload as if a peer had sent it.
    pub fn ingest(&self, data: InboundData) {
        let _ = self.inbound_data.send(data);
    }

    /// Every payload accepted by the inbound data worker.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundData> {
        self.received.subscribe()
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.store
    }

    pub fn registry(&self) -> &Registry<C> {
        &self.registry
    }

    pub fn shutdown(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        info!("Distribution workers stopped");
    }
}

async fn run_outbound_data<C: ChannelContext>(
    registry: Registry<C>,
    mut queue: mpsc::UnboundedReceiver<DataPayload>,
) {
    while let Some(payload) = queue.recv().await {
        let frame = match Packet::DataTransmission(payload).to_wire() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to frame outbound payload: {}", e);
                continue;
            }
        };

        let trusted = registry.trusted_channels();
        if trusted.is_empty() {
            debug!("No trusted peers; outbound payload dropped");
            continue;
        }
        for channel in &trusted {
            channel.load_frame(frame.clone());
        }
        debug!("Queued payload for {} trusted peers", trusted.len());
    }
}

async fn run_inbound_data(
    mut queue: mpsc::UnboundedReceiver<InboundData>,
    store: ContentStore,
    received: broadcast::Sender<InboundData>,
    tasks: mpsc::UnboundedSender<(SocketAddr, NetworkTask)>,
) {
    while let Some(data) = queue.recv().await {
        let from = data.from;
        match data.payload.format {
            PayloadFormat::File => {
                let index = store.append(PayloadFormat::File, &data.payload.content);
                debug!(
                    "Stored {} byte file from {} at index {}",
                    data.payload.content.len(),
                    from,
                    index
                );
            }
            PayloadFormat::Task => match NetworkTask::decode(&data.payload.content) {
                Ok(task) => {
                    let _ = tasks.send((from, task));
                }
                Err(e) => {
                    warn!("Undecodable task from {}: {}", from, e);
                    continue;
                }
            },
        }
        let _ = received.send(data);
    }
}

async fn run_outbound_tasks<C: ChannelContext>(
    registry: Registry<C>,
    mut queue: mpsc::UnboundedReceiver<NetworkTask>,
    signing: Option<Signing>,
) {
    while let Some(task) = queue.recv().await {
        let recipient = task.recipient().unwrap_or_default().to_string();
        let channel = match registry.find_by_identifier(&recipient) {
            Some(channel) if channel.is_trusted() => channel,
            _ => {
                warn!("No trusted peer {}; {:?} task dropped", recipient, task.kind);
                continue;
            }
        };

        let task = match &signing {
            Some(signing) => match countersign(task, signing) {
                Ok(task) => task,
                Err(e) => {
                    warn!("Failed to sign task for {}: {}", recipient, e);
                    continue;
                }
            },
            None => task,
        };

        match task.encode() {
            Ok(content) => {
                channel.load_outgoing(&Packet::DataTransmission(DataPayload::new(
                    PayloadFormat::Task,
                    content,
                )));
                debug!("Sent {:?} task to {}", task.kind, recipient);
            }
            Err(e) => warn!("Failed to encode task for {}: {}", recipient, e),
        }
    }
}

fn countersign(task: NetworkTask, signing: &Signing) -> Result<NetworkTask> {
    let content = task.signable_bytes()?;
    let signature = signing.signer.clear_sign(&content)?;
    signing
        .ledger
        .record_signing(&blake3::hash(&content), &signature);
    Ok(task.with(SIGNATURE_KEY, signature))
}

async fn run_inbound_tasks<C: ChannelContext>(
    registry: Registry<C>,
    mut queue: mpsc::UnboundedReceiver<(SocketAddr, NetworkTask)>,
    handler: Arc<dyn TaskHandler>,
    signing: Option<Signing>,
) {
    while let Some((from, task)) = queue.recv().await {
        if let Some(signing) = &signing {
            let Some(anchor) = registry.authority_key() else {
                warn!("Rejected {:?} task from {}: no trust anchor yet", task.kind, from);
                continue;
            };
            if !verify(&task, signing, &anchor) {
                warn!("Rejected unverified {:?} task from {}", task.kind, from);
                continue;
            }
        }
        dispatch_task(handler.as_ref(), from, &task).await;
    }
}

fn verify(task: &NetworkTask, signing: &Signing, anchor: &str) -> bool {
    let Some(signature) = task.signature() else {
        return false;
    };
    match task.signable_bytes() {
        Ok(content) => signing.signer.verify(&content, signature, anchor),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{MemoryLedger, StaticNetworkInfo};
    use crate::registry::RegistryConfig;
    use crate::task::{TaskKind, RECIPIENT_KEY};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    /// Signature is the key followed by the content hash.
    struct KeyedSigner {
        key: String,
    }

    impl TaskSigner for KeyedSigner {
        fn clear_sign(&self, content: &[u8]) -> Result<String> {
            Ok(format!("{}:{}", self.key, blake3::hash(content).to_hex()))
        }

        fn verify(&self, content: &[u8], signature: &str, public_key: &str) -> bool {
            signature == format!("{}:{}", public_key, blake3::hash(content).to_hex())
        }
    }

    struct Forward(mpsc::UnboundedSender<NetworkTask>);

    #[async_trait]
    impl TaskHandler for Forward {
        async fn ping(&self, _from: SocketAddr, task: &NetworkTask) {
            let _ = self.0.send(task.clone());
        }
    }

    async fn registry() -> Registry {
        let config = RegistryConfig {
            listen_port: Some(0),
            ..RegistryConfig::default()
        };
        Registry::start(config, &StaticNetworkInfo::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None))
            .await
            .unwrap()
    }

    fn from() -> SocketAddr {
        "127.0.0.1:50999".parse().unwrap()
    }

    fn task_payload(task: &NetworkTask) -> DataPayload {
        DataPayload::new(PayloadFormat::Task, task.encode().unwrap())
    }

    #[tokio::test]
    async fn test_file_payload_is_stored_and_published() {
        let distribution = Distribution::start(registry().await, Arc::new(crate::task::LoggingTaskHandler), None);
        let mut received = distribution.subscribe();

        distribution.ingest(InboundData {
            from: from(),
            payload: DataPayload::new(PayloadFormat::File, b"file body".to_vec()),
        });

        let data = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.payload.content, b"file body");
        assert_eq!(
            distribution.content_store().read_by_index(0).unwrap(),
            b"file body"
        );
        distribution.shutdown();
    }

    #[tokio::test]
    async fn test_task_payload_reaches_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let distribution = Distribution::start(registry().await, Arc::new(Forward(tx)), None);

        let task = NetworkTask::new(TaskKind::Ping).to("me");
        distribution.ingest(InboundData {
            from: from(),
            payload: task_payload(&task),
        });

        let handled = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handled, task);
        assert!(distribution.content_store().is_empty());
    }

    #[tokio::test]
    async fn test_unsigned_task_rejected_once_anchor_known() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = registry().await;
        registry.set_authority_key("anchor".to_string());
        let signing = Signing {
            signer: Arc::new(KeyedSigner {
                key: "anchor".to_string(),
            }),
            ledger: Arc::new(MemoryLedger::new()),
        };
        let distribution = Distribution::start(registry, Arc::new(Forward(tx)), Some(signing.clone()));

        let unsigned = NetworkTask::new(TaskKind::Ping).with(crate::task::MESSAGE_KEY, "unsigned");
        let signed = countersign(
            NetworkTask::new(TaskKind::Ping).with(crate::task::MESSAGE_KEY, "signed"),
            &signing,
        )
        .unwrap();

        for task in [&unsigned, &signed] {
            distribution.ingest(InboundData {
                from: from(),
                payload: task_payload(task),
            });
        }

        let handled = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handled, signed);
    }

    #[tokio::test]
    async fn test_signed_distribution_waits_for_anchor() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = registry().await;
        let signing = Signing {
            signer: Arc::new(KeyedSigner {
                key: "anchor".to_string(),
            }),
            ledger: Arc::new(MemoryLedger::new()),
        };
        let distribution = Distribution::start(registry.clone(), Arc::new(Forward(tx)), Some(signing.clone()));

        let early = countersign(
            NetworkTask::new(TaskKind::Ping).with(crate::task::MESSAGE_KEY, "early"),
            &signing,
        )
        .unwrap();
        distribution.ingest(InboundData {
            from: from(),
            payload: task_payload(&early),
        });
        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());

        registry.set_authority_key("anchor".to_string());
        distribution.ingest(InboundData {
            from: from(),
            payload: task_payload(&early),
        });
        let handled = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handled, early);
    }

    #[test]
    fn test_countersign_records_ledger_entry() {
        let ledger = MemoryLedger::new();
        let signing = Signing {
            signer: Arc::new(KeyedSigner {
                key: "k".to_string(),
            }),
            ledger: Arc::new(ledger.clone()),
        };
        let task = NetworkTask::new(TaskKind::Authorize).to("peer");
        let signed = countersign(task.clone(), &signing).unwrap();

        let records = ledger.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, blake3::hash(&task.signable_bytes().unwrap()));
        assert_eq!(signed.signature(), Some(records[0].1.as_str()));
        assert!(verify(&signed, &signing, "k"));
    }

    #[tokio::test]
    async fn test_task_without_recipient_is_refused() {
        let distribution = Distribution::start(registry().await, Arc::new(crate::task::LoggingTaskHandler), None);
        let mut task = NetworkTask::new(TaskKind::Ping).to("x");
        task.properties.remove(RECIPIENT_KEY);
        assert!(matches!(distribution.queue_task(task), Err(GridError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_refused() {
        let distribution = Distribution::start(registry().await, Arc::new(crate::task::LoggingTaskHandler), None);
        let payload = DataPayload::new(PayloadFormat::File, vec![1u8; MAX_MESSAGE_SIZE]);
        assert!(matches!(
            distribution.queue_data_for_distribution(payload),
            Err(GridError::PayloadTooLarge { .. })
        ));
        assert!(distribution
            .queue_data_for_distribution(DataPayload::new(PayloadFormat::File, b"small".to_vec()))
            .is_ok());
        distribution.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_file_is_refused_before_reading() {
        let distribution = Distribution::start(registry().await, Arc::new(crate::task::LoggingTaskHandler), None);
        let path = std::env::temp_dir().join(format!("weave-oversized-{}", uuid::Uuid::new_v4()));
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(MAX_MESSAGE_SIZE as u64).unwrap();
        drop(file);

        let result = distribution.distribute_file(&path).await;
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(GridError::PayloadTooLarge { limit: MAX_MESSAGE_SIZE, .. })));
        distribution.shutdown();
    }
}
