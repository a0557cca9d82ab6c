pub mod bootstrap;
pub mod channel;
pub mod collab;
pub mod discovery;
pub mod distribution;
pub mod error;
pub mod event;
pub mod handshake;
pub mod peer;
pub mod policy;
pub mod rate;
pub mod registry;
pub mod routine;
pub mod task;
pub mod wire;

pub use bootstrap::{BootstrapMode, BootstrapResponder, PeerDirectory, WanBootstrap};
pub use channel::{ChannelContext, ChannelState, PeerChannel};
pub use collab::{
    LocalAddresses, LocalNetworkInfo, MemoryLedger, ProbedNetworkInfo, SigningLedger,
    StaticNetworkInfo, TaskSigner,
};
pub use discovery::{
    ActivePort, Discovery, DiscoveryEvent, DiscoverySource, LanDiscovery, MulticastDiscovery,
};
pub use distribution::{Distribution, Signing};
pub use error::{GridError, Result};
pub use event::{InboundData, PeerEvent};
pub use handshake::{HandshakeState, TrustHandshake};
pub use peer::{
    generate_identifier, DisconnectNotice, PeerAnnouncement, PeerGroup, PeerIdentity, PeerSummary,
};
pub use policy::{InboundPlacement, TrustPolicy};
pub use rate::{BroadcastRate, RateBounds};
pub use registry::{Admission, PendingConnection, Registry, RegistryConfig};
pub use routine::{ChannelSweep, PortRotation, Routine, RoutineScheduler};
pub use task::{LoggingTaskHandler, NetworkTask, RegistryTaskHandler, TaskHandler, TaskKind};
pub use wire::{DataPayload, FrameBuffer, Packet, PacketKind, WireCodec};
pub use weave_storage::{ContentStore, PayloadFormat};
