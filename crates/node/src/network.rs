use std::sync::Arc;

use tracing::{info, warn};

use weave_grid::{
    BootstrapResponder, BroadcastRate, ChannelSweep, Discovery, Distribution, LanDiscovery,
    LocalNetworkInfo, LoggingTaskHandler, MulticastDiscovery, PeerDirectory, PortRotation,
    ProbedNetworkInfo, Registry, RegistryConfig, RegistryTaskHandler, Result, RoutineScheduler,
    Signing, StaticNetworkInfo, TaskHandler, WanBootstrap,
};

use crate::config::NodeConfig;

/// Every running component of one overlay node.
pub struct Node {
    registry: Registry,
    distribution: Arc<Distribution>,
    discoveries: Vec<Box<dyn Discovery>>,
    scheduler: RoutineScheduler,
    responder: Option<BootstrapResponder>,
}

impl Node {
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        let network: Box<dyn LocalNetworkInfo> = match config.network.address {
            Some(address) => Box::new(StaticNetworkInfo::new(address, config.network.broadcast)),
            None => Box::new(ProbedNetworkInfo::new()),
        };

        let mut registry_config = RegistryConfig {
            listen_port: config.network.listen_port,
            listen_port_range: config.network.listen_port_range,
            keepalive_interval: config.keepalive_interval(),
            policy: config.trust.clone(),
            ..Default::default()
        };
        if let Some(identifier) = &config.identifier {
            registry_config.identifier = identifier.clone();
        }

        let registry: Registry = Registry::start(registry_config, network.as_ref()).await?;
        registry.run_admission();

        let signing: Option<Signing> = None;
        let handler = task_handler(&registry, signing.as_ref());
        let distribution = Arc::new(Distribution::start(registry.clone(), handler, signing));

        let local = registry.announcement();
        let bounds = config.discovery.rate_bounds();
        let mut discoveries: Vec<Box<dyn Discovery>> = Vec::new();
        let mut rotations = Vec::new();

        if config.discovery.lan {
            let rate = BroadcastRate::new(bounds);
            let (lan, events) = LanDiscovery::new(
                local.clone(),
                registry.local_addresses().broadcast,
                config.discovery.lan_ports.clone(),
                rate.clone(),
            );
            registry.register_rate_control(rate);
            registry.spawn_intake(events);
            rotations.push(lan.active_port());
            discoveries.push(Box::new(lan));
        }

        if config.discovery.multicast {
            let rate = BroadcastRate::new(bounds);
            let (multicast, events) = MulticastDiscovery::new(local.clone(), rate.clone());
            registry.register_rate_control(rate);
            registry.spawn_intake(events);
            rotations.push(multicast.active_port());
            discoveries.push(Box::new(multicast));
        }

        if let Some(endpoint) = config.bootstrap.endpoint {
            let (wan, events) = WanBootstrap::new(endpoint, local.clone(), config.bootstrap.mode.into());
            registry.spawn_intake(events);
            discoveries.push(Box::new(wan));
        }

        for discovery in discoveries.iter_mut() {
            discovery.start().await?;
        }

        let responder = match config.bootstrap.serve {
            Some(addr) => {
                let directory = registry_directory(&registry);
                Some(BootstrapResponder::bind(addr, directory, config.bootstrap.authority_key.clone()).await?)
            }
            None => None,
        };

        let scheduler = RoutineScheduler::new();
        if config.routines.port_rotation && !rotations.is_empty() {
            scheduler.register(Arc::new(PortRotation::new(rotations)));
        }
        scheduler.register(Arc::new(ChannelSweep::new(
            registry.clone(),
            config.sweep_interval(),
            config.inactivity_threshold(),
        )));
        scheduler.start_all();

        info!(
            "Node {} listening on {}:{}",
            registry.identifier(),
            local.address,
            registry.listen_port()
        );

        Ok(Self {
            registry,
            distribution,
            discoveries,
            scheduler,
            responder,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn distribution(&self) -> Arc<Distribution> {
        Arc::clone(&self.distribution)
    }

    pub fn responder(&self) -> Option<&BootstrapResponder> {
        self.responder.as_ref()
    }

    pub fn routines(&self) -> Vec<String> {
        self.scheduler.names()
    }

    pub async fn shutdown(mut self) {
        self.scheduler.stop_all();
        for discovery in self.discoveries.iter_mut() {
            if let Err(e) = discovery.stop().await {
                warn!("Failed to stop discovery: {}", e);
            }
        }
        if let Some(responder) = &self.responder {
            responder.shutdown();
        }
        self.distribution.shutdown();
        self.registry.shutdown().await;
    }
}

/// Handler for peer tasks. Tasks only act on the registry when they are
/// verified, which needs a signer; otherwise they are just logged.
pub fn task_handler(registry: &Registry, signing: Option<&Signing>) -> Arc<dyn TaskHandler> {
    match signing {
        Some(_) => Arc::new(RegistryTaskHandler::new(registry.clone())),
        None => {
            info!("No task signer configured; peer tasks are logged, not applied");
            Arc::new(LoggingTaskHandler)
        }
    }
}

/// Hands out the trusted peers of `registry` to bootstrap requesters.
pub fn registry_directory(registry: &Registry) -> PeerDirectory {
    let registry = registry.clone();
    Arc::new(move || {
        registry
            .peer_snapshot()
            .into_iter()
            .filter(|peer| peer.trusted)
            .map(|peer| peer.announcement())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use weave_grid::task::{dispatch_task, ADDRESS_KEY};
    use weave_grid::{NetworkTask, TaskKind};

    fn loopback_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.network.address = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        config.network.listen_port_range = (56000, 56999);
        config.discovery.lan = false;
        config
    }

    #[tokio::test]
    async fn test_node_starts_without_discovery() {
        let config = loopback_config();
        let node = Node::start(&config).await.unwrap();

        assert!(node.registry().listen_port() >= 56000);
        assert_eq!(node.registry().peer_count(), 0);
        assert_eq!(node.routines(), vec![ChannelSweep::<()>::NAME.to_string()]);
        assert!(node.responder().is_none());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsigned_tasks_cannot_block_addresses() {
        let node = Node::start(&loopback_config()).await.unwrap();
        let registry = node.registry().clone();
        let handler = task_handler(&registry, None);

        let task = NetworkTask::new(TaskKind::BlockIp)
            .with(ADDRESS_KEY, "127.0.0.1")
            .to(registry.identifier());
        dispatch_task(handler.as_ref(), "127.0.0.1:50999".parse().unwrap(), &task).await;

        assert!(registry.policy().read().blocked_ips.is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_node_serves_bootstrap() {
        let mut config = loopback_config();
        config.identifier = Some("bootstrap-node".to_string());
        config.bootstrap.serve = Some("127.0.0.1:0".parse().unwrap());
        config.bootstrap.authority_key = Some("anchor-key".to_string());
        let node = Node::start(&config).await.unwrap();

        let addr = node.responder().unwrap().local_addr();
        let key = weave_grid::bootstrap::request_authority_key(addr).await.unwrap();
        assert_eq!(key, "anchor-key");
        assert_eq!(node.registry().identifier(), "bootstrap-node");

        node.shutdown().await;
    }
}
