use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::ChannelContext;
use crate::discovery::ActivePort;
use crate::error::{GridError, Result};
use crate::registry::Registry;

/// Periodic maintenance job. `interval` is consulted before every run, so a
/// routine may vary its own period.
#[async_trait]
pub trait Routine: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn interval(&self) -> Duration;
    async fn run_once(&self);
}

/// Named routines, each started and stopped independently.
#[derive(Default)]
pub struct RoutineScheduler {
    routines: DashMap<String, Arc<dyn Routine>>,
    running: DashMap<String, JoinHandle<()>>,
}

impl RoutineScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when a routine with the same name already exists.
    pub fn register(&self, routine: Arc<dyn Routine>) -> bool {
        let name = routine.name().to_string();
        if self.routines.contains_key(&name) {
            return false;
        }
        self.routines.insert(name, routine);
        true
    }

    pub fn start(&self, name: &str) -> Result<()> {
        let routine = self
            .routines
            .get(name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| GridError::UnknownRoutine(name.to_string()))?;

        if self.is_running(name) {
            return Ok(());
        }

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(routine.interval()).await;
                debug!("Running routine {}", routine.name());
                routine.run_once().await;
            }
        });
        if let Some(previous) = self.running.insert(name.to_string(), handle) {
            previous.abort();
        }
        info!("Routine {} started", name);
        Ok(())
    }

    /// Returns whether the routine was running.
    pub fn stop(&self, name: &str) -> bool {
        match self.running.remove(name) {
            Some((_, handle)) => {
                handle.abort();
                info!("Routine {} stopped", name);
                true
            }
            None => false,
        }
    }

    pub fn start_all(&self) {
        let names: Vec<String> = self.routines.iter().map(|r| r.key().clone()).collect();
        for name in names {
            // Registered names always resolve.
            let _ = self.start(&name);
        }
    }

    pub fn stop_all(&self) {
        let names: Vec<String> = self.running.iter().map(|r| r.key().clone()).collect();
        for name in names {
            self.stop(&name);
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running
            .get(name)
            .map(|h| !h.value().is_finished())
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routines.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }
}

impl Drop for RoutineScheduler {
    fn drop(&mut self) {
        for entry in self.running.iter() {
            entry.value().abort();
        }
    }
}

const ROTATION_MIN_SECS: u64 = 180;
const ROTATION_MAX_SECS: u64 = 300;

/// Moves discovery broadcasters to a different designated port every 3 to 5
/// minutes.
pub struct PortRotation {
    ports: Vec<ActivePort>,
}

impl PortRotation {
    pub const NAME: &'static str = "port-rotation";

    pub fn new(ports: Vec<ActivePort>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl Routine for PortRotation {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(rand::thread_rng().gen_range(ROTATION_MIN_SECS..=ROTATION_MAX_SECS))
    }

    async fn run_once(&self) {
        for ports in &self.ports {
            let port = ports.rotate();
            debug!("Broadcast port rotated to {}", port);
        }
    }
}

/// Drops idle channels and promotes channels whose ping count qualifies them
/// for trust.
pub struct ChannelSweep<C: ChannelContext = ()> {
    registry: Registry<C>,
    every: Duration,
    inactivity: Duration,
}

impl<C: ChannelContext> ChannelSweep<C> {
    pub const NAME: &'static str = "channel-sweep";

    pub fn new(registry: Registry<C>, every: Duration, inactivity: Duration) -> Self {
        Self {
            registry,
            every,
            inactivity,
        }
    }

    /// Returns (removed, promoted).
    pub fn sweep(&self) -> (usize, usize) {
        let mut removed = 0;
        let mut promoted = 0;
        for channel in self.registry.channels() {
            if channel.idle_for() > self.inactivity {
                if self.registry.remove_peer(channel.peer()) {
                    info!("Removed inactive peer {}", channel.peer());
                    removed += 1;
                }
            } else if !channel.is_trusted()
                && channel.ready_for_trust()
                && self.registry.elevate_peer_permission(channel.peer())
            {
                promoted += 1;
            }
        }
        (removed, promoted)
    }
}

#[async_trait]
impl<C: ChannelContext> Routine for ChannelSweep<C> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn run_once(&self) {
        let (removed, promoted) = self.sweep();
        if removed > 0 || promoted > 0 {
            debug!("Sweep removed {} and promoted {} peers", removed, promoted);
        }
    }
}
