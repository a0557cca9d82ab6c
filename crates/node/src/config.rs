use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use weave_grid::registry::LISTEN_PORT_RANGE;
use weave_grid::{BootstrapMode, RateBounds, TrustPolicy};

const CONFIG_FILE: &str = "weaved.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Static local address; probed when absent.
    pub address: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    pub listen_port: Option<u16>,
    pub listen_port_range: (u16, u16),
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            address: None,
            broadcast: None,
            listen_port: None,
            listen_port_range: LISTEN_PORT_RANGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub lan: bool,
    pub lan_ports: Vec<u16>,
    pub multicast: bool,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let bounds = RateBounds::default();
        Self {
            lan: true,
            lan_ports: vec![45670, 45671, 45672],
            multicast: false,
            min_interval_ms: bounds.min_interval.as_millis() as u64,
            max_interval_ms: bounds.max_interval.as_millis() as u64,
        }
    }
}

impl DiscoverySection {
    pub fn rate_bounds(&self) -> RateBounds {
        RateBounds {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapKind {
    #[default]
    Peers,
    Authority,
}

impl From<BootstrapKind> for BootstrapMode {
    fn from(kind: BootstrapKind) -> Self {
        match kind {
            BootstrapKind::Peers => BootstrapMode::Peers,
            BootstrapKind::Authority => BootstrapMode::Authority,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSection {
    /// WAN bootstrap server to ask for peers or the authority key.
    pub endpoint: Option<SocketAddr>,
    pub mode: BootstrapKind,
    /// Also answer bootstrap requests on this address.
    pub serve: Option<SocketAddr>,
    /// Key handed out to authority requests when serving.
    pub authority_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutineSection {
    pub sweep_interval_secs: u64,
    pub inactivity_secs: u64,
    /// Ping cadence on trusted channels; below `inactivity_secs`.
    pub keepalive_secs: u64,
    pub port_rotation: bool,
    pub status_interval_secs: u64,
}

impl Default for RoutineSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            inactivity_secs: 15 * 60,
            keepalive_secs: 60,
            port_rotation: true,
            status_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identifier; generated per run when absent.
    pub identifier: Option<String>,
    pub network: NetworkSection,
    pub discovery: DiscoverySection,
    pub bootstrap: BootstrapSection,
    pub trust: TrustPolicy,
    pub routines: RoutineSection,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub identifier: Option<String>,
    pub address: Option<IpAddr>,
    pub listen_port: Option<u16>,
    pub lan_ports: Option<Vec<u16>>,
    pub multicast: bool,
    pub no_lan: bool,
    pub bootstrap: Option<SocketAddr>,
    pub authority: bool,
    pub serve_bootstrap: Option<SocketAddr>,
}

pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "weave", "weaved").map(|d| d.config_dir().join(CONFIG_FILE))
}

impl NodeConfig {
    /// Load from `path`, or from the per-user config directory when no path
    /// is given. A missing default file yields the defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::parse(&text).map_err(|source| ConfigError::Parse { path, source })?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if overrides.identifier.is_some() {
            self.identifier = overrides.identifier;
        }
        if overrides.address.is_some() {
            self.network.address = overrides.address;
        }
        if overrides.listen_port.is_some() {
            self.network.listen_port = overrides.listen_port;
        }
        if let Some(ports) = overrides.lan_ports {
            self.discovery.lan_ports = ports;
        }
        if overrides.multicast {
            self.discovery.multicast = true;
        }
        if overrides.no_lan {
            self.discovery.lan = false;
        }
        if overrides.bootstrap.is_some() {
            self.bootstrap.endpoint = overrides.bootstrap;
        }
        if overrides.authority {
            self.bootstrap.mode = BootstrapKind::Authority;
        }
        if overrides.serve_bootstrap.is_some() {
            self.bootstrap.serve = overrides.serve_bootstrap;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (lo, hi) = self.network.listen_port_range;
        if lo == 0 || lo > hi {
            return Err(ConfigError::Invalid(format!(
                "listen_port_range {}..{} is empty",
                lo, hi
            )));
        }
        if self.discovery.lan && self.discovery.lan_ports.is_empty() {
            return Err(ConfigError::Invalid(
                "LAN discovery needs at least one port".to_string(),
            ));
        }
        if self.discovery.min_interval_ms == 0
            || self.discovery.min_interval_ms > self.discovery.max_interval_ms
        {
            return Err(ConfigError::Invalid(
                "broadcast intervals must satisfy 0 < min <= max".to_string(),
            ));
        }
        if self.routines.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep interval must be positive".to_string()));
        }
        if self.routines.keepalive_secs == 0
            || self.routines.keepalive_secs >= self.routines.inactivity_secs
        {
            return Err(ConfigError::Invalid(format!(
                "keepalive_secs must be positive and below inactivity_secs ({})",
                self.routines.inactivity_secs
            )));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.routines.sweep_interval_secs)
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.routines.inactivity_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.routines.keepalive_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_grid::InboundPlacement;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert!(config.identifier.is_none());
        assert!(config.discovery.lan);
        assert!(!config.discovery.multicast);
        assert_eq!(config.network.listen_port_range, LISTEN_PORT_RANGE);
        assert_eq!(config.discovery.rate_bounds(), RateBounds::default());
        assert_eq!(config.inactivity_threshold(), Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let text = r#"
identifier = "node-a"

[network]
address = "192.168.1.20"
listen_port_range = [52000, 52100]

[discovery]
multicast = true
lan_ports = [41000]

[bootstrap]
endpoint = "203.0.113.5:45600"
mode = "authority"

[trust]
enhanced_exchange = true
inbound_placement = "both"
blocked_ips = ["10.0.0.9"]

[routines]
inactivity_secs = 120
"#;
        let config = NodeConfig::parse(text).unwrap();
        assert_eq!(config.identifier.as_deref(), Some("node-a"));
        assert_eq!(config.network.address, Some("192.168.1.20".parse().unwrap()));
        assert_eq!(config.network.listen_port_range, (52000, 52100));
        assert!(config.discovery.multicast);
        assert!(config.discovery.lan);
        assert_eq!(config.discovery.lan_ports, vec![41000]);
        assert_eq!(config.bootstrap.mode, BootstrapKind::Authority);
        assert_eq!(BootstrapMode::from(config.bootstrap.mode), BootstrapMode::Authority);
        assert!(config.trust.enhanced_exchange);
        assert!(config.trust.default_communication);
        assert_eq!(config.trust.inbound_placement, InboundPlacement::Both);
        assert!(config.trust.is_blocked_ip(&"10.0.0.9".parse().unwrap()));
        assert_eq!(config.inactivity_threshold(), Duration::from_secs(120));
        assert_eq!(config.routines.sweep_interval_secs, 60);
    }

    #[test]
    fn test_overrides_win() {
        let mut config = NodeConfig::parse("[discovery]\nlan_ports = [1, 2]\n").unwrap();
        config.apply(Overrides {
            listen_port: Some(53001),
            lan_ports: Some(vec![41500, 41501]),
            no_lan: true,
            authority: true,
            ..Default::default()
        });
        assert_eq!(config.network.listen_port, Some(53001));
        assert_eq!(config.discovery.lan_ports, vec![41500, 41501]);
        assert!(!config.discovery.lan);
        assert_eq!(config.bootstrap.mode, BootstrapKind::Authority);
        assert!(config.bootstrap.endpoint.is_none());
    }

    #[test]
    fn test_validation() {
        let mut config = NodeConfig::default();
        config.network.listen_port_range = (60000, 50000);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = NodeConfig::default();
        config.discovery.min_interval_ms = 20_000;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.discovery.lan_ports.clear();
        assert!(config.validate().is_err());
        config.discovery.lan = false;
        assert!(config.validate().is_ok());

        let mut config = NodeConfig::default();
        config.routines.inactivity_secs = 60;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.routines.keepalive_secs = 20;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_explicit_file() {
        let path = std::env::temp_dir().join("weaved-missing-config.toml");
        assert!(matches!(
            NodeConfig::load(Some(&path)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_rendered_config_parses_back() {
        let mut config = NodeConfig::default();
        config.bootstrap.serve = Some("0.0.0.0:45600".parse().unwrap());
        let text = config.to_toml().unwrap();
        let parsed = NodeConfig::parse(&text).unwrap();
        assert_eq!(parsed.bootstrap, config.bootstrap);
        assert_eq!(parsed.discovery, config.discovery);
    }
}
