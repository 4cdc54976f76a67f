//! Configuration handling for the RINA transport service.
//!
//! Settings come from the `rina:` section of the shared config file, then
//! environment variables, then command-line flags (applied in `main`).

use anyhow::{Context, Result};
use rina_transport::{ListenerConfig, TransportConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Service configuration
#[derive(Debug, Clone)]
pub struct RinaServiceConfig {
    /// Local application name registered with the fabric
    pub local_app: String,
    /// DIF to register in; any DIF when unset
    pub dif: Option<String>,
    /// Peer applications pinged with OPTIONS
    pub peers: Vec<String>,
    /// Interval between OPTIONS pings; zero disables pinging
    pub ping_interval: Duration,
    /// Transport settings shared by every listener
    pub transport: TransportConfig,
}

impl Default for RinaServiceConfig {
    fn default() -> Self {
        Self {
            local_app: "sip.rina".to_string(),
            dif: None,
            peers: Vec::new(),
            ping_interval: Duration::from_secs(30),
            transport: TransportConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    rina: Option<RinaSection>,
}

#[derive(Debug, Default, Deserialize)]
struct RinaSection {
    local_app: Option<String>,
    dif: Option<String>,
    peers: Option<Vec<String>>,
    ping_interval: Option<String>,
    keepalive_interval: Option<String>,
    delayed_send_timeout: Option<String>,
    fast_buffer_size: Option<usize>,
    max_message_size: Option<usize>,
}

impl RinaServiceConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                if let Some(section) = root.rina {
                    config.apply_section(section)?;
                }
                info!("Loaded configuration from {:?}", path);
            }
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_section(&mut self, section: RinaSection) -> Result<()> {
        if let Some(local_app) = section.local_app {
            self.local_app = local_app;
        }
        if section.dif.is_some() {
            self.dif = section.dif;
        }
        if let Some(peers) = section.peers {
            self.peers = peers;
        }
        if let Some(value) = section.ping_interval {
            self.ping_interval = parse_duration("ping_interval", &value)?;
        }
        if let Some(value) = section.keepalive_interval {
            self.transport.keepalive_interval = parse_duration("keepalive_interval", &value)?;
        }
        if let Some(value) = section.delayed_send_timeout {
            self.transport.delayed_send_timeout = parse_duration("delayed_send_timeout", &value)?;
        }
        if let Some(size) = section.fast_buffer_size {
            self.transport.fast_buffer_size = size;
        }
        if let Some(size) = section.max_message_size {
            self.transport.max_message_size = size;
        }
        Ok(())
    }

    /// Apply `RINA_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(local_app) = lookup("RINA_LOCAL_APP") {
            info!("Local application overridden by environment: {}", local_app);
            self.local_app = local_app;
        }

        if let Some(dif) = lookup("RINA_DIF") {
            info!("DIF overridden by environment: {}", dif);
            self.dif = (!dif.is_empty()).then_some(dif);
        }

        if let Some(value) = lookup("RINA_KEEPALIVE_INTERVAL") {
            self.transport.keepalive_interval =
                parse_duration("RINA_KEEPALIVE_INTERVAL", &value)?;
            info!("Keep-alive interval overridden by environment: {}", value);
        }

        if let Some(peers) = lookup("RINA_PEERS") {
            self.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
            info!("Peers overridden by environment: {:?}", self.peers);
        }

        Ok(())
    }

    /// Listener settings for the local application
    pub fn listener_config(&self) -> ListenerConfig {
        self.listener_config_for(&self.local_app)
    }

    /// Listener settings for another application in the same DIF
    pub fn listener_config_for(&self, app: &str) -> ListenerConfig {
        let config = ListenerConfig::new(app).with_transport(self.transport.clone());
        match &self.dif {
            Some(dif) => config.with_dif(dif.clone()),
            None => config,
        }
    }
}

/// Accepts humantime strings ("90s", "1m 30s") and bare seconds
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value.trim())
        .with_context(|| format!("Invalid duration for {}: {:?}", key, value))
}
