//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the WebSocket listener to (0 = auto-assign).
    /// Override: `QUADIO_BIND_PORT`
    pub bind_port: u16,

    /// IP address to advertise to other devices on the LAN.
    /// If not specified, auto-detection will be attempted.
    /// Override: `QUADIO_ADVERTISE_IP`
    pub advertise_ip: Option<IpAddr>,

    /// Directory for staged media files.
    /// Override: `QUADIO_STAGING_DIR`
    pub staging_dir: Option<PathBuf>,

    /// Hard cap on simultaneous guests.
    pub max_guest_slots: usize,

    /// Guests beyond this count are relayed through another peer.
    pub max_direct_data_peers: usize,

    /// Heartbeat timeout (ms) before the host force-closes a guest.
    pub heartbeat_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = quadio_core::EngineConfig::default();
        Self {
            bind_port: 47600,
            advertise_ip: None,
            staging_dir: None,
            max_guest_slots: defaults.max_guest_slots,
            max_direct_data_peers: defaults.max_direct_data_peers,
            heartbeat_timeout_ms: defaults.heartbeat_timeout_ms,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("QUADIO_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("QUADIO_ADVERTISE_IP") {
            if let Ok(ip) = val.parse() {
                self.advertise_ip = Some(ip);
            }
        }

        if let Ok(val) = std::env::var("QUADIO_STAGING_DIR") {
            self.staging_dir = Some(PathBuf::from(val));
        }
    }

    /// Converts to quadio-core's engine configuration.
    pub fn to_engine_config(&self) -> quadio_core::EngineConfig {
        quadio_core::EngineConfig {
            max_guest_slots: self.max_guest_slots,
            max_direct_data_peers: self.max_direct_data_peers,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            staging_dir: self.staging_dir.clone(),
            ..Default::default()
        }
    }
}
