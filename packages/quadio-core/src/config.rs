//! Engine configuration.
//!
//! [`EngineConfig`] is the recognized-options envelope for a device. All
//! fields have LAN-sensible defaults; `validate()` rejects values that would
//! break the transfer pipeline at runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{CHUNK_SIZE, HEARTBEAT_TIMEOUT_MS, MAX_GUESTS, MAX_RECOVERY_RETRIES, RECOVERY_BACKOFF_MS};

/// An ICE server entry handed to the transport layer.
///
/// The engine never fetches TURN credentials itself; it is given a static
/// list at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    /// Server URLs (`stun:` / `turn:`).
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Optional custom signalling endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignalingServer {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Configuration for a Quadio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Hard cap on simultaneous guests.
    pub max_guest_slots: usize,

    /// Bytes per media chunk.
    pub chunk_size: usize,

    /// Number of guests served media directly by the host; guests beyond
    /// this threshold are relayed through an upstream peer. 0 relays every
    /// non-host guest.
    pub max_direct_data_peers: usize,

    /// Static ICE server list for the transport layer.
    pub ice_servers: Vec<IceServer>,

    /// Optional custom signalling endpoint.
    pub custom_signaling_server: Option<SignalingServer>,

    /// Ordered recovery backoff schedule (ms).
    pub recovery_backoff_ms: Vec<u64>,

    /// Maximum recovery attempts per stall.
    pub max_recovery_retries: u32,

    /// No inbound heartbeat within this window closes the connection (ms).
    pub heartbeat_timeout_ms: u64,

    /// Apply RTT/2 compensation to sync snaps. Off on LAN.
    pub use_ping_compensation: bool,

    /// Directory for staged media files. `None` uses a per-process private
    /// directory under the system temp dir.
    pub staging_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_guest_slots: MAX_GUESTS,
            chunk_size: CHUNK_SIZE,
            max_direct_data_peers: MAX_GUESTS,
            ice_servers: Vec::new(),
            custom_signaling_server: None,
            recovery_backoff_ms: RECOVERY_BACKOFF_MS.to_vec(),
            max_recovery_retries: MAX_RECOVERY_RETRIES,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            use_ping_compensation: false,
            staging_dir: None,
        }
    }
}

impl EngineConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first value that would cause runtime
    /// issues.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_guest_slots == 0 {
            return Err("max_guest_slots must be >= 1".to_string());
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be >= 1".to_string());
        }
        if self.recovery_backoff_ms.is_empty() {
            return Err("recovery_backoff_ms must not be empty".to_string());
        }
        if self.max_recovery_retries as usize > self.recovery_backoff_ms.len() {
            return Err(format!(
                "max_recovery_retries ({}) exceeds backoff schedule length ({})",
                self.max_recovery_retries,
                self.recovery_backoff_ms.len()
            ));
        }
        if self.heartbeat_timeout_ms < 2_000 {
            return Err("heartbeat_timeout_ms must be >= 2000 (heartbeats are sent at 1 Hz)".to_string());
        }
        Ok(())
    }
}
