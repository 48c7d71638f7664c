//! mDNS session signalling.
//!
//! The host advertises `_quadio._tcp.local.` with the 6-digit session code
//! in a TXT record; guests resolve a typed-in code to the host's socket
//! address without any external signalling server. Best-effort: failure is
//! logged but never prevents a session from running (guests can still be
//! given the address directly).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::{EngineError, EngineResult};
use crate::protocol_constants::MDNS_SERVICE_TYPE;

const TXT_CODE_KEY: &str = "code";
const TXT_PEER_KEY: &str = "peer";

/// Service type under which relay-capable peers advertise their own
/// listener, so ASSIGN_DATA_SOURCE targets can be dialed by peer id.
pub const MDNS_PEER_SERVICE_TYPE: &str = "_quadio-peer._tcp.local.";

/// Advertises a host session (or a relay-capable peer) via mDNS/DNS-SD.
///
/// Registered on creation, unregistered on drop.
pub struct SessionAdvertiser {
    daemon: ServiceDaemon,
    service_fullname: String,
    shutdown_called: AtomicBool,
}

impl SessionAdvertiser {
    /// Advertises a host session under its 6-digit code.
    ///
    /// # Errors
    ///
    /// The mDNS daemon could not start or the service could not register
    /// (e.g. mDNS unavailable on the system).
    pub fn for_session(
        session_code: &str,
        advertise_ip: IpAddr,
        port: u16,
    ) -> Result<Self, mdns_sd::Error> {
        Self::register(MDNS_SERVICE_TYPE, TXT_CODE_KEY, session_code, advertise_ip, port)
    }

    /// Advertises this device's own listener so downstream relay dials can
    /// resolve its peer id.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`SessionAdvertiser::for_session`].
    pub fn for_peer(peer_id: &str, advertise_ip: IpAddr, port: u16) -> Result<Self, mdns_sd::Error> {
        Self::register(MDNS_PEER_SERVICE_TYPE, TXT_PEER_KEY, peer_id, advertise_ip, port)
    }

    fn register(
        service_type: &str,
        txt_key: &str,
        txt_value: &str,
        advertise_ip: IpAddr,
        port: u16,
    ) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let instance_name = format!("Quadio {hostname} {txt_value}");

        let dns_hostname = hostname
            .to_lowercase()
            .replace(' ', "-")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect::<String>();

        let mut txt = HashMap::new();
        txt.insert(txt_key.to_string(), txt_value.to_string());
        txt.insert("ws_path".to_string(), "/ws".to_string());
        txt.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let service = ServiceInfo::new(
            service_type,
            &instance_name,
            &format!("{dns_hostname}.local."),
            advertise_ip,
            port,
            Some(txt),
        )?;

        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;

        log::info!("[mDNS] Advertising {txt_key}={txt_value} at {advertise_ip}:{port}");

        Ok(Self {
            daemon,
            service_fullname: fullname,
            shutdown_called: AtomicBool::new(false),
        })
    }

    /// Unregisters the advertisement. Safe to call twice.
    pub fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.daemon.unregister(&self.service_fullname) {
            log::warn!("[mDNS] Failed to unregister service: {e}");
        }
    }
}

impl Drop for SessionAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolves a typed-in session code to the advertising host's address.
///
/// # Errors
///
/// [`EngineError::HostUnreachable`] when no matching advertisement shows
/// up within `timeout`.
pub async fn resolve_code(code: &str, timeout: Duration) -> EngineResult<SocketAddr> {
    resolve(MDNS_SERVICE_TYPE, TXT_CODE_KEY, code, timeout).await
}

/// Resolves an ASSIGN_DATA_SOURCE target peer id to its listener address.
///
/// # Errors
///
/// [`EngineError::HostUnreachable`] when the peer is not advertising.
pub async fn resolve_peer(peer_id: &str, timeout: Duration) -> EngineResult<SocketAddr> {
    resolve(MDNS_PEER_SERVICE_TYPE, TXT_PEER_KEY, peer_id, timeout).await
}

async fn resolve(
    service_type: &str,
    txt_key: &str,
    txt_value: &str,
    timeout: Duration,
) -> EngineResult<SocketAddr> {
    let daemon = ServiceDaemon::new()
        .map_err(|e| EngineError::HostUnreachable(format!("mdns daemon: {e}")))?;
    let receiver = daemon
        .browse(service_type)
        .map_err(|e| EngineError::HostUnreachable(format!("mdns browse: {e}")))?;

    let wanted = txt_value.to_string();
    let key = txt_key.to_string();
    let result = tokio::time::timeout(timeout, async move {
        loop {
            let event = match receiver.recv_async().await {
                Ok(event) => event,
                Err(_) => return None,
            };
            if let ServiceEvent::ServiceResolved(info) = event {
                if info.get_property_val_str(&key) != Some(wanted.as_str()) {
                    continue;
                }
                if let Some(ip) = info.get_addresses().iter().next() {
                    return Some(SocketAddr::new(ip.to_ip_addr(), info.get_port()));
                }
            }
        }
    })
    .await;

    let _ = daemon.shutdown();
    match result {
        Ok(Some(addr)) => Ok(addr),
        _ => Err(EngineError::HostUnreachable(format!(
            "no {txt_key} {txt_value} found on this network"
        ))),
    }
}
