//! Host-side peer directory: slot allocation, duplicate arbitration,
//! liveness bookkeeping.
//!
//! Pure state with indexed lookups; all protocol sends (WELCOME,
//! FORCE_CLOSE_DUPLICATE, DEVICE_LIST_UPDATE) happen in the device router,
//! which consults this directory. Slots are numbered 1..=max and survive
//! reconnects via a preferred-slot memory.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::protocol::{ConnectionType, DeviceEntry, PeerStatus};
use crate::transport::Link;
use crate::utils::now_millis;

/// One connected guest as the host sees it.
#[derive(Clone)]
pub struct PeerEntry {
    /// Opaque peer id assigned by signalling.
    pub peer_id: String,
    /// Connection id of the control link.
    pub conn_id: String,
    /// Slot 1..=max_guest_slots.
    pub slot: usize,
    /// Human label (`Peer <slot>` by default).
    pub label: String,
    pub status: PeerStatus,
    /// May issue playback commands.
    pub is_operator: bool,
    /// Receives chunks directly from the host; false when relayed.
    pub is_data_target: bool,
    pub connection_type: ConnectionType,
    /// Playlist indices this peer has confirmed caching.
    pub preloaded_indices: HashSet<usize>,
    /// Unix ms of the last inbound heartbeat.
    pub last_heartbeat_ms: u64,
    /// Control link to the peer.
    pub link: Link,
}

/// Result of admitting an inbound connection.
pub struct Admission {
    pub slot: usize,
    pub label: String,
    /// A previous live connection for the same peer id, to be sent
    /// FORCE_CLOSE_DUPLICATE and closed. Duplicates arise from flaky links.
    pub replaced: Option<Link>,
    /// The peer held a slot before (reconnect); bootstrap adds STATUS_SYNC.
    pub rejoined: bool,
}

/// Host-side directory of guests, indexed by peer id and connection id.
pub struct PeerDirectory {
    max_slots: usize,
    peers: DashMap<String, PeerEntry>,
    /// Secondary index: conn_id -> peer_id.
    conn_index: DashMap<String, String>,
    /// Slot each peer last held, for reconnects.
    preferred_slots: DashMap<String, usize>,
}

impl PeerDirectory {
    #[must_use]
    pub fn new(max_slots: usize) -> Self {
        Self {
            max_slots,
            peers: DashMap::new(),
            conn_index: DashMap::new(),
            preferred_slots: DashMap::new(),
        }
    }

    /// Admits an inbound control connection.
    ///
    /// Returns `None` when every slot is taken (caller replies SESSION_FULL
    /// and closes). A previous live connection for the same peer id is
    /// replaced and returned for force-closing.
    pub fn admit(&self, peer_id: &str, link: Link) -> Option<Admission> {
        let rejoined = self.preferred_slots.contains_key(peer_id);
        let replaced = self.remove_entry(peer_id).map(|old| old.link);

        let slot = self.pick_slot(peer_id)?;
        let label = format!("Peer {slot}");

        self.conn_index
            .insert(link.id().to_string(), peer_id.to_string());
        self.preferred_slots.insert(peer_id.to_string(), slot);
        self.peers.insert(
            peer_id.to_string(),
            PeerEntry {
                peer_id: peer_id.to_string(),
                conn_id: link.id().to_string(),
                slot,
                label: label.clone(),
                status: PeerStatus::Connected,
                is_operator: false,
                is_data_target: true,
                connection_type: ConnectionType::Unknown,
                preloaded_indices: HashSet::new(),
                last_heartbeat_ms: now_millis(),
                link,
            },
        );

        log::info!("[Peers] {peer_id} admitted to slot {slot}");
        Some(Admission {
            slot,
            label,
            replaced,
            rejoined,
        })
    }

    /// Lowest free slot, preferring the one the peer held before.
    fn pick_slot(&self, peer_id: &str) -> Option<usize> {
        let taken: HashSet<usize> = self.peers.iter().map(|e| e.slot).collect();
        if let Some(preferred) = self.preferred_slots.get(peer_id) {
            if !taken.contains(&*preferred) {
                return Some(*preferred);
            }
        }
        (1..=self.max_slots).find(|s| !taken.contains(s))
    }

    /// Releases a peer on close/error. The preferred slot is retained for a
    /// later reconnect. Returns the removed entry.
    pub fn release(&self, peer_id: &str) -> Option<PeerEntry> {
        let entry = self.remove_entry(peer_id);
        if let Some(ref e) = entry {
            log::info!("[Peers] {peer_id} released slot {}", e.slot);
        }
        entry
    }

    fn remove_entry(&self, peer_id: &str) -> Option<PeerEntry> {
        let (_, entry) = self.peers.remove(peer_id)?;
        self.conn_index
            .remove_if(&entry.conn_id, |_, pid| pid == peer_id);
        Some(entry)
    }

    /// Looks up a peer by its control connection id.
    #[must_use]
    pub fn by_conn(&self, conn_id: &str) -> Option<PeerEntry> {
        let peer_id = self.conn_index.get(conn_id)?;
        self.peers.get(peer_id.value()).map(|e| e.value().clone())
    }

    /// Looks up a peer by id.
    #[must_use]
    pub fn get(&self, peer_id: &str) -> Option<PeerEntry> {
        self.peers.get(peer_id).map(|e| e.value().clone())
    }

    /// All connected peers.
    #[must_use]
    pub fn all(&self) -> Vec<PeerEntry> {
        let mut peers: Vec<PeerEntry> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by_key(|p| p.slot);
        peers
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Records an inbound heartbeat.
    pub fn heartbeat(&self, peer_id: &str) {
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            entry.last_heartbeat_ms = now_millis();
        }
    }

    /// Peers whose last heartbeat is older than `timeout_ms`. The caller
    /// force-closes them.
    #[must_use]
    pub fn stale_peers(&self, timeout_ms: u64) -> Vec<PeerEntry> {
        let now = now_millis();
        self.peers
            .iter()
            .filter(|e| now.saturating_sub(e.last_heartbeat_ms) > timeout_ms)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Sets the probed connection type. Returns whether the value changed.
    pub fn set_connection_type(&self, peer_id: &str, connection_type: ConnectionType) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut entry) if entry.connection_type != connection_type => {
                entry.connection_type = connection_type;
                true
            }
            _ => false,
        }
    }

    /// Grants or revokes operator status. Returns whether the peer exists.
    pub fn set_operator(&self, peer_id: &str, is_operator: bool) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut entry) => {
                entry.is_operator = is_operator;
                true
            }
            None => false,
        }
    }

    /// Marks a peer as relayed (no direct media from the host) or direct.
    pub fn set_data_target(&self, peer_id: &str, is_data_target: bool) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut entry) => {
                entry.is_data_target = is_data_target;
                true
            }
            None => false,
        }
    }

    /// Records a confirmed preload cache for a playlist index.
    pub fn mark_preloaded(&self, peer_id: &str, index: usize) {
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            entry.preloaded_indices.insert(index);
        }
    }

    /// Drops all confirmed preload indices (playlist invalidation).
    pub fn clear_preloaded(&self) {
        for mut entry in self.peers.iter_mut() {
            entry.preloaded_indices.clear();
        }
    }

    /// Links eligible for direct media: connected, data target, probed
    /// LAN-local. Non-LAN guests never receive large payloads, and a
    /// freshly-admitted peer stays out until the candidate-pair probe
    /// promotes it from `Unknown`. Late-join bootstraps unicast directly
    /// and are not gated here.
    #[must_use]
    pub fn media_targets(&self) -> Vec<PeerEntry> {
        self.peers
            .iter()
            .filter(|e| {
                e.status == PeerStatus::Connected
                    && e.is_data_target
                    && e.connection_type == ConnectionType::Local
            })
            .map(|e| e.value().clone())
            .collect()
    }

    /// Builds the device list broadcast, host first.
    #[must_use]
    pub fn device_list(&self, host_id: &str, host_label: &str) -> Vec<DeviceEntry> {
        let mut list = vec![DeviceEntry {
            id: host_id.to_string(),
            label: host_label.to_string(),
            status: PeerStatus::Connected,
            is_host: true,
            is_op: None,
            connection_type: None,
        }];
        for peer in self.all() {
            list.push(DeviceEntry {
                id: peer.peer_id,
                label: peer.label,
                status: peer.status,
                is_host: false,
                is_op: Some(peer.is_operator),
                connection_type: Some(peer.connection_type),
            });
        }
        list
    }

    /// Clears everything, including preferred slots. Session leave only.
    pub fn clear(&self) {
        self.peers.clear();
        self.conn_index.clear();
        self.preferred_slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::WireFrame;
    use crate::transport::{LinkKind, LinkMeta, PeerConnection};
    use std::sync::Arc;

    struct StubConn {
        id: String,
        meta: LinkMeta,
    }

    impl StubConn {
        fn new(conn_id: &str, peer_id: &str) -> Link {
            Arc::new(Self {
                id: conn_id.to_string(),
                meta: LinkMeta {
                    peer_id: peer_id.to_string(),
                    kind: LinkKind::Control,
                },
            })
        }
    }

    impl PeerConnection for StubConn {
        fn id(&self) -> &str {
            &self.id
        }
        fn meta(&self) -> &LinkMeta {
            &self.meta
        }
        fn is_open(&self) -> bool {
            true
        }
        fn buffered_bytes(&self) -> usize {
            0
        }
        fn send(&self, _frame: WireFrame) -> Result<(), TransportError> {
            Ok(())
        }
        fn close(&self) {}
    }

    #[test]
    fn slots_fill_lowest_first() {
        let dir = PeerDirectory::new(3);
        let a = dir.admit("a", StubConn::new("c1", "a")).unwrap();
        let b = dir.admit("b", StubConn::new("c2", "b")).unwrap();
        assert_eq!(a.slot, 1);
        assert_eq!(b.slot, 2);
        assert_eq!(a.label, "Peer 1");
    }

    #[test]
    fn full_directory_rejects() {
        let dir = PeerDirectory::new(2);
        dir.admit("a", StubConn::new("c1", "a")).unwrap();
        dir.admit("b", StubConn::new("c2", "b")).unwrap();
        assert!(dir.admit("c", StubConn::new("c3", "c")).is_none());
    }

    #[test]
    fn preferred_slot_survives_reconnect() {
        let dir = PeerDirectory::new(3);
        dir.admit("a", StubConn::new("c1", "a")).unwrap();
        let b = dir.admit("b", StubConn::new("c2", "b")).unwrap();
        assert_eq!(b.slot, 2);

        dir.release("b");
        // Someone else connects meanwhile but does not take slot 2.
        let c = dir.admit("c", StubConn::new("c3", "c")).unwrap();
        assert_eq!(c.slot, 3, "free preferred slots are not given away first");

        let b2 = dir.admit("b", StubConn::new("c4", "b")).unwrap();
        assert_eq!(b2.slot, 2);
    }

    #[test]
    fn duplicate_connection_replaces_old_link() {
        let dir = PeerDirectory::new(3);
        dir.admit("a", StubConn::new("c1", "a")).unwrap();
        let second = dir.admit("a", StubConn::new("c2", "a")).unwrap();

        assert!(second.replaced.is_some());
        assert_eq!(second.slot, 1, "duplicate keeps the same slot");
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.by_conn("c2").unwrap().peer_id, "a");
        assert!(dir.by_conn("c1").is_none());
    }

    #[test]
    fn media_targets_require_probed_local_data_targets() {
        let dir = PeerDirectory::new(3);
        dir.admit("a", StubConn::new("c1", "a")).unwrap();
        dir.admit("b", StubConn::new("c2", "b")).unwrap();
        dir.admit("c", StubConn::new("c3", "c")).unwrap();

        // Freshly admitted peers are Unknown until the probe: not eligible.
        assert!(dir.media_targets().is_empty());

        dir.set_connection_type("a", ConnectionType::Local);
        dir.set_connection_type("b", ConnectionType::Remote);
        dir.set_connection_type("c", ConnectionType::Local);
        dir.set_data_target("c", false);

        let targets = dir.media_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].peer_id, "a");
    }

    #[test]
    fn device_list_puts_host_first() {
        let dir = PeerDirectory::new(3);
        dir.admit("guest-1", StubConn::new("c1", "guest-1")).unwrap();
        dir.set_operator("guest-1", true);

        let list = dir.device_list("host-id", "Living Room");
        assert_eq!(list.len(), 2);
        assert!(list[0].is_host);
        assert_eq!(list[0].label, "Living Room");
        assert_eq!(list[1].id, "guest-1");
        assert_eq!(list[1].is_op, Some(true));
    }

    #[test]
    fn stale_peers_reflect_heartbeat_age() {
        let dir = PeerDirectory::new(3);
        dir.admit("a", StubConn::new("c1", "a")).unwrap();
        assert!(dir.stale_peers(15_000).is_empty());

        // Backdate the heartbeat.
        dir.peers.get_mut("a").unwrap().last_heartbeat_ms = now_millis() - 20_000;
        let stale = dir.stale_peers(15_000);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].peer_id, "a");

        dir.heartbeat("a");
        assert!(dir.stale_peers(15_000).is_empty());
    }

    #[test]
    fn preloaded_indices_roundtrip() {
        let dir = PeerDirectory::new(3);
        dir.admit("a", StubConn::new("c1", "a")).unwrap();
        dir.mark_preloaded("a", 4);
        dir.mark_preloaded("a", 4);
        assert!(dir.get("a").unwrap().preloaded_indices.contains(&4));

        dir.clear_preloaded();
        assert!(dir.get("a").unwrap().preloaded_indices.is_empty());
    }
}
