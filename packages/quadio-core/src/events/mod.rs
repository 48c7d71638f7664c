//! Event system for embedding UIs and tests.
//!
//! This module provides:
//! - [`EventEmitter`] trait for engine components to emit events
//! - Event types for each domain (peers, transfer, preload, sync, playback)
//! - [`EventBridge`], a tokio broadcast fan-out with multiple subscribers
//!
//! Events are emit-only from the authoritative modules; nothing in the
//! engine reacts to its own events.

mod emitter;

pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::protocol::{DeviceEntry, PlayerStateTag, SessionId};

/// Events broadcast to embedding clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum EngineEvent {
    /// Peer lifecycle and directory changes.
    Peer(PeerEvent),
    /// Media transfer progress on this device.
    Transfer(TransferEvent),
    /// Next-track preload state.
    Preload(PreloadEvent),
    /// Clock sync and latency measurement.
    Sync(SyncEvent),
    /// Playback state changes.
    Playback(PlaybackEvent),
    /// Host-pushed toast for the UI.
    Toast {
        message: String,
    },
    /// A recoverable error scoped to one operation.
    Error {
        code: &'static str,
        message: String,
    },
}

/// Peer lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerEvent {
    /// The device list changed (join, leave, probe, operator change).
    ListUpdated {
        list: Vec<DeviceEntry>,
    },
    /// This guest was welcomed by the host.
    Welcomed {
        label: String,
    },
    /// The host rejected us: every slot is taken.
    SessionFull,
    /// The host's device list no longer contains us.
    Kicked,
    /// A connection dropped.
    Disconnected {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// The host reassigned our media source to a relay peer; the transport
    /// layer dials `target_id` with a data-relay connection.
    DataSourceAssigned {
        #[serde(rename = "targetId")]
        target_id: String,
    },
}

/// Media transfer events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferEvent {
    /// Receive progress for the current file.
    Progress {
        name: String,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        percent: u8,
    },
    /// All chunks received; finalizing through the chunk store.
    Processing {
        name: String,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    /// The current file is staged and ready for playback.
    Ready {
        name: String,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    /// A recovery attempt was issued.
    RecoveryRequested {
        name: String,
        attempt: u32,
        #[serde(rename = "nextChunk")]
        next_chunk: u64,
    },
}

/// Preload events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PreloadEvent {
    /// Preparing the next track (UI shows a spinner).
    Preparing {
        index: usize,
    },
    /// The next track is fully cached.
    Ready {
        index: usize,
    },
    /// Preload state cleared (watchdog or track change).
    Cleared,
}

/// Sync events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Latency estimate updated (min of recent RTTs).
    LatencyUpdated {
        #[serde(rename = "latencyMs")]
        latency_ms: u64,
    },
    /// Playback clock snapped to the host's position.
    Resynced {
        #[serde(rename = "hostTime")]
        host_time: f64,
    },
    /// Manual nudge applied.
    Nudged {
        #[serde(rename = "offsetMs")]
        offset_ms: i64,
    },
}

/// Playback events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackEvent {
    /// The state machine moved.
    StateChanged {
        state: PlayerStateTag,
    },
    /// The current track changed.
    TrackChanged {
        index: usize,
        name: String,
    },
    /// The playlist content changed.
    PlaylistChanged {
        len: usize,
        #[serde(rename = "currentTrackIndex")]
        current_track_index: usize,
    },
}

// From implementations for converting inner events to EngineEvent
impl From<PeerEvent> for EngineEvent {
    fn from(event: PeerEvent) -> Self {
        EngineEvent::Peer(event)
    }
}

impl From<TransferEvent> for EngineEvent {
    fn from(event: TransferEvent) -> Self {
        EngineEvent::Transfer(event)
    }
}

impl From<PreloadEvent> for EngineEvent {
    fn from(event: PreloadEvent) -> Self {
        EngineEvent::Preload(event)
    }
}

impl From<SyncEvent> for EngineEvent {
    fn from(event: SyncEvent) -> Self {
        EngineEvent::Sync(event)
    }
}

impl From<PlaybackEvent> for EngineEvent {
    fn from(event: PlaybackEvent) -> Self {
        EngineEvent::Playback(event)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast Bridge
// ─────────────────────────────────────────────────────────────────────────────

/// Fan-out emitter over a tokio broadcast channel.
///
/// Multiple subscribers (UI, tests) receive every event; lagging
/// subscribers lose oldest events rather than blocking the engine.
pub struct EventBridge {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBridge {
    /// Creates a bridge with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    /// Subscribes to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl EventEmitter for EventBridge {
    fn emit(&self, event: EngineEvent) {
        // A send error only means no subscriber is currently listening.
        let _ = self.tx.send(event);
    }
}
