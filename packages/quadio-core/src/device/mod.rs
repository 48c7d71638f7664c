//! The device: composition root and protocol router.
//!
//! One [`Device`] owns every engine: peer directory, chunk store, timer
//! registry, transfer/preload/recovery/relay engines, sync engine and
//! playback controller. No free-floating globals; everything session-
//! scoped lives here and dies on leave. A single run loop drains the
//! transport inbox and the internal signal channel, so per-connection
//! message order is preserved and no handler ever blocks the loop on I/O.

mod guest;
mod host;
mod router;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventEmitter, PeerEvent, PlaybackEvent};
use crate::peers::PeerDirectory;
use crate::playback::{AudioSink, ChannelMode, PlaybackController};
use crate::playlist::{Playlist, PlaylistItem};
use crate::preload::PreloadEngine;
use crate::protocol::{Message, RepeatMode, SessionId, WireFrame};
use crate::protocol_constants::INBOX_CAPACITY;
use crate::recovery::RecoveryEngine;
use crate::relay::RelayEngine;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::session::{generate_session_code, SessionClock};
use crate::signal::{self, Signal, SignalReceiver, SignalSender};
use crate::store::{ChunkStore, Slot};
use crate::sync::SyncEngine;
use crate::timers::TimerRegistry;
use crate::transfer::recv::ReceiveEngine;
use crate::transfer::send::TransferSender;
use crate::transport::{self, InboxReceiver, InboxSender, Link};

/// Which side of the session this device is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Not in a session.
    Detached,
    /// Owns the authoritative playlist, playback state and session-id
    /// allocator.
    Host { session_code: String },
    /// Connected to a host.
    Guest,
}

/// One participant in a Quadio session.
pub struct Device {
    /// Opaque id, also used as the peer id on the wire.
    id: String,
    label: String,
    config: EngineConfig,
    role: RwLock<Role>,
    /// Guest-side: whether the host granted us operator status.
    is_operator: AtomicBool,
    channel_mode: RwLock<ChannelMode>,

    clock: Arc<SessionClock>,
    timers: TimerRegistry,
    store: ChunkStore,
    peers: PeerDirectory,
    playlist: Mutex<Playlist>,
    playback: PlaybackController,
    sender: TransferSender,
    receive: Arc<ReceiveEngine>,
    preload: Arc<PreloadEngine>,
    recovery: RecoveryEngine,
    relay: RelayEngine,
    sync: SyncEngine,
    emitter: Arc<dyn EventEmitter>,
    /// Spawner for fire-and-forget engine tasks (run loop, transfer loops,
    /// re-serves). Tasks that need aborting (timers, relay pumps) manage
    /// their own handles instead.
    pub(crate) spawner: TokioSpawner,

    /// Every live connection by conn id.
    links: DashMap<String, Link>,
    /// Guest: control link to the host.
    upstream: RwLock<Option<Link>>,
    /// Guest: data-relay link to an assigned upstream peer.
    upstream_data: RwLock<Option<Link>>,
    /// Host: playlist index and session id of the preload in flight.
    current_preload: Mutex<Option<(usize, SessionId)>>,

    inbox_tx: InboxSender,
    inbox_rx: Mutex<Option<InboxReceiver>>,
    signals_tx: SignalSender,
    signals_rx: Mutex<Option<SignalReceiver>>,
}

impl Device {
    /// Builds a device. Call [`Device::start`] afterwards to run its loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context (background
    /// tasks spawn onto the current runtime).
    pub fn new(
        label: &str,
        config: EngineConfig,
        sink: Arc<dyn AudioSink>,
        emitter: Arc<dyn EventEmitter>,
    ) -> EngineResult<Arc<Self>> {
        config.validate().map_err(EngineError::Configuration)?;

        let id = uuid::Uuid::new_v4().to_string();
        let instance = &id[..8];
        let store = ChunkStore::new(config.staging_dir.clone(), instance)?;
        let clock = Arc::new(SessionClock::new());
        let timers = TimerRegistry::new();
        let (inbox_tx, inbox_rx) = transport::inbox(INBOX_CAPACITY);
        let (signals_tx, signals_rx) = signal::channel();

        let receive = Arc::new(ReceiveEngine::new(
            config.chunk_size,
            store.clone(),
            Arc::clone(&clock),
            timers.clone(),
            Arc::clone(&emitter),
            signals_tx.clone(),
        ));
        let probe_receive = Arc::clone(&receive);
        let relay = RelayEngine::new(
            store.clone(),
            Arc::new(move || {
                probe_receive
                    .current_meta()
                    .map(|meta| (meta, probe_receive.received_count(), probe_receive.is_complete()))
            }),
        );
        let preload = Arc::new(PreloadEngine::new(
            config.chunk_size,
            store.clone(),
            timers.clone(),
            Arc::clone(&emitter),
            signals_tx.clone(),
        ));
        let recovery = RecoveryEngine::new(
            config.recovery_backoff_ms.clone(),
            config.max_recovery_retries,
            timers.clone(),
            signals_tx.clone(),
        );
        let sync = SyncEngine::new(
            config.use_ping_compensation,
            timers.clone(),
            Arc::clone(&emitter),
            signals_tx.clone(),
        );
        let playback = PlaybackController::new(sink, Arc::clone(&emitter));
        let sender = TransferSender::new(config.chunk_size);
        let peers = PeerDirectory::new(config.max_guest_slots);
        let spawner = TokioSpawner::current();

        Ok(Arc::new(Self {
            id,
            label: label.to_string(),
            config,
            role: RwLock::new(Role::Detached),
            is_operator: AtomicBool::new(false),
            channel_mode: RwLock::new(ChannelMode::Stereo),
            clock,
            timers,
            store,
            peers,
            playlist: Mutex::new(Playlist::new()),
            playback,
            sender,
            receive,
            preload,
            recovery,
            relay,
            sync,
            emitter,
            spawner,
            links: DashMap::new(),
            upstream: RwLock::new(None),
            upstream_data: RwLock::new(None),
            current_preload: Mutex::new(None),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
        }))
    }

    /// Spawns the run loop: transport inbox + internal signals, drained in
    /// arrival order.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn start(self: &Arc<Self>) {
        let mut inbox = self
            .inbox_rx
            .lock()
            .take()
            .expect("Device::start called twice");
        let mut signals = self
            .signals_rx
            .lock()
            .take()
            .expect("Device::start called twice");

        let device = Arc::clone(self);
        self.spawner.spawn(async move {
            loop {
                tokio::select! {
                    event = inbox.recv() => match event {
                        Some(event) => device.on_link_event(event).await,
                        None => break,
                    },
                    signal = signals.recv() => match signal {
                        Some(signal) => device.on_signal(signal).await,
                        None => break,
                    },
                }
            }
            log::debug!("[Device] {} run loop exited", device.label);
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Identity & wiring
    // ─────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role.read().clone()
    }

    /// Guest-side: whether the host granted us operator status.
    #[must_use]
    pub fn is_operator(&self) -> bool {
        self.is_operator.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sender half of the transport inbox; transports deliver link events
    /// here.
    #[must_use]
    pub fn inbox_sender(&self) -> InboxSender {
        self.inbox_tx.clone()
    }

    /// Registers a connection so the router can resolve its events.
    pub fn register_link(&self, link: Link) {
        self.links.insert(link.id().to_string(), link);
    }

    /// This device's current playback position, seconds.
    #[must_use]
    pub fn position(&self) -> f64 {
        self.playback.position()
    }

    #[must_use]
    pub fn state_tag(&self) -> crate::protocol::PlayerStateTag {
        self.playback.state_tag()
    }

    /// The latency estimate published by the sync engine (guest side).
    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        self.sync.latency_ms()
    }

    /// Sets which output channel this device renders.
    pub fn set_channel_mode(&self, mode: ChannelMode) {
        *self.channel_mode.write() = mode;
        self.playback.set_channel_mode(mode);
    }

    #[must_use]
    pub fn channel_mode(&self) -> ChannelMode {
        *self.channel_mode.read()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Becomes the host of a fresh session and returns its 6-digit code.
    ///
    /// `code_taken` lets the signalling layer veto colliding codes.
    pub fn host_session<F>(self: &Arc<Self>, code_taken: F) -> EngineResult<String>
    where
        F: Fn(&str) -> bool,
    {
        {
            let role = self.role.read();
            if *role != Role::Detached {
                return Err(EngineError::Configuration(
                    "already in a session".to_string(),
                ));
            }
        }
        let code = generate_session_code(code_taken)?;
        *self.role.write() = Role::Host {
            session_code: code.clone(),
        };
        self.start_host_timers();
        log::info!("[Device] {} hosting session {code}", self.label);
        Ok(code)
    }

    /// Joins a session as guest over an established control link to the
    /// host. Admission (WELCOME or SESSION_FULL) arrives on the link.
    pub fn join_session(self: &Arc<Self>, upstream: Link) {
        *self.role.write() = Role::Guest;
        self.register_link(Arc::clone(&upstream));
        *self.upstream.write() = Some(upstream);
        self.sync.start_guest_cadence();
        log::info!("[Device] {} joined as guest", self.label);
    }

    /// Attaches the data-relay link dialed after ASSIGN_DATA_SOURCE. The
    /// host control path stays open; only media rides this link.
    pub fn attach_upstream_data(&self, link: Link) {
        self.register_link(Arc::clone(&link));
        *self.upstream_data.write() = Some(link);
    }

    /// Leaves the session: no managed timer stays active, no connection
    /// stays open, every slot resets, state returns to IDLE.
    pub async fn leave_session(&self) {
        log::info!("[Device] {} leaving session", self.label);
        self.timers.clear_all();

        for entry in self.links.iter() {
            entry.value().close();
        }
        self.links.clear();
        *self.upstream.write() = None;
        *self.upstream_data.write() = None;

        self.relay.clear();
        self.recovery.clear();
        self.sync.stop();
        self.receive.reset_current().await;
        self.preload.clear_pending().await;
        self.preload.clear_ready();
        self.store.reset(Slot::Current).await.ok();
        self.store.reset(Slot::Preload).await.ok();
        self.peers.clear();
        self.playback.reset();
        self.playlist.lock().replace(Vec::new(), 0);
        *self.current_preload.lock() = None;
        self.clock.reset();
        self.sender.set_active(0);
        self.sender.set_active_preload(0);
        self.is_operator.store(false, Ordering::SeqCst);
        *self.role.write() = Role::Detached;
    }

    /// Number of active managed timers (leave-invariant checks).
    #[must_use]
    pub fn active_timer_count(&self) -> usize {
        self.timers.active_count()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Playlist
    // ─────────────────────────────────────────────────────────────────────

    /// Adds a local file to the playlist (host) and broadcasts the update.
    pub fn add_local_file(&self, name: &str, title: &str, mime: &str, bytes: Bytes) -> usize {
        let index = {
            let mut playlist = self.playlist.lock();
            playlist.push(PlaylistItem::local_file(name, title, mime, bytes))
        };
        self.broadcast_playlist();
        index
    }

    /// Adds an external stream entry (state-only playback).
    pub fn add_external_stream(&self, name: &str, title: &str, external_id: &str) -> usize {
        let index = {
            let mut playlist = self.playlist.lock();
            playlist.push(PlaylistItem::external_stream(name, title, external_id))
        };
        self.broadcast_playlist();
        index
    }

    /// Removes a playlist entry. Indices are invalidated: confirmed
    /// preload caches are dropped on every device.
    pub fn remove_track(&self, index: usize) {
        {
            let mut playlist = self.playlist.lock();
            if playlist.remove(index).is_none() {
                return;
            }
        }
        self.peers.clear_preloaded();
        self.preload.clear_ready();
        self.broadcast_playlist();
    }

    #[must_use]
    pub fn playlist_len(&self) -> usize {
        self.playlist.lock().len()
    }

    #[must_use]
    pub fn current_track_index(&self) -> usize {
        self.playlist.lock().current_index()
    }

    #[must_use]
    pub fn playlist_metas(&self) -> Vec<crate::protocol::TrackMeta> {
        self.playlist.lock().metas()
    }

    #[must_use]
    pub fn repeat_mode(&self) -> RepeatMode {
        self.playlist.lock().repeat()
    }

    #[must_use]
    pub fn shuffle(&self) -> bool {
        self.playlist.lock().shuffle()
    }

    /// Media bytes held for a playlist index (host blobs or staged guest
    /// copies).
    #[must_use]
    pub fn track_blob(&self, index: usize) -> Option<Bytes> {
        self.playlist.lock().get(index).and_then(|t| t.blob.clone())
    }

    /// The device list as the host currently sees it (host first).
    #[must_use]
    pub fn device_entries(&self) -> Vec<crate::protocol::DeviceEntry> {
        self.peers.device_list(&self.id, &self.label)
    }

    /// Guest: ask the host for its playback time now (same round a
    /// GLOBAL_RESYNC_REQUEST triggers, minus the jitter).
    pub fn request_resync(&self) {
        self.signal(Signal::DoResync);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Manual sync nudge (either role)
    // ─────────────────────────────────────────────────────────────────────

    /// Shifts the local playback offset by `delta_ms`; the re-seek is
    /// debounced.
    pub fn nudge_sync(&self, delta_ms: i64) {
        let offset_ms = self.playback.adjust_local_offset(delta_ms);
        self.emitter
            .emit_sync(crate::events::SyncEvent::Nudged { offset_ms });
        if self.playback.is_playing() {
            self.sync.debounce_nudge_reseek();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shared helpers
    // ─────────────────────────────────────────────────────────────────────

    /// Fire-and-forget control send with warn logging.
    pub(crate) fn send_to(link: &Link, message: Message) {
        if let Err(e) = link.send(WireFrame::control(message)) {
            log::warn!("[Device] Send to {} failed: {e}", link.meta().peer_id);
        }
    }

    pub(crate) fn upstream_link(&self) -> Option<Link> {
        self.upstream.read().clone()
    }

    pub(crate) fn upstream_data_link(&self) -> Option<Link> {
        self.upstream_data.read().clone()
    }

    pub(crate) fn is_host(&self) -> bool {
        matches!(*self.role.read(), Role::Host { .. })
    }

    /// Broadcasts the playlist (with current index) to every guest.
    pub(crate) fn broadcast_playlist(&self) {
        let (metas, current) = {
            let playlist = self.playlist.lock();
            (playlist.metas(), playlist.current_index())
        };
        self.emitter.emit_playback(PlaybackEvent::PlaylistChanged {
            len: metas.len(),
            current_track_index: current,
        });
        if !self.is_host() {
            return;
        }
        self.broadcast_to_guests(Message::PlaylistUpdate {
            list: metas,
            current_track_index: Some(current),
        });
    }

    /// Sends a control message to every connected guest (host side).
    pub(crate) fn broadcast_to_guests(&self, message: Message) {
        for peer in self.peers.all() {
            Self::send_to(&peer.link, message.clone());
        }
    }

    /// Broadcasts the device list to every guest and the local UI.
    pub(crate) fn broadcast_device_list(&self) {
        let list = self.peers.device_list(&self.id, &self.label);
        self.emitter
            .emit_peer(PeerEvent::ListUpdated { list: list.clone() });
        self.broadcast_to_guests(Message::DeviceListUpdate { list });
    }

    pub(crate) fn signal(&self, signal: Signal) {
        let _ = self.signals_tx.send(signal);
    }
}
