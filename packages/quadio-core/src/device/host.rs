//! Host-side behavior: admission, late-join bootstrap, playback authority,
//! preload scheduling and recovery re-serves.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::playback::PlayOutcome;
use crate::protocol::{Message, PlayerStateTag, RepeatMode, SessionId};
use crate::runtime::TaskSpawner;
use crate::protocol_constants::{
    HEARTBEAT_INTERVAL, HOST_RESYNC_DELAY, ICE_PROBE_DELAY, PRELOAD_DEBOUNCE,
};
use crate::signal::Signal;
use crate::timers::{
    TIMER_AUTO_PLAY, TIMER_ICE_PROBE_PREFIX, TIMER_PRELOAD_DEBOUNCE, TIMER_RESYNC,
};
use crate::transfer::send::TransferKind;
use crate::transfer::TransferMeta;
use crate::transport::Link;

use super::Device;

/// Host-internal timer names.
const TIMER_HEARTBEAT_SWEEP: &str = "heartbeat-sweep";
const TIMER_TRACK_END_POLL: &str = "track-end-poll";

impl Device {
    pub(super) fn start_host_timers(&self) {
        let signals = self.signals_tx.clone();
        self.timers
            .set_interval(TIMER_HEARTBEAT_SWEEP, HEARTBEAT_INTERVAL, move || {
                let _ = signals.send(Signal::HeartbeatSweep);
            });
        let signals = self.signals_tx.clone();
        self.timers
            .set_interval(TIMER_TRACK_END_POLL, Duration::from_secs(1), move || {
                let _ = signals.send(Signal::TrackEnded);
            });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Admission & late-join bootstrap
    // ─────────────────────────────────────────────────────────────────────

    pub(super) async fn admit_guest(self: &Arc<Self>, link: Link) {
        let peer_id = link.meta().peer_id.clone();

        let Some(admission) = self.peers.admit(&peer_id, Arc::clone(&link)) else {
            Self::send_to(
                &link,
                Message::SessionFull {
                    message: "Every guest slot is taken".to_string(),
                },
            );
            link.close();
            return;
        };

        if let Some(old) = admission.replaced {
            // Flaky links leave a zombie connection behind; tell it to go
            // away and keep the fresh one.
            Self::send_to(&old, Message::ForceCloseDuplicate);
            old.close();
        }

        Self::send_to(
            &link,
            Message::Welcome {
                label: admission.label,
            },
        );

        // Relay threshold: guests beyond the direct-data budget fetch media
        // from an existing direct peer instead of the host.
        let direct_count = self
            .peers
            .all()
            .iter()
            .filter(|p| p.is_data_target && p.peer_id != peer_id)
            .count();
        if direct_count >= self.config.max_direct_data_peers {
            if let Some(upstream_peer) = self
                .peers
                .all()
                .into_iter()
                .find(|p| p.is_data_target && p.peer_id != peer_id)
            {
                log::info!(
                    "[Device] Relaying {peer_id} through {} (direct peers at cap {})",
                    upstream_peer.peer_id,
                    self.config.max_direct_data_peers
                );
                self.peers.set_data_target(&peer_id, false);
                Self::send_to(
                    &link,
                    Message::AssignDataSource {
                        target_id: upstream_peer.peer_id,
                    },
                );
            }
            // No candidate upstream: keep the guest direct rather than
            // leave it without a media source.
        }

        self.broadcast_device_list();

        // Candidate-pair types need a moment to settle after open.
        let signals = self.signals_tx.clone();
        let probe_peer = peer_id.clone();
        self.timers.set_timeout(
            &format!("{TIMER_ICE_PROBE_PREFIX}{peer_id}"),
            ICE_PROBE_DELAY,
            move || {
                let _ = signals.send(Signal::IceProbe {
                    peer_id: probe_peer,
                });
            },
        );

        self.bootstrap_late_joiner(link, admission.rejoined).await;
    }

    /// Brings a fresh (or reconnecting) guest up to the authoritative
    /// state: modes, playlist, current media, timing.
    async fn bootstrap_late_joiner(self: &Arc<Self>, link: Link, rejoined: bool) {
        let (metas, current_index, repeat, shuffle) = {
            let playlist = self.playlist.lock();
            (
                playlist.metas(),
                playlist.current_index(),
                playlist.repeat(),
                playlist.shuffle(),
            )
        };

        Self::send_to(&link, Message::RepeatMode { value: repeat });
        Self::send_to(&link, Message::ShuffleMode { value: shuffle });
        Self::send_to(
            &link,
            Message::PlaylistUpdate {
                list: metas.clone(),
                current_track_index: Some(current_index),
            },
        );
        if rejoined {
            Self::send_to(
                &link,
                Message::StatusSync {
                    playlist_meta: metas,
                    current_track_index: current_index,
                    repeat_mode: Some(repeat),
                    is_shuffle: Some(shuffle),
                },
            );
        }

        // Current media, then preload, then timing. Relayed guests fetch
        // media from their upstream peer instead.
        let is_data_target = self
            .peers
            .get(&link.meta().peer_id)
            .map(|p| p.is_data_target)
            .unwrap_or(false);
        let current_blob = self.current_track_blob().filter(|_| is_data_target);
        if let Some((meta, blob)) = current_blob {
            let device = Arc::clone(self);
            let bootstrap_link = Arc::clone(&link);
            let preload = self.preload_unicast_payload();
            self.spawner.spawn(async move {
                Self::send_to(&bootstrap_link, prepare_frame(&meta));
                if let Err(e) = device
                    .sender
                    .unicast(&bootstrap_link, &blob, &meta, 0, TransferKind::Current)
                    .await
                {
                    log::warn!("[Device] Late-join unicast failed: {e}");
                    return;
                }
                if let Some((preload_meta, preload_blob)) = preload {
                    if let Err(e) = device
                        .sender
                        .unicast(
                            &bootstrap_link,
                            &preload_blob,
                            &preload_meta,
                            0,
                            TransferKind::Preload,
                        )
                        .await
                    {
                        log::warn!("[Device] Late-join preload unicast failed: {e}");
                    }
                }
            });
        }

        let state = self.playback.state_tag();
        match state {
            PlayerStateTag::PlayingAudio | PlayerStateTag::PlayingExternal => {
                Self::send_to(
                    &link,
                    Message::Play {
                        time: self.playback.position(),
                        index: current_index,
                        name: self.current_track_name(),
                    },
                );
            }
            PlayerStateTag::Paused => {
                Self::send_to(
                    &link,
                    Message::Pause {
                        time: self.playback.position(),
                        index: Some(current_index),
                        state: Some(state),
                        timestamp: Some(crate::utils::now_millis()),
                    },
                );
            }
            PlayerStateTag::Idle => {}
        }
    }

    fn current_track_name(&self) -> Option<String> {
        let playlist = self.playlist.lock();
        playlist.current().map(|t| t.name.clone())
    }

    /// Current track's transfer identity + bytes under the live session id.
    fn current_track_blob(&self) -> Option<(TransferMeta, Bytes)> {
        let session_id = self.sender.active();
        if session_id == 0 {
            return None;
        }
        let playlist = self.playlist.lock();
        let index = playlist.current_index();
        let item = playlist.current()?;
        let blob = item.blob.clone()?;
        Some((
            self.transfer_meta(&item.name, &item.mime, blob.len() as u64, index, session_id),
            blob,
        ))
    }

    fn preload_unicast_payload(&self) -> Option<(TransferMeta, Bytes)> {
        let (index, session_id) = (*self.current_preload.lock())?;
        let playlist = self.playlist.lock();
        let item = playlist.get(index)?;
        let blob = item.blob.clone()?;
        Some((
            self.transfer_meta(&item.name, &item.mime, blob.len() as u64, index, session_id),
            blob,
        ))
    }

    fn transfer_meta(
        &self,
        name: &str,
        mime: &str,
        size: u64,
        index: usize,
        session_id: SessionId,
    ) -> TransferMeta {
        TransferMeta {
            name: name.to_string(),
            mime: mime.to_string(),
            total_chunks: TransferMeta::total_for(size, self.config.chunk_size),
            size_bytes: size,
            index,
            session_id,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Liveness
    // ─────────────────────────────────────────────────────────────────────

    pub(super) fn sweep_stale_peers(&self) {
        let stale = self.peers.stale_peers(self.config.heartbeat_timeout_ms);
        if stale.is_empty() {
            return;
        }
        for peer in &stale {
            log::warn!(
                "[Device] No heartbeat from {} within {} ms, force-closing",
                peer.peer_id,
                self.config.heartbeat_timeout_ms
            );
            peer.link.close();
            self.peers.release(&peer.peer_id);
        }
        self.broadcast_device_list();
    }

    pub(super) fn probe_connection_type(&self, peer_id: &str) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        let probed = peer.link.connection_type();
        if self.peers.set_connection_type(peer_id, probed) {
            log::info!("[Device] {peer_id} connection type probed as {probed:?}");
            self.broadcast_device_list();
        }
    }

    /// Removes a guest from the session. The kicked guest receives one
    /// last device list without its own id and detaches cleanly on it.
    pub fn kick_peer(&self, peer_id: &str) {
        if let Some(peer) = self.peers.release(peer_id) {
            let list = self.peers.device_list(&self.id, &self.label);
            Self::send_to(&peer.link, Message::DeviceListUpdate { list });
            self.broadcast_device_list();
            peer.link.close();
        }
    }

    /// Pushes a toast message to one guest's UI.
    pub fn toast_peer(&self, peer_id: &str, message: &str) {
        if let Some(peer) = self.peers.get(peer_id) {
            Self::send_to(
                &peer.link,
                Message::SysToast {
                    message: message.to_string(),
                },
            );
        }
    }

    /// Grants or revokes a guest's right to issue playback commands.
    pub fn set_peer_operator(&self, peer_id: &str, is_operator: bool) {
        if !self.peers.set_operator(peer_id, is_operator) {
            return;
        }
        if let Some(peer) = self.peers.get(peer_id) {
            Self::send_to(
                &peer.link,
                if is_operator {
                    Message::OperatorGrant
                } else {
                    Message::OperatorRevoke
                },
            );
        }
        self.broadcast_device_list();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Playback authority
    // ─────────────────────────────────────────────────────────────────────

    /// Loads and plays a playlist index: allocates a session id, prepares
    /// every eligible peer, transfers to those without a matching preload,
    /// starts local playback and broadcasts PLAY.
    pub async fn play_track(self: &Arc<Self>, index: usize) {
        if !self.is_host() {
            return;
        }
        self.host_play_track(index).await;
    }

    pub(super) async fn host_play_track(self: &Arc<Self>, index: usize) {
        let (item, exists) = {
            let mut playlist = self.playlist.lock();
            let exists = playlist.get(index).is_some();
            if exists {
                playlist.set_current_index(index);
            }
            (playlist.get(index).cloned(), exists)
        };
        if !exists {
            return;
        }
        let item = item.expect("checked above");
        self.emitter
            .emit_playback(crate::events::PlaybackEvent::TrackChanged {
                index,
                name: item.name.clone(),
            });

        // External streams are state-only: no bytes move.
        if item.kind == crate::protocol::TrackKind::ExternalStream {
            self.playback.play_external(0.0);
            self.broadcast_to_guests(Message::Play {
                time: 0.0,
                index,
                name: Some(item.name.clone()),
            });
            self.schedule_host_resync();
            return;
        }

        let Some(blob) = item.blob.clone() else {
            log::warn!("[Device] Track {} has no media bytes", item.name);
            return;
        };

        self.timers.clear(TIMER_AUTO_PLAY);

        // New session id preempts any in-flight transfer for the old one,
        // the preload included.
        let session_id = self.clock.next();
        self.sender.set_active(session_id);
        self.sender.set_active_preload(0);
        *self.current_preload.lock() = None;
        let meta = self.transfer_meta(&item.name, &item.mime, blob.len() as u64, index, session_id);

        // Local copy first so PLAY has a buffer to act on.
        match self
            .playback
            .load_buffer(index, &item.name, &item.mime, blob.clone())
        {
            Ok(_) => {}
            Err(e) => {
                log::warn!("[Device] Sink rejected {}: {e}", item.name);
                self.emitter.emit_error("decode_failed", e);
                return;
            }
        }

        let targets = self.peers.media_targets();
        for target in &targets {
            Self::send_to(&target.link, prepare_frame(&meta));
        }

        // Peers that confirmed caching this index only needed the prepare;
        // everyone else gets the bytes.
        let lacking: Vec<_> = targets
            .iter()
            .filter(|p| !p.preloaded_indices.contains(&index))
            .map(|p| Arc::clone(&p.link))
            .collect();
        if !lacking.is_empty() {
            let device = Arc::clone(self);
            let transfer_meta = meta.clone();
            self.spawner.spawn(async move {
                device
                    .sender
                    .broadcast(&lacking, &blob, &transfer_meta, TransferKind::Current)
                    .await;
            });
        }

        if self.playback.play_at(0.0) == PlayOutcome::Started {
            self.broadcast_to_guests(Message::Play {
                time: 0.0,
                index,
                name: Some(item.name),
            });
            self.schedule_host_resync();
        }
        self.schedule_preload();
    }

    pub(super) async fn host_play(self: &Arc<Self>) {
        let position = self.playback.position();
        match self.playback.play_at(position) {
            PlayOutcome::Started => {
                let index = self.current_track_index();
                self.broadcast_to_guests(Message::Play {
                    time: position,
                    index,
                    name: self.current_track_name(),
                });
                self.schedule_host_resync();
            }
            PlayOutcome::Pending => {
                // Track not staged yet; kick the load via a track change.
                let index = self.current_track_index();
                self.host_play_track(index).await;
            }
            PlayOutcome::Locked => {}
        }
    }

    pub(super) fn host_pause(self: &Arc<Self>) {
        let position = self.playback.position();
        self.playback.pause_at(Some(position));
        self.broadcast_to_guests(Message::Pause {
            time: position,
            index: Some(self.current_track_index()),
            state: Some(PlayerStateTag::Paused),
            timestamp: Some(crate::utils::now_millis()),
        });
    }

    pub(super) async fn host_seek(self: &Arc<Self>, time: f64) {
        if self.playback.play_at(time) == PlayOutcome::Started {
            self.broadcast_to_guests(Message::Play {
                time,
                index: self.current_track_index(),
                name: self.current_track_name(),
            });
            self.schedule_host_resync();
        }
    }

    pub(super) async fn host_next(self: &Arc<Self>) {
        let next = self.playlist.lock().next_command_index();
        if let Some(index) = next {
            self.host_play_track(index).await;
        }
    }

    pub(super) async fn host_prev(self: &Arc<Self>) {
        let prev = self.playlist.lock().prev_index();
        if let Some(index) = prev {
            self.host_play_track(index).await;
        }
    }

    /// Track-end poll hit: apply the repeat/shuffle policy. Guests never
    /// auto-advance.
    pub(super) async fn host_auto_advance(self: &Arc<Self>) {
        if !self.playback.track_ended() {
            return;
        }
        let advance = self.playlist.lock().advance_index();
        match advance {
            Some(index) => self.host_play_track(index).await,
            None => {
                // End of playlist with repeat off.
                self.host_pause();
            }
        }
    }

    /// Host-side public wrappers (the UI calls these directly; guests send
    /// REQUEST_* instead).
    pub async fn play(self: &Arc<Self>) {
        if self.is_host() {
            self.host_play().await;
        } else if let Some(upstream) = self.upstream_link() {
            Self::send_to(&upstream, Message::RequestPlay);
        }
    }

    pub async fn pause(self: &Arc<Self>) {
        if self.is_host() {
            self.host_pause();
        } else if let Some(upstream) = self.upstream_link() {
            Self::send_to(&upstream, Message::RequestPause);
        }
    }

    pub async fn seek(self: &Arc<Self>, time: f64) {
        if self.is_host() {
            self.host_seek(time).await;
        } else if let Some(upstream) = self.upstream_link() {
            Self::send_to(&upstream, Message::RequestSeek { time });
        }
    }

    pub async fn next_track(self: &Arc<Self>) {
        if self.is_host() {
            self.host_next().await;
        } else if let Some(upstream) = self.upstream_link() {
            Self::send_to(&upstream, Message::RequestNextTrack);
        }
    }

    pub async fn prev_track(self: &Arc<Self>) {
        if self.is_host() {
            self.host_prev().await;
        } else if let Some(upstream) = self.upstream_link() {
            Self::send_to(&upstream, Message::RequestPrevTrack);
        }
    }

    pub fn set_repeat(self: &Arc<Self>, value: RepeatMode) {
        self.playlist.lock().set_repeat(value);
        if self.is_host() {
            self.broadcast_to_guests(Message::RepeatMode { value });
            self.schedule_preload();
        }
    }

    pub fn set_shuffle(self: &Arc<Self>, value: bool) {
        self.playlist.lock().set_shuffle(value);
        if self.is_host() {
            self.broadcast_to_guests(Message::ShuffleMode { value });
            self.schedule_preload();
        }
    }

    fn schedule_host_resync(&self) {
        let signals = self.signals_tx.clone();
        self.timers
            .set_timeout(TIMER_RESYNC, HOST_RESYNC_DELAY, move || {
                let _ = signals.send(Signal::HostResyncBroadcast);
            });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Preload scheduling
    // ─────────────────────────────────────────────────────────────────────

    /// Debounced whenever the current track or playlist advances.
    pub(super) fn schedule_preload(&self) {
        let signals = self.signals_tx.clone();
        self.timers
            .set_timeout(TIMER_PRELOAD_DEBOUNCE, PRELOAD_DEBOUNCE, move || {
                let _ = signals.send(Signal::SchedulePreload);
            });
    }

    pub(super) async fn host_run_preload(self: &Arc<Self>) {
        let (next_index, item) = {
            let playlist = self.playlist.lock();
            let Some(next) = playlist.preload_index() else {
                return;
            };
            (next, playlist.get(next).cloned())
        };
        let Some(item) = item else {
            return;
        };
        let Some(blob) = item.blob.clone() else {
            // External streams and unfetched entries have nothing to stage.
            return;
        };

        // A rescheduled preload silently cancels the one still sending.
        let session_id = self.clock.next();
        self.sender.set_active_preload(session_id);
        *self.current_preload.lock() = Some((next_index, session_id));
        let meta = self.transfer_meta(
            &item.name,
            &item.mime,
            blob.len() as u64,
            next_index,
            session_id,
        );

        for target in self.peers.media_targets() {
            if target.preloaded_indices.contains(&next_index) {
                // Header only: teaches the guest which session id this
                // cached index now rides under.
                Self::send_to(
                    &target.link,
                    Message::PreloadStart {
                        name: meta.name.clone(),
                        mime: meta.mime.clone(),
                        total: meta.total_chunks,
                        size: meta.size_bytes,
                        index: next_index,
                        session_id,
                        skipped: true,
                    },
                );
                continue;
            }
            let device = Arc::clone(self);
            let link = Arc::clone(&target.link);
            let blob = blob.clone();
            let meta = meta.clone();
            self.spawner.spawn(async move {
                if let Err(e) = device
                    .sender
                    .unicast(&link, &blob, &meta, 0, TransferKind::Preload)
                    .await
                {
                    log::warn!(
                        "[Device] Preload to {} failed: {e}",
                        link.meta().peer_id
                    );
                }
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Recovery re-serve
    // ─────────────────────────────────────────────────────────────────────

    /// Serves REQUEST_CURRENT_FILE / REQUEST_DATA_RECOVERY from the host's
    /// owned blobs ({current, preload}), matched by index or name. With no
    /// blob staged yet the guest gets FILE_WAIT and retries via its
    /// watchdog.
    pub(super) async fn serve_recovery(
        self: &Arc<Self>,
        link: &Link,
        name: Option<String>,
        index: Option<usize>,
        from_chunk: u64,
    ) {
        let preload_slot = *self.current_preload.lock();
        let lookup = {
            let playlist = self.playlist.lock();
            let current_index = playlist.current_index();

            let resolved = index
                .filter(|i| playlist.get(*i).is_some())
                .or_else(|| name.as_deref().and_then(|n| playlist.find_by_name(n).map(|(i, _)| i)))
                .unwrap_or(current_index);

            playlist.get(resolved).and_then(|item| {
                let blob = item.blob.clone()?;
                let (kind, session_id) = if resolved == current_index {
                    (TransferKind::Current, self.sender.active())
                } else if preload_slot.map(|(i, _)| i) == Some(resolved) {
                    (
                        TransferKind::Preload,
                        preload_slot.map(|(_, sid)| sid).unwrap_or(0),
                    )
                } else {
                    (TransferKind::Current, self.sender.active())
                };
                Some((
                    self.transfer_meta(&item.name, &item.mime, blob.len() as u64, resolved, session_id),
                    blob,
                    kind,
                ))
            })
        };

        let Some((meta, blob, kind)) = lookup else {
            Self::send_to(
                link,
                Message::FileWait {
                    message: "no media staged for that track yet".to_string(),
                },
            );
            return;
        };
        if meta.session_id == 0 {
            Self::send_to(
                link,
                Message::FileWait {
                    message: "no active transfer session".to_string(),
                },
            );
            return;
        }

        let device = Arc::clone(self);
        let link = Arc::clone(link);
        self.spawner.spawn(async move {
            if let Err(e) = device
                .sender
                .unicast(&link, &blob, &meta, from_chunk, kind)
                .await
            {
                log::warn!(
                    "[Device] Recovery re-serve to {} failed: {e}",
                    link.meta().peer_id
                );
            }
        });
    }
}

fn prepare_frame(meta: &TransferMeta) -> Message {
    Message::FilePrepare {
        name: meta.name.clone(),
        index: meta.index,
        size: meta.size_bytes,
        mime: meta.mime.clone(),
        session_id: meta.session_id,
    }
}
