//! Tagged-message dispatch and the signal loop.
//!
//! Messages are dispatched in arrival order per connection. Playback-change
//! requests are permission-checked against the sender's operator flag
//! before any handler runs; unknown tags fall through silently for forward
//! compatibility.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::events::{PeerEvent, TransferEvent};
use crate::protocol::Message;
use crate::recovery::RetryDecision;
use crate::signal::Signal;
use crate::sync::SyncOutcome;
use crate::transfer::TransferMeta;
use crate::transport::{InboundEvent, Link, LinkEvent, LinkKind};

use super::Device;

impl Device {
    pub(super) async fn on_link_event(self: &Arc<Self>, event: InboundEvent) {
        let InboundEvent { conn_id, event } = event;
        match event {
            LinkEvent::Open(link) => {
                self.register_link(Arc::clone(&link));
                self.on_link_open(&conn_id).await;
            }
            LinkEvent::Frame(frame) => {
                let Some(link) = self.links.get(&conn_id).map(|e| Arc::clone(e.value())) else {
                    return;
                };
                self.dispatch(&link, frame.message, frame.payload).await;
            }
            LinkEvent::Closed => self.on_link_closed(&conn_id).await,
            LinkEvent::Error(reason) => {
                log::warn!("[Device] Link {conn_id} failed: {reason}");
                self.on_link_closed(&conn_id).await;
            }
        }
    }

    async fn on_link_open(self: &Arc<Self>, conn_id: &str) {
        let Some(link) = self.links.get(conn_id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        match link.meta().kind {
            LinkKind::DataRelay => {
                // Inbound fan-out attachment; we are now this peer's
                // upstream.
                let is_our_upstream = self
                    .upstream_data
                    .read()
                    .as_ref()
                    .is_some_and(|up| up.id() == conn_id);
                if !is_our_upstream {
                    self.relay.add_downstream(link);
                }
            }
            LinkKind::Control if self.is_host() => {
                self.admit_guest(link).await;
            }
            LinkKind::Control => {
                // Guest side: admission continues when WELCOME arrives.
            }
        }
    }

    async fn on_link_closed(self: &Arc<Self>, conn_id: &str) {
        self.links.remove(conn_id);
        self.relay.remove_downstream(conn_id);

        if self.is_host() {
            if let Some(peer) = self.peers.by_conn(conn_id) {
                self.peers.release(&peer.peer_id);
                self.timers
                    .clear(&format!("{}{}", crate::timers::TIMER_ICE_PROBE_PREFIX, peer.peer_id));
                self.emitter.emit_peer(PeerEvent::Disconnected {
                    peer_id: peer.peer_id,
                });
                self.broadcast_device_list();
            }
            return;
        }

        let lost_upstream = self
            .upstream
            .read()
            .as_ref()
            .is_some_and(|up| up.id() == conn_id);
        if lost_upstream {
            // Host unreachable / disconnected: surface it; reconnect
            // policy belongs to the embedding UI.
            log::warn!("[Device] {} lost its host link", self.label);
            self.emitter.emit_peer(PeerEvent::Disconnected {
                peer_id: "host".to_string(),
            });
        }
        let lost_data = self
            .upstream_data
            .read()
            .as_ref()
            .is_some_and(|up| up.id() == conn_id);
        if lost_data {
            *self.upstream_data.write() = None;
            // Media now stalls; the chunk watchdog will route recovery to
            // the host path.
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Message dispatch
    // ─────────────────────────────────────────────────────────────────────

    async fn dispatch(self: &Arc<Self>, link: &Link, message: Message, payload: bytes::Bytes) {
        // Operator permission gate for playback-change requests.
        if message.requires_operator() {
            if !self.is_host() {
                return;
            }
            let allowed = self
                .peers
                .by_conn(link.id())
                .is_some_and(|peer| peer.is_operator);
            if !allowed {
                log::debug!(
                    "[Device] Ignoring {:?} from non-operator {}",
                    message,
                    link.meta().peer_id
                );
                return;
            }
        }

        match message {
            // ── Liveness & clock ────────────────────────────────────────
            Message::Heartbeat => {
                if let Some(peer) = self.peers.by_conn(link.id()) {
                    self.peers.heartbeat(&peer.peer_id);
                }
                Self::send_to(link, Message::HeartbeatAck);
            }
            Message::HeartbeatAck => {}
            Message::PingLatency { timestamp } => {
                Self::send_to(link, Message::PongLatency { timestamp });
            }
            Message::PongLatency { timestamp } => {
                self.sync.record_pong(timestamp);
            }
            Message::GetSyncTime { req_ts } => {
                Self::send_to(
                    link,
                    Message::SyncResponse {
                        time: self.playback.position(),
                        is_playing: self.playback.is_playing(),
                        req_ts,
                    },
                );
            }
            Message::SyncResponse {
                time,
                is_playing,
                req_ts,
            } => {
                if let SyncOutcome::Apply {
                    host_time,
                    is_playing,
                } = self.sync.on_sync_response(time, is_playing, req_ts)
                {
                    self.playback.snap_to_host(host_time, is_playing);
                }
            }
            Message::GlobalResyncRequest => {
                self.sync.on_global_resync();
            }

            // ── Peer lifecycle (guest side) ─────────────────────────────
            Message::Welcome { label } => {
                self.emitter.emit_peer(PeerEvent::Welcomed { label });
            }
            Message::SessionFull { message } => {
                log::warn!("[Device] Session full: {message}");
                self.emitter.emit_peer(PeerEvent::SessionFull);
                link.close();
            }
            Message::SessionStart => {}
            Message::ForceCloseDuplicate => {
                log::info!("[Device] Host replaced this connection with a newer one");
                link.close();
            }
            Message::DeviceListUpdate { list } => {
                let still_listed = list.iter().any(|d| d.id == self.id);
                self.emitter.emit_peer(PeerEvent::ListUpdated { list });
                if !still_listed {
                    // Kicked: the host's list no longer contains us.
                    self.emitter.emit_peer(PeerEvent::Kicked);
                    self.leave_session().await;
                }
            }
            Message::OperatorGrant => {
                self.is_operator.store(true, Ordering::SeqCst);
                self.emitter.emit_toast("You are now an operator".into());
            }
            Message::OperatorRevoke => {
                self.is_operator.store(false, Ordering::SeqCst);
            }
            Message::SysToast { message } => {
                self.emitter.emit_toast(message);
            }
            Message::AssignDataSource { target_id } => {
                log::info!("[Device] Reassigned to relay data source {target_id}");
                self.emitter
                    .emit_peer(PeerEvent::DataSourceAssigned { target_id });
            }

            // ── Current-file transfer (receive) ─────────────────────────
            Message::FilePrepare {
                name,
                index,
                size,
                mime,
                session_id,
            } => {
                self.on_file_prepare(name, index, size, mime, session_id)
                    .await;
            }
            Message::FileStart {
                name,
                mime,
                total,
                size,
                index,
                session_id,
            } => {
                let meta = TransferMeta {
                    name,
                    mime,
                    total_chunks: total,
                    size_bytes: size,
                    index,
                    session_id,
                };
                self.receive.cancel_file_wait();
                self.recovery.clear();
                self.relay
                    .forward(&crate::protocol::WireFrame::control(start_frame(&meta, 0)));
                self.receive.on_start(meta, 0).await;
            }
            Message::FileResume {
                name,
                mime,
                total,
                size,
                index,
                session_id,
                start_chunk,
            } => {
                let meta = TransferMeta {
                    name,
                    mime,
                    total_chunks: total,
                    size_bytes: size,
                    index,
                    session_id,
                };
                self.receive.cancel_file_wait();
                self.recovery.clear();
                self.receive.on_start(meta, start_chunk).await;
            }
            Message::FileChunk {
                index, session_id, ..
            } => {
                self.receive.cancel_file_wait();
                let forward = self.receive.on_chunk(index, session_id, payload).await;
                for frame in &forward {
                    self.relay.forward(frame);
                }
            }
            Message::FileEnd {
                name,
                mime,
                session_id,
            } => {
                self.receive.finalize_if_complete().await;
                self.relay
                    .forward(&crate::protocol::WireFrame::control(Message::FileEnd {
                        name,
                        mime,
                        session_id,
                    }));
            }
            Message::FileWait { message } => {
                log::info!("[Device] Upstream replied FILE_WAIT: {message}");
                self.receive.on_file_wait();
            }

            // ── Preload transfer (receive) ──────────────────────────────
            Message::PreloadStart {
                name,
                mime,
                total,
                size,
                index,
                session_id,
                skipped,
            } => {
                let meta = TransferMeta {
                    name: name.clone(),
                    mime: mime.clone(),
                    total_chunks: total,
                    size_bytes: size,
                    index,
                    session_id,
                };
                if let Some(drained) = self.preload.on_start(meta, skipped).await {
                    self.relay.forward(&crate::protocol::WireFrame::control(
                        Message::PreloadStart {
                            name,
                            mime,
                            total,
                            size,
                            index,
                            session_id,
                            skipped: false,
                        },
                    ));
                    for frame in &drained {
                        self.relay.forward(frame);
                    }
                }
            }
            Message::PreloadChunk {
                index, session_id, ..
            } => {
                let forward = self.preload.on_chunk(index, session_id, payload).await;
                for frame in &forward {
                    self.relay.forward(frame);
                }
            }
            Message::PreloadEnd {
                name,
                mime,
                session_id,
            } => {
                self.preload.on_end(session_id).await;
                self.relay
                    .forward(&crate::protocol::WireFrame::control(Message::PreloadEnd {
                        name,
                        mime,
                        session_id,
                    }));
            }
            Message::PreloadAck { index } => {
                if let Some(peer) = self.peers.by_conn(link.id()) {
                    self.peers.mark_preloaded(&peer.peer_id, index);
                }
            }

            // ── Recovery & relay service ────────────────────────────────
            Message::RequestCurrentFile { name, index } => {
                if self.is_host() {
                    self.serve_recovery(link, name, index, 0).await;
                } else {
                    self.relay.serve_downstream(link.id(), 0);
                }
            }
            Message::RequestDataRecovery {
                next_chunk,
                file_name,
                index,
                session_id: _,
            } => {
                if self.is_host() {
                    self.serve_recovery(link, Some(file_name), Some(index), next_chunk)
                        .await;
                } else {
                    self.relay.serve_downstream(link.id(), next_chunk);
                }
            }

            // ── Playback authority ──────────────────────────────────────
            Message::Play { time, index, name } => {
                self.on_play_message(time, index, name).await;
            }
            Message::Pause { time, index, .. } => {
                if let Some(index) = index {
                    self.playlist.lock().set_current_index(index);
                }
                self.playback.pause_at(Some(time));
            }
            Message::ForceSyncPlay { time } => {
                self.playback.snap_to_host(time, true);
            }
            Message::RepeatMode { value } => {
                self.playlist.lock().set_repeat(value);
            }
            Message::ShuffleMode { value } => {
                self.playlist.lock().set_shuffle(value);
            }
            Message::PlaylistUpdate {
                list,
                current_track_index,
            } => {
                let current = current_track_index.unwrap_or(0);
                self.playlist.lock().replace(list, current);
                self.broadcast_playlist();
            }
            Message::StatusSync {
                playlist_meta,
                current_track_index,
                repeat_mode,
                is_shuffle,
            } => {
                let mut playlist = self.playlist.lock();
                playlist.replace(playlist_meta, current_track_index);
                if let Some(repeat) = repeat_mode {
                    playlist.set_repeat(repeat);
                }
                if let Some(shuffle) = is_shuffle {
                    playlist.set_shuffle(shuffle);
                }
            }

            // ── Operator requests (host side, gate passed above) ────────
            Message::RequestPlay => self.host_play().await,
            Message::RequestPause => self.host_pause(),
            Message::RequestSeek { time } => self.host_seek(time).await,
            Message::RequestSkipTime { delta } => {
                let target = (self.playback.position() + delta).max(0.0);
                self.host_seek(target).await;
            }
            Message::RequestNextTrack => self.host_next().await,
            Message::RequestPrevTrack => self.host_prev().await,
            Message::RequestTrackChange { index } => {
                self.host_play_track(index).await;
            }
            Message::RequestSetting {
                setting_type,
                value,
                band,
            } => {
                self.playback.set_effect(&setting_type, &value, band);
            }

            Message::Unknown => {
                // Forward compatibility: newer peers may speak newer tags.
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internal signals
    // ─────────────────────────────────────────────────────────────────────

    pub(super) async fn on_signal(self: &Arc<Self>, signal: Signal) {
        match signal {
            Signal::FileComplete { meta } => {
                self.on_file_staged(meta).await;
            }
            Signal::PreloadFinalized { meta } => {
                // Exactly one ack per finalized index; the preload engine
                // finalizes at most once per transfer.
                if let Some(upstream) = self.upstream_link() {
                    Self::send_to(&upstream, Message::PreloadAck { index: meta.index });
                }
            }
            Signal::NeedRecovery {
                next_chunk,
                force_host,
            } => {
                self.request_recovery(next_chunk, force_host);
            }
            Signal::RecoveryRetry => {
                let current_name = self.receive.current_meta().map(|m| m.name);
                let received = self.receive.received_count();
                match self
                    .recovery
                    .on_retry_due(current_name.as_deref(), received)
                {
                    RetryDecision::Retry(cycle) => {
                        self.send_recovery_request(
                            cycle.file_name,
                            cycle.index,
                            cycle.session_id,
                            cycle.next_chunk,
                            cycle.attempt,
                            false,
                        );
                    }
                    RetryDecision::Cancelled => {}
                    RetryDecision::Exhausted(cycle) => {
                        self.emitter.emit_error(
                            "recovery_exhausted",
                            format!("could not recover {}", cycle.file_name),
                        );
                    }
                }
            }
            Signal::TrackEnded => {
                if self.is_host() {
                    self.host_auto_advance().await;
                }
            }
            Signal::DoResync => {
                if let Some(upstream) = self.upstream_link() {
                    let req_ts = self.sync.begin_sync_round();
                    Self::send_to(
                        &upstream,
                        Message::GetSyncTime {
                            req_ts: Some(req_ts),
                        },
                    );
                }
            }
            Signal::HostResyncBroadcast => {
                self.broadcast_to_guests(Message::GlobalResyncRequest);
            }
            Signal::HeartbeatSweep => {
                self.sweep_stale_peers();
            }
            Signal::SendHeartbeat => {
                if let Some(upstream) = self.upstream_link() {
                    Self::send_to(&upstream, Message::Heartbeat);
                }
            }
            Signal::SendPing => {
                if let Some(upstream) = self.upstream_link() {
                    Self::send_to(
                        &upstream,
                        Message::PingLatency {
                            timestamp: crate::utils::now_millis(),
                        },
                    );
                }
            }
            Signal::SchedulePreload => {
                if self.is_host() {
                    self.host_run_preload().await;
                }
            }
            Signal::PreloadTimeout => {
                self.preload.clear_pending().await;
            }
            Signal::NudgeReseek => {
                self.playback.apply_nudge_reseek();
            }
            Signal::IceProbe { peer_id } => {
                self.probe_connection_type(&peer_id);
            }
        }
    }

    /// Routes a stall to recovery: upstream relay if one is open (and not
    /// bypassed), otherwise the host.
    fn request_recovery(&self, next_chunk: Option<u64>, force_host: bool) {
        if self.receive.is_complete() {
            return;
        }
        let Some(meta) = self.receive.current_meta() else {
            return;
        };
        let next_chunk = next_chunk.unwrap_or_else(|| self.receive.received_count());
        if let Some(cycle) =
            self.recovery
                .begin(&meta.name, meta.index, meta.session_id, next_chunk)
        {
            self.send_recovery_request(
                cycle.file_name,
                cycle.index,
                cycle.session_id,
                cycle.next_chunk,
                cycle.attempt,
                force_host,
            );
        }
    }

    fn send_recovery_request(
        &self,
        file_name: String,
        index: usize,
        session_id: crate::protocol::SessionId,
        next_chunk: u64,
        attempt: u32,
        force_host: bool,
    ) {
        let target = if force_host {
            self.upstream_link()
        } else {
            self.upstream_data_link()
                .filter(|l| l.is_open())
                .or_else(|| self.upstream_link())
        };
        let Some(target) = target else {
            return;
        };
        self.emitter.emit_transfer(TransferEvent::RecoveryRequested {
            name: file_name.clone(),
            attempt,
            next_chunk,
        });
        Self::send_to(
            &target,
            Message::RequestDataRecovery {
                next_chunk,
                file_name,
                index,
                session_id,
            },
        );
    }
}

fn start_frame(meta: &TransferMeta, start_chunk: u64) -> Message {
    if start_chunk == 0 {
        Message::FileStart {
            name: meta.name.clone(),
            mime: meta.mime.clone(),
            total: meta.total_chunks,
            size: meta.size_bytes,
            index: meta.index,
            session_id: meta.session_id,
        }
    } else {
        Message::FileResume {
            name: meta.name.clone(),
            mime: meta.mime.clone(),
            total: meta.total_chunks,
            size: meta.size_bytes,
            index: meta.index,
            session_id: meta.session_id,
            start_chunk,
        }
    }
}
