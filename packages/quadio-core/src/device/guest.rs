//! Guest-side behavior: prepare handling, preload activation, PLAY
//! alignment and staged-file finalization.

use std::sync::Arc;

use crate::events::PlaybackEvent;
use crate::preload::ReadyPreload;
use crate::protocol::{Message, SessionId};
use crate::store::Slot;
use crate::transfer::TransferMeta;

use super::Device;

impl Device {
    /// FILE_PREPARE: a matching finished preload short-circuits the whole
    /// transfer; otherwise receive state resets and the prepare watchdog
    /// arms.
    pub(super) async fn on_file_prepare(
        self: &Arc<Self>,
        name: String,
        index: usize,
        _size: u64,
        _mime: String,
        session_id: SessionId,
    ) {
        let matched = self.preload.match_ready(&name, index);
        let switched = self
            .receive
            .on_prepare(session_id, matched.is_some())
            .await;
        if switched {
            if let Some(ready) = matched {
                self.activate_preload(ready, None).await;
            }
        }
    }

    /// PLAY from the host. Aligns index, activates a cached preload when
    /// the track changed under us, parks the time if the buffer is not
    /// staged yet.
    pub(super) async fn on_play_message(
        self: &Arc<Self>,
        time: f64,
        index: usize,
        name: Option<String>,
    ) {
        let index_changed = {
            let mut playlist = self.playlist.lock();
            let changed = playlist.current_index() != index;
            playlist.set_current_index(index);
            changed
        };

        if index_changed {
            self.emitter.emit_playback(PlaybackEvent::TrackChanged {
                index,
                name: name.clone().unwrap_or_default(),
            });
        }

        let is_external = {
            let playlist = self.playlist.lock();
            playlist
                .get(index)
                .map(|t| t.kind == crate::protocol::TrackKind::ExternalStream)
                .unwrap_or(false)
        };
        if is_external {
            self.playback.play_external(time);
            return;
        }

        if index_changed && self.playback.loaded_index() != Some(index) {
            let lookup_name = name.clone().unwrap_or_default();
            if let Some(ready) = self.preload.match_ready(&lookup_name, index) {
                self.activate_preload(ready, Some(time)).await;
                return;
            }
            // No buffer and no cache: ask upstream for the bytes; the play
            // time parks until the staging finishes.
            self.playback.play_at(time);
            let target = self
                .upstream_data_link()
                .filter(|l| l.is_open())
                .or_else(|| self.upstream_link());
            if let Some(target) = target {
                Self::send_to(&target, Message::RequestCurrentFile { name, index: Some(index) });
            }
            return;
        }

        self.playback.play_at(time);
    }

    /// The current file finished staging: lift it into a playable blob,
    /// confirm the cache upstream, consume any parked play time.
    pub(super) async fn on_file_staged(self: &Arc<Self>, meta: TransferMeta) {
        self.recovery.clear();

        let blob = match self.store.read_all(Slot::Current, &meta.name).await {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("[Device] Could not read staged {}: {e}", meta.name);
                return;
            }
        };

        // The staged track is ours now; remember it on the shadow playlist
        // entry so late REQUEST_CURRENT_FILE serves and re-activations
        // need no disk round-trip.
        {
            let mut playlist = self.playlist.lock();
            if let Some(item) = playlist.get_mut(meta.index) {
                item.blob = Some(blob.clone());
                if item.mime.is_empty() {
                    item.mime = meta.mime.clone();
                }
            }
        }

        if let Some(upstream) = self.upstream_link() {
            Self::send_to(&upstream, Message::PreloadAck { index: meta.index });
        }

        match self
            .playback
            .load_buffer(meta.index, &meta.name, &meta.mime, blob)
        {
            Ok(Some(parked_time)) => {
                self.playback.play_at(parked_time);
            }
            Ok(None) => {}
            Err(e) => {
                // Decode failure: toast, reset the slot, ask for the bytes
                // again.
                log::warn!("[Device] Sink rejected staged {}: {e}", meta.name);
                self.emitter.emit_error("decode_failed", e);
                self.receive.reset_current().await;
                if let Some(upstream) = self.upstream_link() {
                    Self::send_to(
                        &upstream,
                        Message::RequestCurrentFile {
                            name: Some(meta.name.clone()),
                            index: Some(meta.index),
                        },
                    );
                }
            }
        }
    }

    /// Promotes a finished preload to the playing buffer: zero transfer
    /// bytes on an anticipated track change.
    async fn activate_preload(self: &Arc<Self>, ready: ReadyPreload, play_time: Option<f64>) {
        let blob = match self.preload.read_blob(&ready).await {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("[Device] Could not read preload {}: {e}", ready.name);
                // Fall back to a normal transfer.
                self.preload.take_ready(ready.index);
                if let Some(upstream) = self.upstream_link() {
                    Self::send_to(
                        &upstream,
                        Message::RequestCurrentFile {
                            name: Some(ready.name),
                            index: Some(ready.index),
                        },
                    );
                }
                return;
            }
        };

        {
            let mut playlist = self.playlist.lock();
            playlist.set_current_index(ready.index);
            if let Some(item) = playlist.get_mut(ready.index) {
                item.blob = Some(blob.clone());
                if item.mime.is_empty() {
                    item.mime = ready.mime.clone();
                }
            }
        }

        log::info!(
            "[Device] Activating preloaded {} for index {}",
            ready.name,
            ready.index
        );
        if let Some(upstream) = self.upstream_link() {
            Self::send_to(&upstream, Message::PreloadAck { index: ready.index });
        }

        match self
            .playback
            .load_buffer(ready.index, &ready.name, &ready.mime, blob)
        {
            Ok(parked) => {
                if let Some(time) = play_time.or(parked) {
                    self.playback.play_at(time);
                }
            }
            Err(e) => {
                log::warn!("[Device] Sink rejected preload {}: {e}", ready.name);
                self.emitter.emit_error("decode_failed", e);
            }
        }
    }
}
