//! Background transfer of the next track into the preload slot.
//!
//! Symmetric to the current-file receive path but fully independent of it:
//! preload traffic rides its own session id, stages into the preload slot,
//! and never advances the device's local (current-file) session id. The
//! payoff is S4-style instant track changes: a FILE_PREPARE naming an
//! already-cached track activates the staged bytes with zero new transfer.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::events::{EventEmitter, PreloadEvent};
use crate::protocol::{Message, SessionId, WireFrame};
use crate::protocol_constants::{PRELOAD_EARLY_CHUNK_LIMIT, PRELOAD_WATCHDOG};
use crate::signal::{Signal, SignalSender};
use crate::store::{ChunkStore, Slot};
use crate::timers::{TimerRegistry, TIMER_PRELOAD_WATCHDOG};
use crate::transfer::{ReorderBuffer, TransferMeta};

/// A fully staged next track.
#[derive(Debug, Clone)]
pub struct ReadyPreload {
    pub index: usize,
    pub name: String,
    pub mime: String,
    pub session_id: SessionId,
    pub size_bytes: u64,
}

#[derive(Default)]
struct PreloadRecv {
    meta: Option<TransferMeta>,
    buffer: Option<ReorderBuffer>,
    /// Chunks (index, session, bytes) that arrived before PRELOAD_START.
    /// Capped; overflow drops the whole early buffer.
    early: Vec<(u64, SessionId, Bytes)>,
    received: u64,
    finalized: bool,
}

/// Guest-side preload receiver plus the ready-track cache.
pub(crate) struct PreloadEngine {
    chunk_size: usize,
    store: ChunkStore,
    timers: TimerRegistry,
    emitter: Arc<dyn EventEmitter>,
    signals: SignalSender,
    recv: Mutex<PreloadRecv>,
    /// Finished preloads by playlist index.
    ready: DashMap<usize, ReadyPreload>,
}

impl PreloadEngine {
    pub fn new(
        chunk_size: usize,
        store: ChunkStore,
        timers: TimerRegistry,
        emitter: Arc<dyn EventEmitter>,
        signals: SignalSender,
    ) -> Self {
        Self {
            chunk_size,
            store,
            timers,
            emitter,
            signals,
            recv: Mutex::new(PreloadRecv::default()),
            ready: DashMap::new(),
        }
    }

    /// A finished preload matching the prepared track, by index or name.
    pub fn match_ready(&self, name: &str, index: usize) -> Option<ReadyPreload> {
        if let Some(entry) = self.ready.get(&index) {
            return Some(entry.value().clone());
        }
        self.ready
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value().clone())
    }

    /// Removes and returns a finished preload.
    pub fn take_ready(&self, index: usize) -> Option<ReadyPreload> {
        self.ready.remove(&index).map(|(_, v)| v)
    }

    /// Reads the staged preload bytes for activation.
    pub async fn read_blob(&self, preload: &ReadyPreload) -> Result<Bytes, StoreError> {
        self.store.read_all(Slot::Preload, &preload.name).await
    }

    /// PRELOAD_START. `skipped` headers only teach us which session id maps
    /// to an index we already cache. Returns the frames drained from the
    /// early buffer (for relay fan-out), or `None` when nothing started.
    pub async fn on_start(&self, meta: TransferMeta, skipped: bool) -> Option<Vec<WireFrame>> {
        if skipped {
            if let Some(mut entry) = self.ready.get_mut(&meta.index) {
                entry.session_id = meta.session_id;
            }
            return None;
        }

        // A fresh preload session preempts the previous one; an older id
        // must not clobber a newer transfer.
        let early = {
            let mut recv = self.recv.lock();
            if recv
                .meta
                .as_ref()
                .is_some_and(|m| m.session_id > meta.session_id)
            {
                return None;
            }
            std::mem::take(&mut recv.early)
        };

        if let Err(e) = self
            .store
            .start(Slot::Preload, &meta.name, meta.session_id, self.chunk_size)
            .await
        {
            log::warn!("[Preload] Could not open preload slot for {}: {e}", meta.name);
            return None;
        }

        {
            let mut recv = self.recv.lock();
            let mut buffer = ReorderBuffer::new(meta.session_id, 0);
            for (index, session_id, bytes) in early {
                if session_id == meta.session_id {
                    buffer.insert(index, bytes);
                }
            }
            recv.buffer = Some(buffer);
            recv.received = 0;
            recv.finalized = false;
            recv.meta = Some(meta.clone());
        }
        self.emitter.emit_preload(PreloadEvent::Preparing { index: meta.index });

        let signals = self.signals.clone();
        self.timers
            .set_timeout(TIMER_PRELOAD_WATCHDOG, PRELOAD_WATCHDOG, move || {
                let _ = signals.send(Signal::PreloadTimeout);
            });

        // Early chunks may already complete the file.
        Some(self.drain_and_maybe_finalize().await)
    }

    /// PRELOAD_CHUNK. Returns drained frames for relay fan-out.
    pub async fn on_chunk(
        &self,
        index: u64,
        session_id: SessionId,
        payload: Bytes,
    ) -> Vec<WireFrame> {
        {
            let mut recv = self.recv.lock();
            match recv.meta.as_ref() {
                None => {
                    // Header not seen yet; park the chunk.
                    if recv.early.len() >= PRELOAD_EARLY_CHUNK_LIMIT {
                        log::warn!(
                            "[Preload] Early buffer overflow at {} chunks, dropping it",
                            recv.early.len()
                        );
                        recv.early.clear();
                    } else {
                        recv.early.push((index, session_id, payload));
                    }
                    return Vec::new();
                }
                Some(meta) if meta.session_id != session_id || recv.finalized => {
                    return Vec::new();
                }
                Some(_) => {}
            }
            if let Some(buffer) = recv.buffer.as_mut() {
                buffer.insert(index, payload);
            }
        }
        self.drain_and_maybe_finalize().await
    }

    /// PRELOAD_END: finalization is idempotent with the total-reached path.
    pub async fn on_end(&self, session_id: SessionId) {
        let matches = {
            let recv = self.recv.lock();
            recv.meta
                .as_ref()
                .is_some_and(|m| m.session_id == session_id && !recv.finalized)
        };
        if matches {
            self.finalize().await;
        }
    }

    async fn drain_and_maybe_finalize(&self) -> Vec<WireFrame> {
        let (drained, meta, complete) = {
            let mut recv = self.recv.lock();
            let Some(meta) = recv.meta.clone() else {
                return Vec::new();
            };
            let Some(buffer) = recv.buffer.as_mut() else {
                return Vec::new();
            };
            let drained = buffer.drain_ready();
            for (chunk_index, bytes) in &drained {
                if let Err(e) = self.store.schedule_write(
                    Slot::Preload,
                    &meta.name,
                    meta.session_id,
                    *chunk_index,
                    bytes.clone(),
                ) {
                    log::warn!("[Preload] Write scheduling failed: {e}");
                }
            }
            recv.received += drained.len() as u64;
            let complete = recv.received >= meta.total_chunks && !recv.finalized;
            (drained, meta, complete)
        };

        let forward: Vec<WireFrame> = drained
            .into_iter()
            .map(|(chunk_index, bytes)| {
                WireFrame::with_payload(
                    Message::PreloadChunk {
                        index: chunk_index,
                        session_id: meta.session_id,
                        total: meta.total_chunks,
                        name: meta.name.clone(),
                    },
                    bytes,
                )
            })
            .collect();

        if complete {
            self.finalize().await;
        }
        forward
    }

    /// Verifies the staged preload and publishes it as ready. Runs at most
    /// once per transfer; the device sends PRELOAD_ACK on the resulting
    /// signal, which keeps the ack single per index.
    async fn finalize(&self) {
        let meta = {
            let mut recv = self.recv.lock();
            if recv.finalized {
                return;
            }
            let Some(meta) = recv.meta.clone() else {
                return;
            };
            recv.finalized = true;
            meta
        };
        self.timers.clear(TIMER_PRELOAD_WATCHDOG);

        match self
            .store
            .end(Slot::Preload, &meta.name, meta.session_id, meta.size_bytes)
            .await
        {
            Ok(()) => {
                self.ready.insert(
                    meta.index,
                    ReadyPreload {
                        index: meta.index,
                        name: meta.name.clone(),
                        mime: meta.mime.clone(),
                        session_id: meta.session_id,
                        size_bytes: meta.size_bytes,
                    },
                );
                self.emitter
                    .emit_preload(PreloadEvent::Ready { index: meta.index });
                let _ = self.signals.send(Signal::PreloadFinalized { meta });
            }
            Err(e) => {
                log::warn!("[Preload] Finalize of {} failed: {e}", meta.name);
                self.clear_pending().await;
            }
        }
    }

    /// Clears the in-flight preload (watchdog or track change). Finished
    /// preloads in the ready cache are kept.
    pub async fn clear_pending(&self) {
        self.timers.clear(TIMER_PRELOAD_WATCHDOG);
        {
            let mut recv = self.recv.lock();
            *recv = PreloadRecv::default();
        }
        if let Err(e) = self.store.reset(Slot::Preload).await {
            log::warn!("[Preload] Store reset failed: {e}");
        }
        self.emitter.emit_preload(PreloadEvent::Cleared);
    }

    /// Drops the ready cache (playlist invalidation / session leave).
    pub fn clear_ready(&self) {
        self.ready.clear();
    }
}
