//! Guest-side receive path for the current file.
//!
//! Drives the FILE_PREPARE / FILE_START / FILE_RESUME / FILE_CHUNK /
//! FILE_END state machine: session-id gating, reorder buffering, in-order
//! store writes, progress emission, and the prepare/chunk watchdogs that
//! hand stalls to the recovery engine.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{ErrorCode, StoreError};
use crate::events::{EventEmitter, TransferEvent};
use crate::protocol::{Message, SessionId, WireFrame};
use crate::protocol_constants::{
    CHUNK_STALL_THRESHOLD, CHUNK_WATCHDOG_TICK, FILE_WAIT_TIMEOUT, PREPARE_WATCHDOG,
};
use crate::session::{SessionCheck, SessionClock};
use crate::signal::{Signal, SignalSender};
use crate::store::{ChunkStore, Slot};
use crate::timers::{TimerRegistry, TIMER_CHUNK_WATCHDOG, TIMER_FILE_WAIT, TIMER_PREPARE_WATCHDOG};

use super::{ReorderBuffer, TransferMeta};

#[derive(Default)]
struct RecvState {
    meta: Option<TransferMeta>,
    buffer: Option<ReorderBuffer>,
    received: u64,
    last_progress: u8,
    /// The named track matched a finished preload; incoming FILE_* traffic
    /// for this session is ignored.
    skip_incoming: bool,
    processing: bool,
    /// Set once `end` verified the staged file clean.
    completed: bool,
    last_chunk_at: Option<Instant>,
    watchdog_snapshot: u64,
    watchdog_snapshot_at: Option<Instant>,
}

/// Receive half of the transfer engine.
pub(crate) struct ReceiveEngine {
    /// Session-wide chunk size; every device in a session agrees on it.
    chunk_size: usize,
    store: ChunkStore,
    clock: Arc<SessionClock>,
    timers: TimerRegistry,
    emitter: Arc<dyn EventEmitter>,
    signals: SignalSender,
    state: Arc<Mutex<RecvState>>,
}

impl ReceiveEngine {
    pub fn new(
        chunk_size: usize,
        store: ChunkStore,
        clock: Arc<SessionClock>,
        timers: TimerRegistry,
        emitter: Arc<dyn EventEmitter>,
        signals: SignalSender,
    ) -> Self {
        Self {
            chunk_size,
            store,
            clock,
            timers,
            emitter,
            signals,
            state: Arc::new(Mutex::new(RecvState::default())),
        }
    }

    /// Chunks received so far for the current transfer.
    pub fn received_count(&self) -> u64 {
        self.state.lock().received
    }

    /// Identity of the in-flight transfer, if any.
    pub fn current_meta(&self) -> Option<TransferMeta> {
        self.state.lock().meta.clone()
    }

    /// Whether the current transfer fully staged (all chunks plus a clean
    /// `end`).
    pub fn is_complete(&self) -> bool {
        self.state.lock().completed
    }

    /// FILE_PREPARE: either switch to a matching preload (returns `true`;
    /// the device activates the staged blob) or reset receive state and arm
    /// the prepare watchdog.
    pub async fn on_prepare(&self, session_id: SessionId, matches_preload: bool) -> bool {
        if self.clock.check(session_id) == SessionCheck::Stale {
            return false;
        }
        self.clock.advance_local(session_id);

        if matches_preload {
            self.reset_current().await;
            self.state.lock().skip_incoming = true;
            return true;
        }

        self.reset_current().await;
        let signals = self.signals.clone();
        self.timers
            .set_timeout(TIMER_PREPARE_WATCHDOG, PREPARE_WATCHDOG, move || {
                log::warn!("[Transfer] No FILE_START within prepare window, requesting recovery");
                let _ = signals.send(Signal::NeedRecovery {
                    next_chunk: Some(0),
                    force_host: false,
                });
            });
        false
    }

    /// FILE_START / FILE_RESUME. Opens (or keeps) the current store slot
    /// and installs a fresh reorder buffer at `start_chunk`.
    pub async fn on_start(&self, meta: TransferMeta, start_chunk: u64) {
        match self.clock.check(meta.session_id) {
            SessionCheck::Stale => return,
            SessionCheck::Newer | SessionCheck::Current => {
                self.clock.advance_local(meta.session_id);
            }
        }
        self.timers.clear(TIMER_PREPARE_WATCHDOG);
        self.timers.clear(TIMER_FILE_WAIT);

        // A resume for the transfer already in flight keeps the store slot:
        // re-opening would truncate the staged prefix.
        let resume_in_place = {
            let state = self.state.lock();
            !state.skip_incoming
                && state
                    .meta
                    .as_ref()
                    .is_some_and(|m| m.name == meta.name && m.session_id == meta.session_id)
        };

        if !resume_in_place {
            match self
                .store
                .start(Slot::Current, &meta.name, meta.session_id, self.chunk_size)
                .await
            {
                Ok(()) => {}
                Err(StoreError::Locked { holder }) => {
                    // An older transfer holds the slot; it was preempted
                    // above, so retry once after reset.
                    log::warn!(
                        "[Transfer] Current slot locked by session {holder}, resetting before {}",
                        meta.session_id
                    );
                    self.store.reset(Slot::Current).await.ok();
                    if let Err(e) = self
                        .store
                        .start(Slot::Current, &meta.name, meta.session_id, self.chunk_size)
                        .await
                    {
                        log::warn!("[Transfer] Could not open current slot: {e}");
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("[Transfer] Could not open current slot: {e}");
                    return;
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.buffer = Some(ReorderBuffer::new(meta.session_id, start_chunk));
            state.received = start_chunk;
            state.last_progress = 0;
            state.skip_incoming = false;
            state.processing = false;
            state.completed = false;
            state.last_chunk_at = Some(Instant::now());
            state.watchdog_snapshot = start_chunk;
            state.watchdog_snapshot_at = Some(Instant::now());
            state.meta = Some(meta);
        }

        self.arm_chunk_watchdog();
    }

    /// FILE_CHUNK. Returns the frames drained in order, for relay fan-out.
    pub async fn on_chunk(
        &self,
        index: u64,
        session_id: SessionId,
        payload: Bytes,
    ) -> Vec<WireFrame> {
        match self.clock.check(session_id) {
            SessionCheck::Stale => return Vec::new(),
            SessionCheck::Newer => {
                // A newer session preempts: clear the old state, adopt the
                // id, and drop this chunk (its FILE_START or a recovery
                // resume will re-serve it).
                log::debug!(
                    "[Transfer] Session {} preempts receive state at chunk {index}",
                    session_id
                );
                self.reset_current().await;
                self.clock.advance_local(session_id);
                return Vec::new();
            }
            SessionCheck::Current => {}
        }

        let (drained, meta, received, progress) = {
            let mut state = self.state.lock();
            if state.skip_incoming || state.processing {
                return Vec::new();
            }
            let Some(meta) = state.meta.clone() else {
                return Vec::new();
            };
            let Some(buffer) = state.buffer.as_mut() else {
                return Vec::new();
            };
            if buffer.session_id() != session_id {
                return Vec::new();
            }

            buffer.insert(index, payload);
            let drained = buffer.drain_ready();
            for (chunk_index, bytes) in &drained {
                if let Err(e) = self.store.schedule_write(
                    Slot::Current,
                    &meta.name,
                    meta.session_id,
                    *chunk_index,
                    bytes.clone(),
                ) {
                    log::warn!("[Transfer] Write scheduling failed: {e}");
                }
            }
            state.received += drained.len() as u64;
            state.last_chunk_at = Some(Instant::now());

            let percent = if meta.total_chunks == 0 {
                100
            } else {
                ((state.received * 100) / meta.total_chunks) as u8
            };
            let progress = if percent != state.last_progress {
                state.last_progress = percent;
                Some(percent)
            } else {
                None
            };
            (drained, meta, state.received, progress)
        };

        if let Some(percent) = progress {
            self.emitter.emit_transfer(TransferEvent::Progress {
                name: meta.name.clone(),
                session_id: meta.session_id,
                percent,
            });
        }

        let forward: Vec<WireFrame> = drained
            .into_iter()
            .map(|(chunk_index, bytes)| {
                WireFrame::with_payload(
                    Message::FileChunk {
                        index: chunk_index,
                        session_id: meta.session_id,
                        total: meta.total_chunks,
                        name: meta.name.clone(),
                    },
                    bytes,
                )
            })
            .collect();

        if received >= meta.total_chunks {
            self.finalize(meta).await;
        }

        forward
    }

    /// All chunks are in: verify through the store and signal completion.
    async fn finalize(&self, meta: TransferMeta) {
        {
            let mut state = self.state.lock();
            if state.processing {
                return;
            }
            state.processing = true;
        }
        self.timers.clear(TIMER_CHUNK_WATCHDOG);
        self.emitter.emit_transfer(TransferEvent::Processing {
            name: meta.name.clone(),
            session_id: meta.session_id,
        });

        match self
            .store
            .end(Slot::Current, &meta.name, meta.session_id, meta.size_bytes)
            .await
        {
            Ok(()) => {
                self.state.lock().completed = true;
                self.emitter.emit_transfer(TransferEvent::Ready {
                    name: meta.name.clone(),
                    session_id: meta.session_id,
                });
                let _ = self.signals.send(Signal::FileComplete { meta });
            }
            Err(StoreError::NotStarted) => {
                // Session churn finalized under us; nothing to recover.
            }
            Err(e) => {
                log::warn!("[Transfer] Finalize of {} failed: {e}", meta.name);
                self.emitter.emit_error(e.code(), e.to_string());
                let mut state = self.state.lock();
                state.processing = false;
                state.received = 0;
                if let Some(buffer) = state.buffer.as_mut() {
                    *buffer = ReorderBuffer::new(meta.session_id, 0);
                }
                drop(state);
                let _ = self.signals.send(Signal::NeedRecovery {
                    next_chunk: Some(0),
                    force_host: false,
                });
            }
        }
    }

    /// FILE_END: finalize transfers that need no chunks (zero-byte files)
    /// or whose last chunk already landed. Idempotent.
    pub async fn finalize_if_complete(&self) {
        let pending = {
            let state = self.state.lock();
            match (&state.meta, state.processing || state.skip_incoming) {
                (Some(meta), false) if state.received >= meta.total_chunks => Some(meta.clone()),
                _ => None,
            }
        };
        if let Some(meta) = pending {
            self.finalize(meta).await;
        }
    }

    /// FILE_WAIT from an upstream relay: give data 10 s to show up, then
    /// go around the relay to the host.
    pub fn on_file_wait(&self) {
        let signals = self.signals.clone();
        self.timers
            .set_timeout(TIMER_FILE_WAIT, FILE_WAIT_TIMEOUT, move || {
                log::info!("[Transfer] Relay kept us waiting, requesting recovery from host");
                let _ = signals.send(Signal::NeedRecovery {
                    next_chunk: None,
                    force_host: true,
                });
            });
    }

    /// Data arrived (through any path): disarm the FILE_WAIT fallback.
    pub fn cancel_file_wait(&self) {
        self.timers.clear(TIMER_FILE_WAIT);
    }

    /// Clears receive state and the current store slot.
    pub async fn reset_current(&self) {
        self.timers.clear(TIMER_PREPARE_WATCHDOG);
        self.timers.clear(TIMER_CHUNK_WATCHDOG);
        self.timers.clear(TIMER_FILE_WAIT);
        {
            let mut state = self.state.lock();
            *state = RecvState::default();
        }
        if let Err(e) = self.store.reset(Slot::Current).await {
            log::warn!("[Transfer] Store reset failed: {e}");
        }
    }

    /// 1 Hz stall detector: fires recovery when no chunk landed for the
    /// stall threshold, or the received count stopped moving.
    fn arm_chunk_watchdog(&self) {
        let state = Arc::clone(&self.state);
        let signals = self.signals.clone();
        self.timers
            .set_interval(TIMER_CHUNK_WATCHDOG, CHUNK_WATCHDOG_TICK, move || {
                let mut guard = state.lock();
                if guard.meta.is_none() || guard.processing || guard.skip_incoming {
                    return;
                }
                let now = Instant::now();

                let silent = guard
                    .last_chunk_at
                    .is_some_and(|t| now.duration_since(t) > CHUNK_STALL_THRESHOLD);

                let frozen = if guard.watchdog_snapshot == guard.received {
                    guard
                        .watchdog_snapshot_at
                        .is_some_and(|t| now.duration_since(t) > CHUNK_STALL_THRESHOLD)
                } else {
                    guard.watchdog_snapshot = guard.received;
                    guard.watchdog_snapshot_at = Some(now);
                    false
                };

                if silent || frozen {
                    // Rearm the stall tracking so the next fire needs a
                    // fresh threshold; the recovery engine caps attempts.
                    guard.last_chunk_at = Some(now);
                    guard.watchdog_snapshot_at = Some(now);
                    drop(guard);
                    let _ = signals.send(Signal::NeedRecovery {
                        next_chunk: None,
                        force_host: false,
                    });
                }
            });
    }
}
