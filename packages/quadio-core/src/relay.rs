//! Relay fan-out: forwarding media to downstream peers.
//!
//! A peer chosen as upstream for others keeps a set of downstream
//! data-relay links. Live traffic (current-file and preload headers,
//! chunks, trailers) is forwarded as cloned frames in the order it drains
//! from the reorder buffer; a downstream that asks for the file before the
//! upstream has it gets FILE_WAIT, and one that asks mid-transfer is served
//! by a per-downstream catch-up pump reading staged chunks back out of the
//! chunk store with credit-based pacing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::protocol::{Message, WireFrame};
use crate::protocol_constants::{
    BACKGROUND_YIELD_EVERY, BACKPRESSURE_GRACE, CATCHUP_READ_STUCK, SEND_BUFFER_LOW_WATERMARK,
};
use crate::store::{ChunkStore, Slot};
use crate::transfer::TransferMeta;
use crate::transport::{wait_for_drain, Link};

/// Live receive-state snapshot: (transfer identity, chunks received,
/// fully staged). `None` while no current transfer exists.
pub type ProgressProbe = Arc<dyn Fn() -> Option<(TransferMeta, u64, bool)> + Send + Sync>;

struct Downstream {
    link: Link,
    /// Asked for the current file before we had anything; the next
    /// FILE_START that passes through is their catch-up.
    waiting_for_start: AtomicBool,
}

pub struct RelayEngine {
    store: ChunkStore,
    probe: ProgressProbe,
    downstream: DashMap<String, Downstream>,
    pumps: DashMap<String, JoinHandle<()>>,
}

impl RelayEngine {
    pub fn new(store: ChunkStore, probe: ProgressProbe) -> Self {
        Self {
            store,
            probe,
            downstream: DashMap::new(),
            pumps: DashMap::new(),
        }
    }

    /// Registers an inbound data-relay connection.
    pub fn add_downstream(&self, link: Link) {
        log::info!("[Relay] Downstream {} attached", link.meta().peer_id);
        self.downstream.insert(
            link.id().to_string(),
            Downstream {
                link,
                waiting_for_start: AtomicBool::new(false),
            },
        );
    }

    /// Drops a downstream (connection closed) and stops its pump.
    pub fn remove_downstream(&self, conn_id: &str) {
        if let Some((_, d)) = self.downstream.remove(conn_id) {
            log::info!("[Relay] Downstream {} detached", d.link.meta().peer_id);
        }
        if let Some((_, pump)) = self.pumps.remove(conn_id) {
            pump.abort();
        }
    }

    #[must_use]
    pub fn has_downstreams(&self) -> bool {
        !self.downstream.is_empty()
    }

    /// Forwards a frame to every open downstream. The frame handle is
    /// cloned per receiver; a transport consuming the buffer can never
    /// corrupt another's view.
    pub fn forward(&self, frame: &WireFrame) {
        if self.downstream.is_empty() {
            return;
        }
        let is_start = matches!(
            frame.message,
            Message::FileStart { .. } | Message::FileResume { .. }
        );
        for entry in self.downstream.iter() {
            if !entry.link.is_open() {
                continue;
            }
            if is_start {
                entry.waiting_for_start.store(false, Ordering::SeqCst);
            }
            if let Err(e) = entry.link.send(frame.clone()) {
                log::warn!(
                    "[Relay] Forward to {} failed: {e}",
                    entry.link.meta().peer_id
                );
            }
        }
    }

    /// REQUEST_CURRENT_FILE / REQUEST_DATA_RECOVERY from a downstream:
    /// serve from the staged file, or FILE_WAIT when nothing is here yet.
    pub fn serve_downstream(&self, conn_id: &str, from_chunk: u64) {
        let Some(entry) = self.downstream.get(conn_id) else {
            return;
        };
        let link = Arc::clone(&entry.link);

        let Some((meta, received, _complete)) = (self.probe)() else {
            entry.waiting_for_start.store(true, Ordering::SeqCst);
            let _ = link.send(WireFrame::control(Message::FileWait {
                message: "upstream has no file yet".into(),
            }));
            log::info!(
                "[Relay] {} asked before any data arrived, sent FILE_WAIT",
                link.meta().peer_id
            );
            return;
        };
        drop(entry);

        let from_chunk = from_chunk.min(meta.total_chunks.saturating_sub(1));
        log::info!(
            "[Relay] Catch-up for {} from chunk {} ({} of {} staged)",
            link.meta().peer_id,
            from_chunk,
            received,
            meta.total_chunks
        );

        let header = if from_chunk == 0 {
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
                start_chunk: from_chunk,
            }
        };
        if link.send(WireFrame::control(header)).is_err() {
            return;
        }

        // One pump per downstream; a new request replaces the old pump.
        let store = self.store.clone();
        let probe = Arc::clone(&self.probe);
        let handle = tokio::spawn(catchup_pump(store, probe, link, meta, from_chunk));
        if let Some(old) = self.pumps.insert(conn_id.to_string(), handle) {
            old.abort();
        }
    }

    /// Stops every pump and forgets all downstreams. Session leave.
    pub fn clear(&self) {
        for entry in self.pumps.iter() {
            entry.value().abort();
        }
        self.pumps.clear();
        self.downstream.clear();
    }
}

/// Per-downstream finite-state streamer: reads one staged chunk at a time
/// and sends it with credit pacing. A read outstanding past the stuck
/// threshold is retried at the same index. Stops when the session
/// advances, the transfer identity is cleared, the end is reached, the
/// live edge is caught, or the peer closes.
async fn catchup_pump(
    store: ChunkStore,
    probe: ProgressProbe,
    link: Link,
    meta: TransferMeta,
    start_chunk: u64,
) {
    let tag = format!("catchup:{}", link.meta().peer_id);
    let mut next_index = start_chunk;

    loop {
        if !link.is_open() {
            log::debug!("[Relay] Pump {tag} stopped: peer closed");
            return;
        }
        let Some((live, received, _complete)) = probe() else {
            log::debug!("[Relay] Pump {tag} stopped: transfer cleared");
            return;
        };
        if live.session_id != meta.session_id || live.name != meta.name {
            log::debug!("[Relay] Pump {tag} stopped: session advanced");
            return;
        }
        if next_index >= meta.total_chunks {
            let _ = link.send(WireFrame::control(Message::FileEnd {
                name: meta.name.clone(),
                mime: meta.mime.clone(),
                session_id: meta.session_id,
            }));
            log::debug!("[Relay] Pump {tag} stopped: end reached");
            return;
        }
        if next_index >= received {
            // Caught up with the live edge; forwarding covers the rest.
            log::debug!("[Relay] Pump {tag} caught up at chunk {next_index}");
            return;
        }

        let read = tokio::time::timeout(
            CATCHUP_READ_STUCK,
            store.read(
                Slot::Current,
                &meta.name,
                meta.session_id,
                next_index,
                &tag,
            ),
        )
        .await;
        let bytes = match read {
            Err(_) => {
                // awaiting_read went stuck; retry the same index.
                log::warn!("[Relay] Pump {tag} read stuck at chunk {next_index}, retrying");
                continue;
            }
            Ok(Err(e)) => {
                log::warn!("[Relay] Pump {tag} read failed at chunk {next_index}: {e}");
                return;
            }
            Ok(Ok(bytes)) => bytes,
        };

        let frame = WireFrame::with_payload(
            Message::FileChunk {
                index: next_index,
                session_id: meta.session_id,
                total: meta.total_chunks,
                name: meta.name.clone(),
            },
            bytes,
        );
        if link.send(frame).is_err() {
            return;
        }
        if wait_for_drain(&*link, SEND_BUFFER_LOW_WATERMARK, BACKPRESSURE_GRACE)
            .await
            .is_err()
        {
            log::warn!("[Relay] Pump {tag} aborted: backpressure");
            return;
        }

        next_index += 1;
        if next_index % BACKGROUND_YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{link as memory_link, Endpoint};
    use crate::transport::{inbox, InboxReceiver, LinkEvent, LinkKind, LinkMeta};
    use bytes::Bytes;
    use parking_lot::RwLock;

    fn meta(session_id: u64, size: u64) -> TransferMeta {
        TransferMeta {
            name: "t.wav".into(),
            mime: "audio/wav".into(),
            total_chunks: TransferMeta::total_for(size, 4),
            size_bytes: size,
            index: 0,
            session_id,
        }
    }

    fn relay_pair(
        inbox_tx: crate::transport::InboxSender,
    ) -> (Link, Link) {
        let (dead_tx, _dead_rx) = inbox(64);
        let (up_to_down, down_to_up) = memory_link(
            Endpoint {
                conn_id: "up-to-down".into(),
                meta: LinkMeta {
                    peer_id: "downstream".into(),
                    kind: LinkKind::DataRelay,
                },
                inbox: dead_tx,
            },
            Endpoint {
                conn_id: "down-to-up".into(),
                meta: LinkMeta {
                    peer_id: "upstream".into(),
                    kind: LinkKind::DataRelay,
                },
                inbox: inbox_tx,
            },
        );
        (up_to_down, down_to_up)
    }

    async fn collect(rx: &mut InboxReceiver, n: usize) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while frames.len() < n {
            if let LinkEvent::Frame(f) = rx.recv().await.expect("inbox closed").event {
                frames.push(f);
            }
        }
        frames
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: RelayEngine,
        state: Arc<RwLock<Option<(TransferMeta, u64, bool)>>>,
        store: ChunkStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(Some(dir.path().to_path_buf()), "test").unwrap();
        let state: Arc<RwLock<Option<(TransferMeta, u64, bool)>>> = Arc::new(RwLock::new(None));
        let probe_state = Arc::clone(&state);
        let probe: ProgressProbe = Arc::new(move || probe_state.read().clone());
        Fixture {
            _dir: dir,
            engine: RelayEngine::new(store.clone(), probe),
            state,
            store,
        }
    }

    #[tokio::test]
    async fn request_before_any_data_gets_file_wait() {
        let fx = fixture();
        let (down_inbox_tx, mut down_rx) = inbox(64);
        let (up_side, _down_side) = relay_pair(down_inbox_tx);
        fx.engine.add_downstream(Arc::clone(&up_side));

        fx.engine.serve_downstream(up_side.id(), 0);
        let frames = collect(&mut down_rx, 1).await;
        assert!(matches!(frames[0].message, Message::FileWait { .. }));
    }

    #[tokio::test]
    async fn forward_clones_to_all_downstreams() {
        let fx = fixture();
        let (tx1, mut rx1) = inbox(64);
        let (tx2, mut rx2) = inbox(64);
        let (up1, _d1) = relay_pair(tx1);
        let (up2, _d2) = relay_pair(tx2);
        fx.engine.add_downstream(up1);
        fx.engine.add_downstream(up2);

        let frame = WireFrame::with_payload(
            Message::FileChunk {
                index: 0,
                session_id: 1,
                total: 2,
                name: "t.wav".into(),
            },
            Bytes::from_static(b"abcd"),
        );
        fx.engine.forward(&frame);

        for rx in [&mut rx1, &mut rx2] {
            let got = collect(rx, 1).await;
            assert_eq!(got[0].payload, frame.payload);
        }
    }

    #[tokio::test]
    async fn pump_streams_staged_chunks_then_stops_at_live_edge() {
        let fx = fixture();
        let m = meta(3, 24); // 6 chunks
        fx.store.start(Slot::Current, &m.name, 3, 4).await.unwrap();
        for i in 0..4u64 {
            fx.store
                .write(Slot::Current, &m.name, 3, i, Bytes::from(vec![b'a' + i as u8; 4]))
                .await
                .unwrap();
        }
        *fx.state.write() = Some((m.clone(), 4, false));

        let (down_inbox_tx, mut down_rx) = inbox(64);
        let (up_side, _down_side) = relay_pair(down_inbox_tx);
        fx.engine.add_downstream(Arc::clone(&up_side));
        fx.engine.serve_downstream(up_side.id(), 0);

        let frames = collect(&mut down_rx, 5).await;
        assert!(matches!(frames[0].message, Message::FileStart { .. }));
        for (i, frame) in frames[1..].iter().enumerate() {
            match &frame.message {
                Message::FileChunk { index, .. } => assert_eq!(*index, i as u64),
                other => panic!("expected chunk, got {other:?}"),
            }
            assert_eq!(frame.payload[0], b'a' + i as u8);
        }
        // Pump stops at the live edge (4 of 6); no FILE_END yet.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(down_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pump_sends_end_after_final_chunk() {
        let fx = fixture();
        let m = meta(3, 8); // 2 chunks
        fx.store.start(Slot::Current, &m.name, 3, 4).await.unwrap();
        fx.store
            .write(Slot::Current, &m.name, 3, 0, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();
        fx.store
            .write(Slot::Current, &m.name, 3, 1, Bytes::from_static(b"bbbb"))
            .await
            .unwrap();
        *fx.state.write() = Some((m.clone(), 2, true));

        let (down_inbox_tx, mut down_rx) = inbox(64);
        let (up_side, _down_side) = relay_pair(down_inbox_tx);
        fx.engine.add_downstream(Arc::clone(&up_side));
        fx.engine.serve_downstream(up_side.id(), 0);

        let frames = collect(&mut down_rx, 4).await;
        assert!(matches!(frames[0].message, Message::FileStart { .. }));
        assert!(matches!(frames[3].message, Message::FileEnd { .. }));
    }

    #[tokio::test]
    async fn pump_resumes_from_requested_chunk() {
        let fx = fixture();
        let m = meta(3, 16); // 4 chunks
        fx.store.start(Slot::Current, &m.name, 3, 4).await.unwrap();
        for i in 0..4u64 {
            fx.store
                .write(Slot::Current, &m.name, 3, i, Bytes::from(vec![i as u8; 4]))
                .await
                .unwrap();
        }
        *fx.state.write() = Some((m.clone(), 4, true));

        let (down_inbox_tx, mut down_rx) = inbox(64);
        let (up_side, _down_side) = relay_pair(down_inbox_tx);
        fx.engine.add_downstream(Arc::clone(&up_side));
        fx.engine.serve_downstream(up_side.id(), 2);

        let frames = collect(&mut down_rx, 4).await;
        match &frames[0].message {
            Message::FileResume { start_chunk, .. } => assert_eq!(*start_chunk, 2),
            other => panic!("expected FILE_RESUME, got {other:?}"),
        }
        assert!(matches!(frames[1].message, Message::FileChunk { index: 2, .. }));
        assert!(matches!(frames[2].message, Message::FileChunk { index: 3, .. }));
        assert!(matches!(frames[3].message, Message::FileEnd { .. }));
    }

    #[tokio::test]
    async fn pump_stops_when_session_advances() {
        let fx = fixture();
        let m = meta(3, 400);
        fx.store.start(Slot::Current, &m.name, 3, 4).await.unwrap();
        fx.store
            .write(Slot::Current, &m.name, 3, 0, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();
        *fx.state.write() = Some((m.clone(), 1, false));

        let (down_inbox_tx, mut down_rx) = inbox(64);
        let (up_side, _down_side) = relay_pair(down_inbox_tx);
        fx.engine.add_downstream(Arc::clone(&up_side));
        fx.engine.serve_downstream(up_side.id(), 0);

        // Header + first staged chunk arrive.
        collect(&mut down_rx, 2).await;

        // A new session replaces the transfer; pump must not emit FILE_END
        // or further session-3 chunks.
        *fx.state.write() = Some((meta(4, 400), 0, false));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(down_rx.try_recv().is_err());
    }
}
