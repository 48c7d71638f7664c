//! Host/upstream send path: broadcast and unicast of a staged blob.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::TransportError;
use crate::protocol::{Message, SessionId, WireFrame};
use crate::protocol_constants::{
    BACKGROUND_YIELD_EVERY, BACKPRESSURE_GRACE, BROADCAST_YIELD_EVERY, SEND_BUFFER_LOW_WATERMARK,
};
use crate::transport::{wait_for_drain, Link};

use super::TransferMeta;

/// Which slot a transfer addresses; selects FILE_* or PRELOAD_* tags and
/// the pacing cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Current,
    Preload,
}

impl TransferKind {
    fn yield_every(self) -> u64 {
        match self {
            Self::Current => BROADCAST_YIELD_EVERY,
            Self::Preload => BACKGROUND_YIELD_EVERY,
        }
    }
}

/// Sends staged blobs to peers, chunk by chunk, with backpressure waits.
///
/// `active_broadcast` holds the session id the host is currently allowed to
/// broadcast for the current track, `active_preload` the one for the
/// background preload; every loop iteration checks the slot it belongs to
/// and aborts silently when a newer session preempted this one.
pub struct TransferSender {
    chunk_size: usize,
    active_broadcast: AtomicU64,
    active_preload: AtomicU64,
}

impl TransferSender {
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            active_broadcast: AtomicU64::new(0),
            active_preload: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Marks `session_id` as the one allowed to broadcast the current
    /// track; in-flight loops for older sessions observe this and return.
    pub fn set_active(&self, session_id: SessionId) {
        self.active_broadcast.store(session_id, Ordering::SeqCst);
    }

    #[must_use]
    pub fn active(&self) -> SessionId {
        self.active_broadcast.load(Ordering::SeqCst)
    }

    /// Marks `session_id` as the preload allowed to send. A rescheduled
    /// preload replaces it and the superseded transfer loop exits; 0
    /// cancels any in-flight preload (track change, leave).
    pub fn set_active_preload(&self, session_id: SessionId) {
        self.active_preload.store(session_id, Ordering::SeqCst);
    }

    #[must_use]
    pub fn active_preload(&self) -> SessionId {
        self.active_preload.load(Ordering::SeqCst)
    }

    fn preempted(&self, session_id: SessionId, kind: TransferKind) -> bool {
        match kind {
            TransferKind::Current => self.active() != session_id,
            // A preload dies when a newer preload replaces it or a track
            // change allocates a newer current session over it.
            TransferKind::Preload => {
                self.active_preload() != session_id || self.active() > session_id
            }
        }
    }

    /// Broadcasts header + chunks + trailer to every target. A single-peer
    /// session (no targets) is a no-op. Targets that fail drop out of the
    /// loop; the guest-side watchdog recovers them.
    pub async fn broadcast(
        &self,
        targets: &[Link],
        blob: &Bytes,
        meta: &TransferMeta,
        kind: TransferKind,
    ) {
        if targets.is_empty() {
            return;
        }
        let mut alive: Vec<Link> = targets.to_vec();

        let header = WireFrame::control(start_message(meta, kind, 0));
        alive.retain(|link| send_logged(link, header.clone(), meta));

        for chunk_index in 0..meta.total_chunks {
            if self.preempted(meta.session_id, kind) {
                log::debug!(
                    "[Transfer] Broadcast of session {} preempted at chunk {}",
                    meta.session_id,
                    chunk_index
                );
                return;
            }
            if alive.is_empty() {
                return;
            }

            let frame = self.chunk_frame(blob, meta, kind, chunk_index);
            alive.retain(|link| send_logged(link, frame.clone(), meta));

            let mut still_alive = Vec::with_capacity(alive.len());
            for link in alive {
                match wait_for_drain(&*link, SEND_BUFFER_LOW_WATERMARK, BACKPRESSURE_GRACE).await
                {
                    Ok(()) => still_alive.push(link),
                    Err(e) => log::warn!(
                        "[Transfer] Dropping {} from broadcast of {}: {e}",
                        link.meta().peer_id,
                        meta.name
                    ),
                }
            }
            alive = still_alive;

            if (chunk_index + 1) % kind.yield_every() == 0 {
                tokio::task::yield_now().await;
            }
        }

        if self.preempted(meta.session_id, kind) {
            return;
        }
        let trailer = WireFrame::control(end_message(meta, kind));
        for link in &alive {
            send_logged(link, trailer.clone(), meta);
        }
    }

    /// Sends the file to one connection, starting at `start_chunk`
    /// (FILE_RESUME semantics when `start_chunk > 0`). Used for late
    /// joiners and recovery re-serves.
    ///
    /// # Errors
    ///
    /// Transport errors abort this unicast; the guest's recovery backoff
    /// takes over.
    pub async fn unicast(
        &self,
        link: &Link,
        blob: &Bytes,
        meta: &TransferMeta,
        start_chunk: u64,
        kind: TransferKind,
    ) -> Result<(), TransportError> {
        let start_chunk = start_chunk.min(meta.total_chunks.saturating_sub(1));

        link.send(WireFrame::control(start_message(meta, kind, start_chunk)))?;

        for chunk_index in start_chunk..meta.total_chunks {
            if self.preempted(meta.session_id, kind) {
                log::debug!(
                    "[Transfer] Unicast of session {} to {} preempted",
                    meta.session_id,
                    link.meta().peer_id
                );
                return Ok(());
            }
            link.send(self.chunk_frame(blob, meta, kind, chunk_index))?;
            wait_for_drain(&**link, SEND_BUFFER_LOW_WATERMARK, BACKPRESSURE_GRACE).await?;

            if (chunk_index + 1) % kind.yield_every() == 0 {
                tokio::task::yield_now().await;
            }
        }

        if !self.preempted(meta.session_id, kind) {
            link.send(WireFrame::control(end_message(meta, kind)))?;
        }
        Ok(())
    }

    fn chunk_frame(
        &self,
        blob: &Bytes,
        meta: &TransferMeta,
        kind: TransferKind,
        chunk_index: u64,
    ) -> WireFrame {
        let start = (chunk_index as usize) * self.chunk_size;
        let end = (start + self.chunk_size).min(blob.len());
        let payload = blob.slice(start..end);
        let message = match kind {
            TransferKind::Current => Message::FileChunk {
                index: chunk_index,
                session_id: meta.session_id,
                total: meta.total_chunks,
                name: meta.name.clone(),
            },
            TransferKind::Preload => Message::PreloadChunk {
                index: chunk_index,
                session_id: meta.session_id,
                total: meta.total_chunks,
                name: meta.name.clone(),
            },
        };
        WireFrame::with_payload(message, payload)
    }
}

fn start_message(meta: &TransferMeta, kind: TransferKind, start_chunk: u64) -> Message {
    match (kind, start_chunk) {
        (TransferKind::Current, 0) => Message::FileStart {
            name: meta.name.clone(),
            mime: meta.mime.clone(),
            total: meta.total_chunks,
            size: meta.size_bytes,
            index: meta.index,
            session_id: meta.session_id,
        },
        (TransferKind::Current, start_chunk) => Message::FileResume {
            name: meta.name.clone(),
            mime: meta.mime.clone(),
            total: meta.total_chunks,
            size: meta.size_bytes,
            index: meta.index,
            session_id: meta.session_id,
            start_chunk,
        },
        (TransferKind::Preload, _) => Message::PreloadStart {
            name: meta.name.clone(),
            mime: meta.mime.clone(),
            total: meta.total_chunks,
            size: meta.size_bytes,
            index: meta.index,
            session_id: meta.session_id,
            skipped: false,
        },
    }
}

fn end_message(meta: &TransferMeta, kind: TransferKind) -> Message {
    match kind {
        TransferKind::Current => Message::FileEnd {
            name: meta.name.clone(),
            mime: meta.mime.clone(),
            session_id: meta.session_id,
        },
        TransferKind::Preload => Message::PreloadEnd {
            name: meta.name.clone(),
            mime: meta.mime.clone(),
            session_id: meta.session_id,
        },
    }
}

fn send_logged(link: &Link, frame: WireFrame, meta: &TransferMeta) -> bool {
    match link.send(frame) {
        Ok(()) => true,
        Err(e) => {
            log::warn!(
                "[Transfer] Send to {} failed during {}: {e}",
                link.meta().peer_id,
                meta.name
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{link as memory_link, Endpoint};
    use crate::transport::{inbox, InboxReceiver, LinkEvent, LinkKind, LinkMeta};

    fn meta(session_id: SessionId, size: u64, chunk_size: usize) -> TransferMeta {
        TransferMeta {
            name: "t1.wav".into(),
            mime: "audio/wav".into(),
            total_chunks: TransferMeta::total_for(size, chunk_size),
            size_bytes: size,
            index: 0,
            session_id,
        }
    }

    fn pair(tx_a: crate::transport::InboxSender, tx_b: crate::transport::InboxSender) -> (Link, Link) {
        let (a, b) = memory_link(
            Endpoint {
                conn_id: "host-to-guest".into(),
                meta: LinkMeta {
                    peer_id: "guest".into(),
                    kind: LinkKind::Control,
                },
                inbox: tx_a,
            },
            Endpoint {
                conn_id: "guest-to-host".into(),
                meta: LinkMeta {
                    peer_id: "host".into(),
                    kind: LinkKind::Control,
                },
                inbox: tx_b,
            },
        );
        (a, b)
    }

    async fn collect_messages(rx: &mut InboxReceiver, expected: usize) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while frames.len() < expected {
            match rx.recv().await.expect("inbox closed").event {
                LinkEvent::Frame(f) => frames.push(f),
                _ => {}
            }
        }
        frames
    }

    #[tokio::test]
    async fn unicast_sends_header_chunks_trailer() {
        let (host_tx, _host_rx) = inbox(64);
        let (guest_tx, mut guest_rx) = inbox(64);
        let (host_link, _guest_link) = pair(host_tx, guest_tx);

        let sender = TransferSender::new(4);
        sender.set_active(1);
        let blob = Bytes::from_static(b"0123456789"); // 3 chunks of 4
        let meta = meta(1, 10, 4);

        sender
            .unicast(&host_link, &blob, &meta, 0, TransferKind::Current)
            .await
            .unwrap();

        let frames = collect_messages(&mut guest_rx, 5).await;
        assert!(matches!(frames[0].message, Message::FileStart { .. }));
        for (i, frame) in frames[1..4].iter().enumerate() {
            match &frame.message {
                Message::FileChunk { index, total, .. } => {
                    assert_eq!(*index, i as u64);
                    assert_eq!(*total, 3);
                }
                other => panic!("expected chunk, got {other:?}"),
            }
        }
        assert_eq!(&frames[1].payload[..], b"0123");
        assert_eq!(&frames[3].payload[..], b"89", "final chunk may be short");
        assert!(matches!(frames[4].message, Message::FileEnd { .. }));
    }

    #[tokio::test]
    async fn resume_starts_mid_file() {
        let (host_tx, _host_rx) = inbox(64);
        let (guest_tx, mut guest_rx) = inbox(64);
        let (host_link, _guest_link) = pair(host_tx, guest_tx);

        let sender = TransferSender::new(2);
        sender.set_active(5);
        let blob = Bytes::from_static(b"aabbccdd");
        let meta = meta(5, 8, 2);

        sender
            .unicast(&host_link, &blob, &meta, 2, TransferKind::Current)
            .await
            .unwrap();

        let frames = collect_messages(&mut guest_rx, 4).await;
        match &frames[0].message {
            Message::FileResume { start_chunk, .. } => assert_eq!(*start_chunk, 2),
            other => panic!("expected FILE_RESUME, got {other:?}"),
        }
        assert_eq!(&frames[1].payload[..], b"cc");
        assert_eq!(&frames[2].payload[..], b"dd");
        assert!(matches!(frames[3].message, Message::FileEnd { .. }));
    }

    #[tokio::test]
    async fn preemption_aborts_silently_mid_broadcast() {
        let (host_tx, _host_rx) = inbox(256);
        let (guest_tx, mut guest_rx) = inbox(256);
        let (host_link, _guest_link) = pair(host_tx, guest_tx);

        let sender = TransferSender::new(1);
        sender.set_active(7);
        let blob = Bytes::from(vec![0u8; 100]);
        let meta = meta(7, 100, 1);

        // Preempt before the loop runs: every chunk iteration must bail.
        sender.set_active(8);
        sender
            .broadcast(&[host_link], &blob, &meta, TransferKind::Current)
            .await;

        // Header went out (sent before the first check), but no trailer and
        // no chunks for session 7.
        let frames = collect_messages(&mut guest_rx, 1).await;
        assert!(matches!(frames[0].message, Message::FileStart { .. }));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), async {
                collect_messages(&mut guest_rx, 1).await
            })
            .await
            .is_err(),
            "no further frames after preemption"
        );
    }

    #[tokio::test]
    async fn zero_byte_file_is_header_and_trailer_only() {
        let (host_tx, _host_rx) = inbox(64);
        let (guest_tx, mut guest_rx) = inbox(64);
        let (host_link, _guest_link) = pair(host_tx, guest_tx);

        let sender = TransferSender::new(4);
        sender.set_active(1);
        let meta = meta(1, 0, 4);

        sender
            .unicast(&host_link, &Bytes::new(), &meta, 0, TransferKind::Current)
            .await
            .unwrap();

        let frames = collect_messages(&mut guest_rx, 2).await;
        assert!(matches!(frames[0].message, Message::FileStart { total: 0, .. }));
        assert!(matches!(frames[1].message, Message::FileEnd { .. }));
    }

    #[tokio::test]
    async fn preload_kind_uses_preload_tags() {
        let (host_tx, _host_rx) = inbox(64);
        let (guest_tx, mut guest_rx) = inbox(64);
        let (host_link, _guest_link) = pair(host_tx, guest_tx);

        let sender = TransferSender::new(4);
        sender.set_active(1);
        sender.set_active_preload(2);
        let blob = Bytes::from_static(b"next");
        let meta = meta(2, 4, 4);

        sender
            .unicast(&host_link, &blob, &meta, 0, TransferKind::Preload)
            .await
            .unwrap();

        let frames = collect_messages(&mut guest_rx, 3).await;
        assert!(matches!(frames[0].message, Message::PreloadStart { .. }));
        assert!(matches!(frames[1].message, Message::PreloadChunk { .. }));
        assert!(matches!(frames[2].message, Message::PreloadEnd { .. }));
    }

    #[tokio::test]
    async fn newer_preload_preempts_older_preload() {
        let (host_tx, _host_rx) = inbox(256);
        let (guest_tx, mut guest_rx) = inbox(256);
        let (host_link, _guest_link) = pair(host_tx, guest_tx);

        let sender = TransferSender::new(1);
        sender.set_active(1);
        sender.set_active_preload(2);
        let blob = Bytes::from(vec![0u8; 100]);
        let meta = meta(2, 100, 1);

        // A rescheduled preload replaces the active id before the loop for
        // session 2 runs; every chunk iteration must bail.
        sender.set_active_preload(3);
        sender
            .unicast(&host_link, &blob, &meta, 0, TransferKind::Preload)
            .await
            .unwrap();

        let frames = collect_messages(&mut guest_rx, 1).await;
        assert!(matches!(frames[0].message, Message::PreloadStart { .. }));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), async {
                collect_messages(&mut guest_rx, 1).await
            })
            .await
            .is_err(),
            "no chunks or trailer for the superseded preload"
        );
    }

    #[tokio::test]
    async fn track_change_preempts_in_flight_preload() {
        let (host_tx, _host_rx) = inbox(256);
        let (guest_tx, mut guest_rx) = inbox(256);
        let (host_link, _guest_link) = pair(host_tx, guest_tx);

        let sender = TransferSender::new(1);
        sender.set_active(1);
        sender.set_active_preload(2);
        let blob = Bytes::from(vec![0u8; 100]);
        let meta = meta(2, 100, 1);

        // Operator picks a new track: the current session moves past the
        // preload's id and the preload loop exits silently.
        sender.set_active(3);
        sender
            .unicast(&host_link, &blob, &meta, 0, TransferKind::Preload)
            .await
            .unwrap();

        let frames = collect_messages(&mut guest_rx, 1).await;
        assert!(matches!(frames[0].message, Message::PreloadStart { .. }));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), async {
                collect_messages(&mut guest_rx, 1).await
            })
            .await
            .is_err(),
            "no chunks or trailer after the track change"
        );
    }
}
