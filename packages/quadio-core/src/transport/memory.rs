//! In-process transport: a linked pair of connections bridged by pump
//! tasks.
//!
//! Used by the integration tests (multiple devices in one process) and by a
//! host delivering its own copy of the media over the same code path as
//! remote guests. Frames are accounted against an outbound byte counter
//! until the pump hands them to the far inbox, which makes backpressure
//! observable; tests can pause a direction to simulate a congested or
//! stalled link.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::error::TransportError;
use crate::protocol::WireFrame;
use crate::transport::{InboundEvent, InboxSender, LinkEvent, LinkMeta, PeerConnection};

/// One endpoint of a memory link, described by the device that owns it.
pub struct Endpoint {
    /// Connection id unique on the owning device.
    pub conn_id: String,
    /// Metadata the owning device sees (far-side peer id, link kind).
    pub meta: LinkMeta,
    /// The owning device's inbox.
    pub inbox: InboxSender,
}

struct Shared {
    closed: AtomicBool,
    close_notify: Notify,
}

/// One side of a linked pair.
pub struct MemoryConnection {
    conn_id: String,
    meta: LinkMeta,
    outbound: mpsc::UnboundedSender<WireFrame>,
    buffered: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
    drop_media: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    /// Pauses or resumes delivery of frames sent from this side.
    ///
    /// While paused, sends still succeed and accumulate in the outbound
    /// buffer, exactly like a congested link.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Drops media chunk frames sent from this side (control traffic still
    /// crosses). Simulates a lossy path for recovery tests.
    pub fn set_drop_media(&self, drop_media: bool) {
        self.drop_media.store(drop_media, Ordering::SeqCst);
    }
}

impl PeerConnection for MemoryConnection {
    fn id(&self) -> &str {
        &self.conn_id
    }

    fn meta(&self) -> &LinkMeta {
        &self.meta
    }

    fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.buffered.fetch_add(frame.weight(), Ordering::SeqCst);
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.close_notify.notify_waiters();
        }
    }

    fn connection_type(&self) -> crate::protocol::ConnectionType {
        // Both endpoints live in this process.
        crate::protocol::ConnectionType::Local
    }
}

/// Creates a linked pair of connections between two devices.
///
/// Returns `(a_side, b_side)`: `a_side` is what device A uses to reach B,
/// and vice versa. Both devices receive [`LinkEvent::Open`] immediately and
/// [`LinkEvent::Closed`] once either side closes.
pub fn link(a: Endpoint, b: Endpoint) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        close_notify: Notify::new(),
    });

    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a_buffered = Arc::new(AtomicUsize::new(0));
    let b_buffered = Arc::new(AtomicUsize::new(0));
    let a_paused = Arc::new(AtomicBool::new(false));
    let b_paused = Arc::new(AtomicBool::new(false));
    let a_drop = Arc::new(AtomicBool::new(false));
    let b_drop = Arc::new(AtomicBool::new(false));

    let a_side = Arc::new(MemoryConnection {
        conn_id: a.conn_id.clone(),
        meta: a.meta,
        outbound: a_tx,
        buffered: Arc::clone(&a_buffered),
        paused: Arc::clone(&a_paused),
        drop_media: Arc::clone(&a_drop),
        shared: Arc::clone(&shared),
    });
    let b_side = Arc::new(MemoryConnection {
        conn_id: b.conn_id.clone(),
        meta: b.meta,
        outbound: b_tx,
        buffered: Arc::clone(&b_buffered),
        paused: Arc::clone(&b_paused),
        drop_media: Arc::clone(&b_drop),
        shared: Arc::clone(&shared),
    });

    // A's sends pump into B's inbox and vice versa.
    spawn_pump(
        a_rx,
        a_buffered,
        a_paused,
        a_drop,
        Arc::clone(&shared),
        b.inbox.clone(),
        b.conn_id.clone(),
    );
    spawn_pump(
        b_rx,
        b_buffered,
        b_paused,
        b_drop,
        Arc::clone(&shared),
        a.inbox.clone(),
        a.conn_id.clone(),
    );

    let _ = a.inbox.try_send(InboundEvent {
        conn_id: a.conn_id,
        event: LinkEvent::Open(Arc::clone(&a_side) as crate::transport::Link),
    });
    let _ = b.inbox.try_send(InboundEvent {
        conn_id: b.conn_id,
        event: LinkEvent::Open(Arc::clone(&b_side) as crate::transport::Link),
    });

    (a_side, b_side)
}

const PAUSE_POLL: Duration = Duration::from_millis(5);

fn spawn_pump(
    mut rx: mpsc::UnboundedReceiver<WireFrame>,
    buffered: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
    drop_media: Arc<AtomicBool>,
    shared: Arc<Shared>,
    dest_inbox: InboxSender,
    dest_conn_id: String,
) {
    tokio::spawn(async move {
        let deliver = |frame: WireFrame,
                       buffered: Arc<AtomicUsize>,
                       dest_inbox: InboxSender,
                       dest_conn_id: String,
                       drop_media: Arc<AtomicBool>| async move {
            let weight = frame.weight();
            let is_media = matches!(
                frame.message,
                crate::protocol::Message::FileChunk { .. }
                    | crate::protocol::Message::PreloadChunk { .. }
            );
            if drop_media.load(Ordering::SeqCst) && is_media {
                buffered.fetch_sub(weight, Ordering::SeqCst);
                return true;
            }
            let delivered = dest_inbox
                .send(InboundEvent {
                    conn_id: dest_conn_id,
                    event: LinkEvent::Frame(frame),
                })
                .await
                .is_ok();
            buffered.fetch_sub(weight, Ordering::SeqCst);
            delivered
        };

        loop {
            let frame = tokio::select! {
                f = rx.recv() => match f {
                    Some(f) => f,
                    None => break,
                },
                _ = shared.close_notify.notified() => {
                    // Reliable delivery: frames accepted before the close
                    // still reach the far side.
                    while let Ok(frame) = rx.try_recv() {
                        if !deliver(
                            frame,
                            Arc::clone(&buffered),
                            dest_inbox.clone(),
                            dest_conn_id.clone(),
                            Arc::clone(&drop_media),
                        )
                        .await
                        {
                            break;
                        }
                    }
                    break;
                }
            };
            while paused.load(Ordering::SeqCst) && !shared.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(PAUSE_POLL).await;
            }
            if !deliver(
                frame,
                Arc::clone(&buffered),
                dest_inbox.clone(),
                dest_conn_id.clone(),
                Arc::clone(&drop_media),
            )
            .await
            {
                break;
            }
        }
        // Make sure the far side learns about teardown even when the close
        // originated locally.
        shared.closed.store(true, Ordering::SeqCst);
        let _ = dest_inbox
            .send(InboundEvent {
                conn_id: dest_conn_id,
                event: LinkEvent::Closed,
            })
            .await;
    });
}
