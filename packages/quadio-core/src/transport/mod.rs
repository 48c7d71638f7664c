//! Transport boundary: reliable, ordered, message-oriented links between
//! peers.
//!
//! The engine never talks to a socket directly; it sees [`PeerConnection`]
//! capabilities (send, open, buffered bytes, metadata, close) and receives
//! inbound traffic as [`LinkEvent`]s on a device-wide inbox channel. Both
//! direct and relayed connections implement the same trait, as do the
//! bundled implementations:
//!
//! - [`memory`]: in-process linked pair used by tests and loopback delivery
//! - `net::ws`: WebSocket adapter for real LAN peers

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{ConnectionType, WireFrame};

/// Role of a connection between two peers.
///
/// A guest behind a relay keeps its control link to the host and carries
/// media on a second, `DataRelay`-tagged link to its upstream peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Signalling, sync and (for direct data targets) media.
    Control,
    /// Media fan-out from an upstream relay peer.
    DataRelay,
}

/// Connection metadata visible to the engine.
#[derive(Debug, Clone)]
pub struct LinkMeta {
    /// Opaque id of the peer on the far side.
    pub peer_id: String,
    pub kind: LinkKind,
}

/// Capability interface over one reliable ordered link.
///
/// `send` enqueues without blocking; callers that move bulk data await
/// [`wait_for_drain`] between sends so small control messages are never
/// starved behind media traffic.
pub trait PeerConnection: Send + Sync {
    /// Unique id of this connection on this device.
    fn id(&self) -> &str;

    /// Metadata (far-side peer id, link kind).
    fn meta(&self) -> &LinkMeta;

    /// Whether the link is open for sending.
    fn is_open(&self) -> bool;

    /// Bytes currently queued for the wire on this link.
    fn buffered_bytes(&self) -> usize;

    /// Enqueues a frame for delivery in send order.
    fn send(&self, frame: WireFrame) -> Result<(), TransportError>;

    /// Closes the link. Idempotent.
    fn close(&self);

    /// The transport's knowledge of whether the far side shares our L2
    /// segment (candidate-pair types, socket addresses). Consulted by the
    /// probe timer 1.5 s after open; `Unknown` until the transport can
    /// tell.
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Unknown
    }
}

/// A shared handle to a peer connection.
pub type Link = Arc<dyn PeerConnection>;

/// Inbound traffic and lifecycle notifications from one connection.
pub enum LinkEvent {
    /// The link finished opening. Carries the connection handle, so the
    /// receiver registers it before any frame can refer to it.
    Open(Link),
    /// A frame arrived. Per link, frames are delivered in send order.
    Frame(WireFrame),
    /// The link closed (either side).
    Closed,
    /// The link failed.
    Error(String),
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(link) => f.debug_tuple("Open").field(&link.id()).finish(),
            Self::Frame(frame) => f.debug_tuple("Frame").field(&frame.message).finish(),
            Self::Closed => f.write_str("Closed"),
            Self::Error(reason) => f.debug_tuple("Error").field(reason).finish(),
        }
    }
}

/// An inbox entry: which connection produced the event.
#[derive(Debug)]
pub struct InboundEvent {
    pub conn_id: String,
    pub event: LinkEvent,
}

/// Sender half of a device's inbox. Transport implementations push events
/// here; the device drains them in arrival order without reordering.
pub type InboxSender = mpsc::Sender<InboundEvent>;

/// Receiver half of a device's inbox.
pub type InboxReceiver = mpsc::Receiver<InboundEvent>;

/// Creates a device inbox channel.
#[must_use]
pub fn inbox(capacity: usize) -> (InboxSender, InboxReceiver) {
    mpsc::channel(capacity)
}

/// Interval between outbound-buffer polls while waiting for drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Waits until the link's outbound buffer is below `low_watermark`.
///
/// # Errors
///
/// - [`TransportError::Closed`] if the link closes while waiting.
/// - [`TransportError::BackpressureExhausted`] if the buffer stays above the
///   watermark past `grace`.
pub async fn wait_for_drain(
    conn: &dyn PeerConnection,
    low_watermark: usize,
    grace: Duration,
) -> Result<(), TransportError> {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !conn.is_open() {
            return Err(TransportError::Closed);
        }
        if conn.buffered_bytes() < low_watermark {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TransportError::BackpressureExhausted);
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}
