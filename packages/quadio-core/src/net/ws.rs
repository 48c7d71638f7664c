//! WebSocket transport links.
//!
//! Host side: an axum listener upgrades `/ws?peer=<id>&kind=<control|relay>`
//! into a [`PeerConnection`] and feeds the device inbox. Guest side: a
//! tokio-tungstenite dialer producing the same shape. Outbound frames are
//! queued per connection with byte accounting, so the engine's
//! backpressure waits see real buffered sizes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::device::Device;
use crate::error::{EngineError, EngineResult, TransportError};
use crate::protocol::{ConnectionType, WireFrame};
use crate::protocol_constants::HOST_UNREACHABLE_TIMEOUT;
use crate::transport::{InboundEvent, InboxSender, LinkEvent, LinkKind, LinkMeta, PeerConnection};

use super::classify_remote_ip;

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

struct Outbound {
    data: Bytes,
    weight: usize,
}

/// One WebSocket-backed peer link.
pub struct WsConnection {
    conn_id: String,
    meta: LinkMeta,
    open: AtomicBool,
    buffered: AtomicUsize,
    tx: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    connection_type: ConnectionType,
}

impl PeerConnection for WsConnection {
    fn id(&self) -> &str {
        &self.conn_id
    }

    fn meta(&self) -> &LinkMeta {
        &self.meta
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let data = frame.encode()?;
        let weight = data.len();
        self.buffered.fetch_add(weight, Ordering::SeqCst);
        self.tx
            .send(Outbound { data, weight })
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
    }

    fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host Listener
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks live WebSocket connections with force-close-all capability.
pub struct WsConnectionManager {
    next_id: AtomicU64,
    tokens: dashmap::DashMap<String, CancellationToken>,
}

impl WsConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tokens: dashmap::DashMap::new(),
        }
    }

    fn register(&self) -> (String, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("ws-{id}");
        let token = CancellationToken::new();
        self.tokens.insert(conn_id.clone(), token.clone());
        log::info!("[WS] Connection registered: {conn_id} (total: {})", self.tokens.len());
        (conn_id, token)
    }

    fn unregister(&self, conn_id: &str) {
        if self.tokens.remove(conn_id).is_some() {
            log::info!(
                "[WS] Connection unregistered: {conn_id} (remaining: {})",
                self.tokens.len()
            );
        }
    }

    /// Signals every connection handler to terminate. Session leave.
    pub fn close_all(&self) -> usize {
        let count = self.tokens.len();
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }
        count
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.tokens.len()
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct WsState {
    device: Arc<Device>,
    manager: Arc<WsConnectionManager>,
}

/// A running host listener.
pub struct WsServer {
    pub addr: SocketAddr,
    pub manager: Arc<WsConnectionManager>,
    handle: JoinHandle<()>,
}

impl WsServer {
    pub fn shutdown(&self) {
        self.manager.close_all();
        self.handle.abort();
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Binds the host's WebSocket listener. Port 0 auto-assigns.
pub async fn serve(device: Arc<Device>, bind: SocketAddr) -> EngineResult<WsServer> {
    let manager = Arc::new(WsConnectionManager::new());
    let state = WsState {
        device,
        manager: Arc::clone(&manager),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { crate::protocol_constants::APP_NAME }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| EngineError::Configuration(format!("bind {bind}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| EngineError::Configuration(e.to_string()))?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            log::error!("[WS] Listener failed: {e}");
        }
    });

    log::info!("[WS] Listening on {addr}");
    Ok(WsServer {
        addr,
        manager,
        handle,
    })
}

async fn ws_handler(
    State(state): State<WsState>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket, params, remote))
}

async fn handle_socket(
    state: WsState,
    socket: WebSocket,
    params: HashMap<String, String>,
    remote: SocketAddr,
) {
    let peer_id = params
        .get("peer")
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let kind = match params.get("kind").map(String::as_str) {
        Some("relay") => LinkKind::DataRelay,
        _ => LinkKind::Control,
    };
    let (conn_id, cancel) = state.manager.register();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let link = Arc::new(WsConnection {
        conn_id: conn_id.clone(),
        meta: LinkMeta {
            peer_id: peer_id.clone(),
            kind,
        },
        open: AtomicBool::new(true),
        buffered: AtomicUsize::new(0),
        tx: out_tx,
        cancel: cancel.clone(),
        connection_type: classify_remote_ip(remote.ip()),
    });

    let inbox = state.device.inbox_sender();
    let _ = inbox
        .send(InboundEvent {
            conn_id: conn_id.clone(),
            event: LinkEvent::Open(Arc::clone(&link) as crate::transport::Link),
        })
        .await;

    let (ws_sink, ws_stream) = socket.split();
    run_pumps(
        ws_sink,
        ws_stream,
        out_rx,
        Arc::clone(&link),
        inbox,
        cancel,
    )
    .await;

    state.manager.unregister(&conn_id);
}

/// Runs the read and write halves until either side ends, then posts
/// Closed to the inbox.
async fn run_pumps(
    mut ws_sink: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    link: Arc<WsConnection>,
    inbox: InboxSender,
    cancel: CancellationToken,
) {
    let conn_id = link.conn_id.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = out_rx.recv() => {
                let Some(Outbound { data, weight }) = outbound else { break };
                let result = ws_sink.send(WsMessage::Binary(data)).await;
                link.buffered.fetch_sub(weight, Ordering::SeqCst);
                if result.is_err() {
                    break;
                }
            }
            inbound = ws_stream.next() => {
                match inbound {
                    Some(Ok(WsMessage::Binary(data))) => {
                        match WireFrame::decode(data) {
                            Ok(frame) => {
                                let _ = inbox.send(InboundEvent {
                                    conn_id: conn_id.clone(),
                                    event: LinkEvent::Frame(frame),
                                }).await;
                            }
                            Err(e) => log::warn!("[WS] Dropping undecodable frame: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = inbox.send(InboundEvent {
                            conn_id: conn_id.clone(),
                            event: LinkEvent::Error(e.to_string()),
                        }).await;
                        break;
                    }
                }
            }
        }
    }

    link.open.store(false, Ordering::SeqCst);
    let _ = ws_sink.send(WsMessage::Close(None)).await;
    let _ = inbox
        .send(InboundEvent {
            conn_id,
            event: LinkEvent::Closed,
        })
        .await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Guest Dialer
// ─────────────────────────────────────────────────────────────────────────────

/// Dials a host (or relay upstream) and returns the link. The caller
/// passes it to [`Device::join_session`] or
/// [`Device::attach_upstream_data`].
///
/// # Errors
///
/// [`EngineError::HostUnreachable`] when the dial times out or is refused.
pub async fn dial(
    device: &Arc<Device>,
    addr: SocketAddr,
    kind: LinkKind,
) -> EngineResult<Arc<WsConnection>> {
    let kind_param = match kind {
        LinkKind::Control => "control",
        LinkKind::DataRelay => "relay",
    };
    let url = format!("ws://{addr}/ws?peer={}&kind={kind_param}", device.id());

    let (stream, _response) = tokio::time::timeout(
        HOST_UNREACHABLE_TIMEOUT,
        tokio_tungstenite::connect_async(&url),
    )
    .await
    .map_err(|_| EngineError::HostUnreachable(format!("{addr}: dial timed out")))?
    .map_err(|e| EngineError::HostUnreachable(format!("{addr}: {e}")))?;

    let conn_id = format!("dial-{}", uuid::Uuid::new_v4());
    let cancel = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let link = Arc::new(WsConnection {
        conn_id: conn_id.clone(),
        meta: LinkMeta {
            peer_id: format!("host@{addr}"),
            kind,
        },
        open: AtomicBool::new(true),
        buffered: AtomicUsize::new(0),
        tx: out_tx,
        cancel: cancel.clone(),
        connection_type: classify_remote_ip(addr.ip()),
    });

    let inbox = device.inbox_sender();
    let _ = inbox
        .send(InboundEvent {
            conn_id: conn_id.clone(),
            event: LinkEvent::Open(Arc::clone(&link) as crate::transport::Link),
        })
        .await;

    let (mut ws_sink, mut ws_stream) = stream.split();
    let pump_link = Arc::clone(&link);
    tokio::spawn(async move {
        use tokio_tungstenite::tungstenite::Message as TgMessage;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outbound = out_rx.recv() => {
                    let Some(Outbound { data, weight }) = outbound else { break };
                    let result = ws_sink.send(TgMessage::Binary(data.to_vec())).await;
                    pump_link.buffered.fetch_sub(weight, Ordering::SeqCst);
                    if result.is_err() {
                        break;
                    }
                }
                inbound = ws_stream.next() => {
                    match inbound {
                        Some(Ok(TgMessage::Binary(data))) => {
                            match WireFrame::decode(Bytes::from(data)) {
                                Ok(frame) => {
                                    let _ = inbox.send(InboundEvent {
                                        conn_id: conn_id.clone(),
                                        event: LinkEvent::Frame(frame),
                                    }).await;
                                }
                                Err(e) => log::warn!("[WS] Dropping undecodable frame: {e}"),
                            }
                        }
                        Some(Ok(TgMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = inbox.send(InboundEvent {
                                conn_id: conn_id.clone(),
                                event: LinkEvent::Error(e.to_string()),
                            }).await;
                            break;
                        }
                    }
                }
            }
        }
        pump_link.open.store(false, Ordering::SeqCst);
        let _ = inbox.send(InboundEvent {
            conn_id,
            event: LinkEvent::Closed,
        }).await;
    });

    Ok(link)
}
