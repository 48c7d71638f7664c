//! Quadio Core - distributed session engine for LAN multi-room audio.
//!
//! This crate turns several devices on one local network into a single
//! synchronized player: one host, up to three guests, every device playing
//! the same track at the same position while rendering a different channel.
//! It is designed to be embedded by a desktop app and by the standalone
//! headless server.
//!
//! # Architecture
//!
//! The crate is organized into leaf-first modules:
//!
//! - [`store`]: session-scoped on-disk staging of received media
//! - [`timers`]: named, replaceable timers with guaranteed cancellation
//! - [`session`]: monotonic session-id allocation and session codes
//! - [`transport`]: the peer-link capability boundary (+ in-memory links)
//! - [`protocol`]: tagged wire messages and the binary frame codec
//! - [`peers`]: host-side slot directory and liveness bookkeeping
//! - [`transfer`]: ordered chunk delivery with reorder buffering
//! - [`preload`]: background staging of the next track
//! - [`recovery`]: stall-driven resend requests with bounded backoff
//! - [`relay`]: downstream fan-out and the catch-up pump
//! - [`sync`]: heartbeats, RTT sampling and clock alignment
//! - [`playback`]: the state machine over an external audio sink
//! - [`device`]: the composition root and protocol router
//! - [`net`]: WebSocket transport adapter and mDNS signalling
//!
//! # Abstraction Traits
//!
//! Platform-specific pieces sit behind traits with bundled defaults:
//!
//! - [`AudioSink`](playback::AudioSink): decoding and rendering (the DSP
//!   graph is an external collaborator; [`NullSink`](playback::NullSink)
//!   ships for headless use)
//! - [`PeerConnection`](transport::PeerConnection): reliable ordered links
//! - [`EventEmitter`](events::EventEmitter): delivery of engine events
//! - [`TaskSpawner`](runtime::TaskSpawner): background task spawning

#![warn(clippy::all)]

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod net;
pub mod peers;
pub mod playback;
pub mod playlist;
pub mod preload;
pub mod protocol;
pub mod protocol_constants;
pub mod recovery;
pub mod relay;
pub mod runtime;
pub mod session;
mod signal;
pub mod store;
pub mod sync;
pub mod timers;
pub mod transfer;
pub mod transport;
pub mod utils;

// Re-export commonly used types at the crate root
pub use config::{EngineConfig, IceServer, SignalingServer};
pub use device::{Device, Role};
pub use error::{EngineError, EngineResult, ErrorCode, StoreError, TransportError};
pub use events::{
    EngineEvent, EventBridge, EventEmitter, LoggingEventEmitter, NoopEventEmitter, PeerEvent,
    PlaybackEvent, PreloadEvent, SyncEvent, TransferEvent,
};
pub use playback::{AudioSink, ChannelMode, NullSink};
pub use playlist::{Playlist, PlaylistItem};
pub use protocol::{
    ConnectionType, DeviceEntry, Message, PeerStatus, PlayerStateTag, RepeatMode, SessionId,
    TrackKind, TrackMeta, WireFrame,
};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use session::generate_session_code;
pub use store::{ChunkStore, Slot};
pub use timers::TimerRegistry;
pub use transport::{InboundEvent, Link, LinkEvent, LinkKind, LinkMeta, PeerConnection};
pub use utils::now_millis;
