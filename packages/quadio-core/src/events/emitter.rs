//! Event emitter abstraction for decoupling the engine from transport.
//!
//! Engine components depend on the [`EventEmitter`] trait rather than a
//! concrete channel, enabling testing and alternative delivery (broadcast
//! channel, desktop frontend bridge, ...).

use super::{EngineEvent, PeerEvent, PlaybackEvent, PreloadEvent, SyncEvent, TransferEvent};

/// Trait for emitting engine events without knowledge of delivery.
pub trait EventEmitter: Send + Sync {
    /// Emits one event.
    fn emit(&self, event: EngineEvent);

    /// Emits a peer lifecycle event.
    fn emit_peer(&self, event: PeerEvent) {
        self.emit(event.into());
    }

    /// Emits a transfer progress event.
    fn emit_transfer(&self, event: TransferEvent) {
        self.emit(event.into());
    }

    /// Emits a preload state event.
    fn emit_preload(&self, event: PreloadEvent) {
        self.emit(event.into());
    }

    /// Emits a sync/latency event.
    fn emit_sync(&self, event: SyncEvent) {
        self.emit(event.into());
    }

    /// Emits a playback state event.
    fn emit_playback(&self, event: PlaybackEvent) {
        self.emit(event.into());
    }

    /// Emits a toast message for the UI.
    fn emit_toast(&self, message: String) {
        self.emit(EngineEvent::Toast { message });
    }

    /// Emits a recoverable error scoped to one operation.
    fn emit_error(&self, code: &'static str, message: String) {
        self.emit(EngineEvent::Error { code, message });
    }
}

/// No-op emitter for headless use or testing.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: EngineEvent) {
        // No-op: nothing is listening
    }
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level. Useful for tracing event flow without
/// wiring a subscriber.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: EngineEvent) {
        tracing::debug!(?event, "engine_event");
    }
}
