//! Internal cross-engine notifications.
//!
//! Watchdog timers and transfer completions run in background tasks; they
//! post a [`Signal`] to the device loop, which owns the policy reaction
//! (request recovery, finalize a blob, broadcast a resync, ...). Engines
//! stay mechanism-only.

use tokio::sync::mpsc;

use crate::transfer::TransferMeta;

#[derive(Debug)]
pub(crate) enum Signal {
    /// The current file finished staging and verified clean.
    FileComplete { meta: TransferMeta },
    /// A preload finished staging and verified clean.
    PreloadFinalized { meta: TransferMeta },
    /// A stall, prepare timeout or integrity failure wants a resend.
    NeedRecovery {
        /// Chunk to resume from; `None` means the current received count.
        next_chunk: Option<u64>,
        /// Bypass the relay upstream and ask the host directly.
        force_host: bool,
    },
    /// The recovery backoff elapsed; retry if still pending.
    RecoveryRetry,
    /// The sink position passed the track duration (host auto-advance).
    TrackEnded,
    /// Guest: issue GET_SYNC_TIME now (resync jitter elapsed).
    DoResync,
    /// Host: broadcast GLOBAL_RESYNC_REQUEST (post play/seek delay).
    HostResyncBroadcast,
    /// Host: sweep peers whose heartbeats went silent.
    HeartbeatSweep,
    /// Guest tick: send HEARTBEAT upstream.
    SendHeartbeat,
    /// Guest tick: send PING_LATENCY upstream.
    SendPing,
    /// Preload debounce elapsed; compute and transfer the next track.
    SchedulePreload,
    /// Preload watchdog: clear "preparing next" state.
    PreloadTimeout,
    /// Manual nudge debounce elapsed; re-seek at the adjusted position.
    NudgeReseek,
    /// Probe a peer's connection type (1.5 s after open).
    IceProbe { peer_id: String },
}

pub(crate) type SignalSender = mpsc::UnboundedSender<Signal>;
pub(crate) type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

pub(crate) fn channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}
