//! Fixed protocol constants that should NOT be changed.
//!
//! These values are part of the session protocol: every device in a session
//! must agree on them (or receive them over the wire) for transfers and
//! clock sync to interoperate.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Session Shape
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum simultaneous guests (slots 1..=MAX_GUESTS).
pub const MAX_GUESTS: usize = 3;

/// Bytes per media chunk. The final chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 16_384;

/// Number of decimal digits in a session code.
pub const SESSION_CODE_DIGITS: u32 = 6;

/// Collision retries when generating a session code.
pub const SESSION_CODE_RETRIES: usize = 12;

// ─────────────────────────────────────────────────────────────────────────────
// Transfer Pacing
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound send-buffer low watermark (bytes). After each chunk the sender
/// waits until every target connection is below this before continuing.
pub const SEND_BUFFER_LOW_WATERMARK: usize = 512 * 1024;

/// Grace period for a connection stuck above the watermark before the
/// unicast is aborted and guest-side recovery takes over.
pub const BACKPRESSURE_GRACE: Duration = Duration::from_secs(30);

/// Yield to the scheduler every N chunks during a current-file broadcast so
/// control messages (sync, ping, heartbeat) get through.
pub const BROADCAST_YIELD_EVERY: u64 = 50;

/// Yield cadence for preload transfers and relay catch-up (they run in the
/// background, so they yield more often).
pub const BACKGROUND_YIELD_EVERY: u64 = 10;

/// Flush the staging file durably every N chunks written.
pub const FLUSH_EVERY_CHUNKS: u64 = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Chunk Store
// ─────────────────────────────────────────────────────────────────────────────

/// Lock-freshness window for the current slot: a writer lock older than this
/// may be stolen by an equal-or-newer session.
pub const LOCK_FRESHNESS_CURRENT: Duration = Duration::from_secs(60);

/// Lock-freshness window for the preload slot.
pub const LOCK_FRESHNESS_PRELOAD: Duration = Duration::from_secs(20);

// ─────────────────────────────────────────────────────────────────────────────
// Watchdogs & Timeouts
// ─────────────────────────────────────────────────────────────────────────────

/// Delay after connection open before probing ICE candidate-pair types.
pub const ICE_PROBE_DELAY: Duration = Duration::from_millis(1500);

/// Guest dial timeout for reaching the host.
pub const HOST_UNREACHABLE_TIMEOUT: Duration = Duration::from_secs(15);

/// FILE_PREPARE -> FILE_START watchdog.
pub const PREPARE_WATCHDOG: Duration = Duration::from_secs(15);

/// Chunk watchdog tick interval.
pub const CHUNK_WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// Zero-progress threshold before the chunk watchdog fires recovery.
pub const CHUNK_STALL_THRESHOLD: Duration = Duration::from_secs(5);

/// After a relay replies FILE_WAIT, how long the downstream waits for data
/// before requesting recovery from the host instead.
pub const FILE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay connect timeout.
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Catch-up pump: a chunk read outstanding longer than this is retried.
pub const CATCHUP_READ_STUCK: Duration = Duration::from_secs(6);

/// Total timeout to clear the "preparing next track" state.
pub const PRELOAD_WATCHDOG: Duration = Duration::from_secs(30);

/// Debounce before scheduling a preload after a track/playlist change.
pub const PRELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Early preload chunks buffered before PRELOAD_START is observed. Beyond
/// this the whole early buffer is dropped.
pub const PRELOAD_EARLY_CHUNK_LIMIT: usize = 128;

// ─────────────────────────────────────────────────────────────────────────────
// Heartbeat / Ping / Sync
// ─────────────────────────────────────────────────────────────────────────────

/// Guest heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// No inbound heartbeat within this window closes the connection (host side).
pub const HEARTBEAT_TIMEOUT_MS: u64 = 15_000;

/// Latency ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(2);

/// RTT samples kept for the latency estimate (min-of-N denoises GC pauses).
pub const RTT_HISTORY_LEN: usize = 10;

/// Host reply latency above which a sync response is considered "busy".
pub const SYNC_BUSY_THRESHOLD_MS: u64 = 150;

/// Retries after a busy sync response.
pub const SYNC_BUSY_RETRIES: u32 = 2;

/// Delay between busy-sync retries.
pub const SYNC_BUSY_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Upper bound of the random jitter applied before answering a global resync.
pub const RESYNC_JITTER_MAX: Duration = Duration::from_millis(500);

/// Host schedules a global resync this long after every local play/seek.
pub const HOST_RESYNC_DELAY: Duration = Duration::from_secs(1);

/// Debounce applied to the re-seek after a manual sync nudge.
pub const NUDGE_DEBOUNCE: Duration = Duration::from_millis(450);

// ─────────────────────────────────────────────────────────────────────────────
// Playback
// ─────────────────────────────────────────────────────────────────────────────

/// Fuse around a single play request ("load + seek + start").
pub const PLAY_LOCK_FUSE: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Recovery
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded exponential backoff between recovery attempts (ms).
pub const RECOVERY_BACKOFF_MS: [u64; 3] = [2_000, 5_000, 10_000];

/// Maximum recovery attempts per stall.
pub const MAX_RECOVERY_RETRIES: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in protocol data (device labels, mDNS instance names).
pub const APP_NAME: &str = "Quadio";

/// mDNS service type used to advertise a host session on the LAN.
pub const MDNS_SERVICE_TYPE: &str = "_quadio._tcp.local.";

/// Capacity of the engine event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Capacity of the per-device inbound link-event channel.
pub const INBOX_CAPACITY: usize = 1024;
