//! Playback state machine over an external audio sink.
//!
//! The DSP graph (EQ, reverb, widener, surround routing) lives outside the
//! engine; [`AudioSink`] is the boundary: it accepts decoded-media buffers,
//! a channel mode and opaque effect parameters, and exposes a monotonic
//! clock. The controller owns `startedAt`/`pausedAt` arithmetic, the
//! play-lock fuse, pending play times for buffers that are not staged yet,
//! and the host-only track-end detection.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::events::{EventEmitter, PlaybackEvent};
use crate::protocol::PlayerStateTag;
use crate::protocol_constants::PLAY_LOCK_FUSE;

/// Which output channel this device renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    #[default]
    Stereo,
    Left,
    Right,
    Center,
    Subwoofer,
}

/// External audio sink boundary.
///
/// Implementations decode and render; the engine only does clock math.
pub trait AudioSink: Send + Sync {
    /// Loads a media buffer for playback.
    ///
    /// # Errors
    ///
    /// A decode rejection; the engine resets the slot and requests
    /// recovery.
    fn load(&self, buffer: Bytes, mime: &str) -> Result<f64, String>;

    /// Starts (or seeks) playback at `position` seconds into the track.
    fn play_from(&self, position: f64);

    fn pause(&self);

    fn stop(&self);

    /// Monotonic sink clock, seconds.
    fn clock(&self) -> f64;

    fn set_channel_mode(&self, mode: ChannelMode);

    /// Opaque effect parameter passthrough (EQ band, reverb, widener, ...).
    fn set_effect(&self, name: &str, value: &serde_json::Value, band: Option<u32>);
}

/// Sink for headless use and tests: renders nothing, keeps honest time.
pub struct NullSink {
    origin: Instant,
    /// Used to fake a duration from a buffer length (16-bit stereo 44.1k).
    bytes_per_second: f64,
}

impl NullSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            bytes_per_second: 176_400.0,
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullSink {
    fn load(&self, buffer: Bytes, _mime: &str) -> Result<f64, String> {
        Ok(buffer.len() as f64 / self.bytes_per_second)
    }

    fn play_from(&self, _position: f64) {}

    fn pause(&self) {}

    fn stop(&self) {}

    fn clock(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn set_channel_mode(&self, _mode: ChannelMode) {}

    fn set_effect(&self, _name: &str, _value: &serde_json::Value, _band: Option<u32>) {}
}

/// What `play_at` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Started,
    /// No buffer loaded yet; the time is parked and consumed by the next
    /// successful load.
    Pending,
    /// The play-lock fuse is held by an in-flight play request.
    Locked,
}

#[derive(Debug, Clone)]
struct LoadedTrack {
    index: usize,
    name: String,
    duration: f64,
}

struct PlayState {
    tag: PlayerStateTag,
    /// Sink-clock instant corresponding to track position 0.
    started_at: f64,
    /// Track position when paused.
    paused_at: f64,
    /// User nudge, seconds.
    local_offset: f64,
    /// Reserved; stays 0 on LAN.
    auto_sync_offset: f64,
    /// Offset sum baked into `started_at` at the last seek; lets a nudge
    /// re-seek shift by exactly the unapplied delta.
    applied_offset: f64,
    pending_play_time: Option<f64>,
    loaded: Option<LoadedTrack>,
    play_lock_until: Option<Instant>,
}

impl Default for PlayState {
    fn default() -> Self {
        Self {
            tag: PlayerStateTag::Idle,
            started_at: 0.0,
            paused_at: 0.0,
            local_offset: 0.0,
            auto_sync_offset: 0.0,
            applied_offset: 0.0,
            pending_play_time: None,
            loaded: None,
            play_lock_until: None,
        }
    }
}

pub(crate) struct PlaybackController {
    sink: Arc<dyn AudioSink>,
    emitter: Arc<dyn EventEmitter>,
    state: Mutex<PlayState>,
}

impl PlaybackController {
    pub fn new(sink: Arc<dyn AudioSink>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            sink,
            emitter,
            state: Mutex::new(PlayState::default()),
        }
    }

    pub fn state_tag(&self) -> PlayerStateTag {
        self.state.lock().tag
    }

    pub fn is_playing(&self) -> bool {
        matches!(
            self.state_tag(),
            PlayerStateTag::PlayingAudio | PlayerStateTag::PlayingExternal
        )
    }

    /// Current track position in seconds.
    pub fn position(&self) -> f64 {
        let state = self.state.lock();
        match state.tag {
            PlayerStateTag::PlayingAudio | PlayerStateTag::PlayingExternal => {
                (self.sink.clock() - state.started_at).max(0.0)
            }
            PlayerStateTag::Paused => state.paused_at,
            PlayerStateTag::Idle => 0.0,
        }
    }

    /// Index of the loaded track, if any.
    pub fn loaded_index(&self) -> Option<usize> {
        self.state.lock().loaded.as_ref().map(|t| t.index)
    }

    pub fn duration(&self) -> f64 {
        self.state
            .lock()
            .loaded
            .as_ref()
            .map_or(0.0, |t| t.duration)
    }

    /// Loads a staged buffer into the sink. Returns the parked play time
    /// if a PLAY arrived before the buffer did.
    pub fn load_buffer(
        &self,
        index: usize,
        name: &str,
        mime: &str,
        blob: Bytes,
    ) -> Result<Option<f64>, String> {
        let duration = self.sink.load(blob, mime)?;
        let mut state = self.state.lock();
        state.loaded = Some(LoadedTrack {
            index,
            name: name.to_string(),
            duration,
        });
        Ok(state.pending_play_time.take())
    }

    /// Forgets the loaded buffer (track change in flight).
    pub fn unload(&self) {
        let mut state = self.state.lock();
        state.loaded = None;
        state.pending_play_time = None;
    }

    /// Plays (or seeks to) `time`, applying the local and auto-sync
    /// offsets. Follows the play-lock discipline: one load+seek+start at a
    /// time, fuse auto-releases after 5 s.
    pub fn play_at(&self, time: f64) -> PlayOutcome {
        let mut state = self.state.lock();
        if state.loaded.is_none() {
            state.pending_play_time = Some(time);
            return PlayOutcome::Pending;
        }
        if let Some(until) = state.play_lock_until {
            if until > Instant::now() {
                return PlayOutcome::Locked;
            }
        }
        state.play_lock_until = Some(Instant::now() + PLAY_LOCK_FUSE);

        let effective = (time + state.local_offset + state.auto_sync_offset).max(0.0);
        self.sink.play_from(effective);
        state.started_at = self.sink.clock() - effective;
        state.applied_offset = state.local_offset + state.auto_sync_offset;
        state.tag = PlayerStateTag::PlayingAudio;
        state.pending_play_time = None;
        state.play_lock_until = None;
        drop(state);

        self.emitter.emit_playback(PlaybackEvent::StateChanged {
            state: PlayerStateTag::PlayingAudio,
        });
        PlayOutcome::Started
    }

    /// Pauses at `time` (or the live position when not given).
    pub fn pause_at(&self, time: Option<f64>) {
        let position = time.unwrap_or_else(|| self.position());
        let mut state = self.state.lock();
        self.sink.pause();
        state.paused_at = position;
        state.tag = PlayerStateTag::Paused;
        drop(state);
        self.emitter.emit_playback(PlaybackEvent::StateChanged {
            state: PlayerStateTag::Paused,
        });
    }

    /// Enters the state-only external-stream mode (no bytes, no sink
    /// buffer; positions still tracked for sync messages).
    pub fn play_external(&self, time: f64) {
        let mut state = self.state.lock();
        state.started_at = self.sink.clock() - time;
        state.tag = PlayerStateTag::PlayingExternal;
        drop(state);
        self.emitter.emit_playback(PlaybackEvent::StateChanged {
            state: PlayerStateTag::PlayingExternal,
        });
    }

    /// Snaps the local clock so the position equals the host's. Used on
    /// SYNC_RESPONSE; a paused host pauses us at that position.
    pub fn snap_to_host(&self, host_time: f64, host_playing: bool) {
        if host_playing {
            let mut state = self.state.lock();
            let effective = host_time + state.local_offset + state.auto_sync_offset;
            state.started_at = self.sink.clock() - effective;
            state.applied_offset = state.local_offset + state.auto_sync_offset;
            if state.tag == PlayerStateTag::Paused {
                self.sink.play_from(effective);
                state.tag = PlayerStateTag::PlayingAudio;
            }
        } else if self.is_playing() {
            self.pause_at(Some(host_time));
        }
    }

    /// Shifts the user nudge offset. Returns the new offset in ms.
    pub fn adjust_local_offset(&self, delta_ms: i64) -> i64 {
        let mut state = self.state.lock();
        state.local_offset += delta_ms as f64 / 1_000.0;
        (state.local_offset * 1_000.0).round() as i64
    }

    /// Applies any offset adjusted since the last seek and re-seeks the
    /// sink there. Called after the nudge debounce.
    pub fn apply_nudge_reseek(&self) {
        let mut state = self.state.lock();
        if !matches!(state.tag, PlayerStateTag::PlayingAudio) {
            return;
        }
        let target = state.local_offset + state.auto_sync_offset;
        let delta = target - state.applied_offset;
        if delta == 0.0 {
            return;
        }
        state.started_at -= delta;
        state.applied_offset = target;
        let position = (self.sink.clock() - state.started_at).max(0.0);
        self.sink.play_from(position);
    }

    /// Host-side end detection from the sink-reported position.
    pub fn track_ended(&self) -> bool {
        let duration = self.duration();
        self.state_tag() == PlayerStateTag::PlayingAudio
            && duration > 0.0
            && self.position() >= duration
    }

    /// Stops the sink and resets to IDLE. Session leave / kick.
    pub fn reset(&self) {
        self.sink.stop();
        let mut state = self.state.lock();
        *state = PlayState::default();
        drop(state);
        self.emitter.emit_playback(PlaybackEvent::StateChanged {
            state: PlayerStateTag::Idle,
        });
    }

    pub fn set_channel_mode(&self, mode: ChannelMode) {
        self.sink.set_channel_mode(mode);
    }

    pub fn set_effect(&self, name: &str, value: &serde_json::Value, band: Option<u32>) {
        self.sink.set_effect(name, value, band);
    }
}
