//! Wire protocol for peer-to-peer session messages.
//!
//! Every message is a tagged object (`type` field, SCREAMING_SNAKE_CASE)
//! with camelCase fields; unknown tags decode to [`Message::Unknown`] for
//! forward compatibility. Chunk payloads are raw bytes carried outside the
//! JSON header: a [`WireFrame`] encodes to
//! `u32 LE header length | JSON header | payload bytes` and rides a single
//! message of the underlying message-oriented transport.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Monotonic integer tagging every byte belonging to one track-load attempt.
pub type SessionId = u64;

// ─────────────────────────────────────────────────────────────────────────────
// Shared Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Peer connection status as published in device lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Whether a peer is on the same L2 segment as the host.
///
/// Derived from ICE candidate-pair types 1.5 s after the connection opens;
/// only `Local` peers receive large media payloads directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Local,
    Remote,
    #[default]
    Unknown,
}

/// Repeat policy applied by the host's auto-advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

/// Playback state tag carried in PAUSE / STATUS_SYNC messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStateTag {
    Idle,
    Paused,
    PlayingAudio,
    PlayingExternal,
}

/// Kind of a playlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    LocalFile,
    ExternalStream,
}

/// One row of a DEVICE_LIST_UPDATE broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    /// Opaque peer id assigned by signalling.
    pub id: String,
    pub label: String,
    pub status: PeerStatus,
    pub is_host: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_op: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<ConnectionType>,
}

/// Playlist entry metadata as it travels in PLAYLIST_UPDATE / STATUS_SYNC.
/// Media bytes never ride playlist messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMeta {
    pub kind: TrackKind,
    pub name: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Sum Type
// ─────────────────────────────────────────────────────────────────────────────

/// Every message the session protocol can carry.
///
/// `FILE_CHUNK` / `PRELOAD_CHUNK` headers describe the chunk; the bytes ride
/// the [`WireFrame`] payload. `index` on chunk messages is the chunk index,
/// on prepare/start messages the playlist index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    // Peer lifecycle
    Welcome {
        label: String,
    },
    SessionFull {
        message: String,
    },
    SessionStart,
    DeviceListUpdate {
        list: Vec<DeviceEntry>,
    },
    ForceCloseDuplicate,

    // Liveness & clock
    Heartbeat,
    HeartbeatAck,
    PingLatency {
        timestamp: u64,
    },
    PongLatency {
        timestamp: u64,
    },
    GetSyncTime {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_ts: Option<u64>,
    },
    SyncResponse {
        /// Host's current track position in seconds.
        time: f64,
        is_playing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_ts: Option<u64>,
    },
    GlobalResyncRequest,

    // Current-file transfer
    FilePrepare {
        name: String,
        index: usize,
        size: u64,
        mime: String,
        session_id: SessionId,
    },
    FileStart {
        name: String,
        mime: String,
        total: u64,
        size: u64,
        index: usize,
        session_id: SessionId,
    },
    FileResume {
        name: String,
        mime: String,
        total: u64,
        size: u64,
        index: usize,
        session_id: SessionId,
        start_chunk: u64,
    },
    FileChunk {
        index: u64,
        session_id: SessionId,
        total: u64,
        name: String,
    },
    FileEnd {
        name: String,
        mime: String,
        session_id: SessionId,
    },
    FileWait {
        message: String,
    },

    // Preload transfer
    PreloadStart {
        name: String,
        mime: String,
        total: u64,
        size: u64,
        index: usize,
        session_id: SessionId,
        /// Header-only: the receiver already caches this playlist index and
        /// only needs to learn the session id that maps to it.
        #[serde(default)]
        skipped: bool,
    },
    PreloadChunk {
        index: u64,
        session_id: SessionId,
        total: u64,
        name: String,
    },
    PreloadEnd {
        name: String,
        mime: String,
        session_id: SessionId,
    },
    PreloadAck {
        index: usize,
    },

    // Recovery & relay
    RequestCurrentFile {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    RequestDataRecovery {
        next_chunk: u64,
        file_name: String,
        index: usize,
        session_id: SessionId,
    },
    AssignDataSource {
        target_id: String,
    },

    // Playback authority
    Play {
        /// Track position in seconds.
        time: f64,
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Pause {
        time: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<PlayerStateTag>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    RequestPlay,
    RequestPause,
    RequestSeek {
        time: f64,
    },
    RequestSkipTime {
        delta: f64,
    },
    RequestNextTrack,
    RequestPrevTrack,
    RequestTrackChange {
        index: usize,
    },
    RequestSetting {
        setting_type: String,
        value: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        band: Option<u32>,
    },
    RepeatMode {
        value: RepeatMode,
    },
    ShuffleMode {
        value: bool,
    },
    PlaylistUpdate {
        list: Vec<TrackMeta>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_track_index: Option<usize>,
    },
    ForceSyncPlay {
        time: f64,
    },
    StatusSync {
        playlist_meta: Vec<TrackMeta>,
        current_track_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat_mode: Option<RepeatMode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_shuffle: Option<bool>,
    },
    OperatorGrant,
    OperatorRevoke,
    SysToast {
        message: String,
    },

    /// Forward-compat: unrecognized tags are ignored, never an error.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Session id carried by media-side messages, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::FilePrepare { session_id, .. }
            | Self::FileStart { session_id, .. }
            | Self::FileResume { session_id, .. }
            | Self::FileChunk { session_id, .. }
            | Self::FileEnd { session_id, .. }
            | Self::PreloadStart { session_id, .. }
            | Self::PreloadChunk { session_id, .. }
            | Self::PreloadEnd { session_id, .. }
            | Self::RequestDataRecovery { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }

    /// Whether this tag is a playback-change request that requires operator
    /// status on the sending peer.
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::RequestPlay
                | Self::RequestPause
                | Self::RequestSeek { .. }
                | Self::RequestSkipTime { .. }
                | Self::RequestNextTrack
                | Self::RequestPrevTrack
                | Self::RequestTrackChange { .. }
                | Self::RequestSetting { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame Codec
// ─────────────────────────────────────────────────────────────────────────────

/// A protocol message plus its out-of-band payload bytes.
///
/// Control messages carry an empty payload. Relays forward a clone of the
/// frame; `Bytes` makes that a cheap handle clone while protecting each
/// consumer's view of the data.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub message: Message,
    pub payload: Bytes,
}

impl WireFrame {
    /// Wraps a control message (no payload).
    #[must_use]
    pub fn control(message: Message) -> Self {
        Self {
            message,
            payload: Bytes::new(),
        }
    }

    /// Wraps a chunk-bearing message with its payload bytes.
    #[must_use]
    pub fn with_payload(message: Message, payload: Bytes) -> Self {
        Self { message, payload }
    }

    /// Total payload + approximate header weight, used for send-buffer
    /// accounting.
    #[must_use]
    pub fn weight(&self) -> usize {
        // Control headers are small; 256 covers the largest chunk header.
        self.payload.len() + 256
    }

    /// Encodes to `u32 LE header length | JSON header | payload`.
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        let header = serde_json::to_vec(&self.message)
            .map_err(|e| TransportError::SendFailed(format!("header encode: {e}")))?;
        let mut buf = BytesMut::with_capacity(4 + header.len() + self.payload.len());
        buf.put_u32_le(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decodes a frame produced by [`WireFrame::encode`].
    pub fn decode(buf: Bytes) -> Result<Self, TransportError> {
        if buf.len() < 4 {
            return Err(TransportError::Decode("frame shorter than header length".into()));
        }
        let header_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() < 4 + header_len {
            return Err(TransportError::Decode(format!(
                "truncated header: need {} bytes, have {}",
                header_len,
                buf.len() - 4
            )));
        }
        let message: Message = serde_json::from_slice(&buf[4..4 + header_len])
            .map_err(|e| TransportError::Decode(format!("header decode: {e}")))?;
        let payload = buf.slice(4 + header_len..);
        Ok(Self { message, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_serialize_screaming_snake_case() {
        let json = serde_json::to_value(&Message::GlobalResyncRequest).unwrap();
        assert_eq!(json["type"], "GLOBAL_RESYNC_REQUEST");

        let json = serde_json::to_value(&Message::FileStart {
            name: "t1.wav".into(),
            mime: "audio/wav".into(),
            total: 10,
            size: 163_840,
            index: 0,
            session_id: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "FILE_START");
        assert_eq!(json["sessionId"], 1);
        assert_eq!(json["total"], 10);
    }

    #[test]
    fn unknown_tags_decode_to_unknown() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"FUTURE_FEATURE","whatever":42}"#).unwrap();
        assert_eq!(msg, Message::Unknown);
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let msg: Message = serde_json::from_str(r#"{"type":"GET_SYNC_TIME"}"#).unwrap();
        assert_eq!(msg, Message::GetSyncTime { req_ts: None });

        let msg: Message =
            serde_json::from_str(r#"{"type":"PAUSE","time":12.5}"#).unwrap();
        assert!(matches!(msg, Message::Pause { time, index: None, .. } if time == 12.5));
    }

    #[test]
    fn frame_roundtrips_with_payload() {
        let payload = Bytes::from_static(b"raw pcm bytes here");
        let frame = WireFrame::with_payload(
            Message::FileChunk {
                index: 7,
                session_id: 3,
                total: 10,
                name: "t1.wav".into(),
            },
            payload.clone(),
        );
        let encoded = frame.encode().unwrap();
        let decoded = WireFrame::decode(encoded).unwrap();
        assert_eq!(decoded.message, frame.message);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn frame_roundtrips_without_payload() {
        let frame = WireFrame::control(Message::Heartbeat);
        let decoded = WireFrame::decode(frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.message, Message::Heartbeat);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(WireFrame::decode(Bytes::from_static(&[1, 0])).is_err());
        // Header length claims more bytes than present
        assert!(WireFrame::decode(Bytes::from_static(&[255, 0, 0, 0, b'{'])).is_err());
    }

    #[test]
    fn requires_operator_covers_playback_requests() {
        assert!(Message::RequestPlay.requires_operator());
        assert!(Message::RequestSeek { time: 3.0 }.requires_operator());
        assert!(!Message::Heartbeat.requires_operator());
        assert!(!Message::PreloadAck { index: 1 }.requires_operator());
    }

    #[test]
    fn session_id_extraction() {
        let msg = Message::FileChunk {
            index: 0,
            session_id: 9,
            total: 1,
            name: "x".into(),
        };
        assert_eq!(msg.session_id(), Some(9));
        assert_eq!(Message::Heartbeat.session_id(), None);
    }
}
