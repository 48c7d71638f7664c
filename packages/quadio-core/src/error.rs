//! Centralized error types for the Quadio core library.
//!
//! One enum per failure domain, each with a machine-readable `code()` so an
//! embedding UI can map failures to dialogs without string matching.

use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for event payloads.
    fn code(&self) -> &'static str;
}

/// Errors from the chunk store (staging storage for received media).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid inputs (empty filename, zero chunk size, bad session id).
    #[error("Bad arguments: {0}")]
    BadArgs(String),

    /// Slot is locked by a fresh, equal-or-newer session.
    #[error("Slot locked by session {holder}")]
    Locked {
        /// Session id currently holding the slot lock.
        holder: u64,
    },

    /// Declared total differs from the staged file size at `end` and the
    /// file is short (excess is truncated instead).
    #[error("Integrity failure: expected {expected} bytes, have {actual}")]
    IntegrityFail {
        /// Declared total bytes.
        expected: u64,
        /// Actual staged file size.
        actual: u64,
    },

    /// Command addressed a slot that has no active file.
    #[error("Slot not started")]
    NotStarted,

    /// The background I/O worker is gone; the slot is invalid until reset.
    #[error("Store worker unavailable")]
    WorkerGone,

    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::BadArgs(_) => "bad_args",
            Self::Locked { .. } => "locked",
            Self::IntegrityFail { .. } => "integrity_fail",
            Self::NotStarted => "not_started",
            Self::WorkerGone => "worker_gone",
            Self::Io(_) => "io_error",
        }
    }
}

/// Errors from a peer connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("Connection closed")]
    Closed,

    /// A send failed at the transport layer.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Outbound buffer stayed above the watermark past the grace period.
    #[error("Backpressure grace exceeded")]
    BackpressureExhausted,

    /// Inbound frame could not be decoded.
    #[error("Frame decode failed: {0}")]
    Decode(String),
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::Closed => "connection_closed",
            Self::SendFailed(_) => "send_failed",
            Self::BackpressureExhausted => "backpressure_exhausted",
            Self::Decode(_) => "frame_decode_failed",
        }
    }
}

/// Application-wide error type for session operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// All guest slots are taken.
    #[error("Session is full")]
    SessionFull,

    /// Message carried a session id older than the local one.
    #[error("Stale session id {got} (local {local})")]
    StaleSession {
        /// Session id received.
        got: u64,
        /// Local session id.
        local: u64,
    },

    /// The host could not be reached within the dial timeout.
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    /// No session code could be allocated (all attempts collided).
    #[error("Could not allocate a session code")]
    CodeExhausted,

    /// Configuration failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The audio sink rejected a buffer.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Chunk store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl EngineError {
    /// Returns a machine-readable error code for event payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionFull => "session_full",
            Self::StaleSession { .. } => "stale_session",
            Self::HostUnreachable(_) => "host_unreachable",
            Self::CodeExhausted => "code_exhausted",
            Self::Configuration(_) => "configuration_error",
            Self::Decode(_) => "decode_failed",
            Self::Store(e) => e.code(),
            Self::Transport(e) => e.code(),
        }
    }
}

/// Convenient Result alias for engine-wide operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result alias for chunk store operations.
pub type StoreResult<T> = Result<T, StoreError>;
