//! Session-id allocation and validation, plus session codes.
//!
//! Two monotonic counters live here: the id used when *sending* media
//! (`current`) and the newest id *observed* on receive (`local`). Both only
//! ever advance; anything older than `local` is stale and must be
//! discarded without mutating state.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::error::EngineError;
use crate::protocol::SessionId;
use crate::protocol_constants::{SESSION_CODE_DIGITS, SESSION_CODE_RETRIES};

/// Verdict on an inbound session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    /// Matches the local session.
    Current,
    /// Newer than the local session: the receiver must preempt (reset state
    /// for the old session, then adopt this id).
    Newer,
    /// Older than the local session: discard silently.
    Stale,
}

/// Monotonic-per-device session id allocator and validator.
#[derive(Debug, Default)]
pub struct SessionClock {
    /// Id tagged onto outbound media (host-side allocator).
    current: AtomicU64,
    /// Newest id observed on receive.
    local: AtomicU64,
}

impl SessionClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next session id for sending. Also advances the local
    /// id, since the host receives its own traffic on the loopback path.
    pub fn next(&self) -> SessionId {
        let sid = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.advance_local(sid);
        sid
    }

    /// The id currently used for sending.
    #[must_use]
    pub fn current(&self) -> SessionId {
        self.current.load(Ordering::SeqCst)
    }

    /// The newest id observed on receive.
    #[must_use]
    pub fn local(&self) -> SessionId {
        self.local.load(Ordering::SeqCst)
    }

    /// Classifies an inbound session id against the local one.
    #[must_use]
    pub fn check(&self, sid: SessionId) -> SessionCheck {
        let local = self.local();
        if sid < local {
            SessionCheck::Stale
        } else if sid > local {
            SessionCheck::Newer
        } else {
            SessionCheck::Current
        }
    }

    /// Advances the local id to `sid` if that is an advance. Returns whether
    /// the stored value changed. Never moves backwards.
    pub fn advance_local(&self, sid: SessionId) -> bool {
        self.local.fetch_max(sid, Ordering::SeqCst) < sid
    }

    /// Resets both counters. Only valid on session leave.
    pub fn reset(&self) {
        self.current.store(0, Ordering::SeqCst);
        self.local.store(0, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Generates a 6-digit decimal session code, retrying on collision.
///
/// `taken` reports whether a candidate is already claimed (live mDNS
/// registration, signalling-layer registry, ...). Rate-limiting guesses is
/// the signalling layer's responsibility, not ours.
///
/// # Errors
///
/// [`EngineError::CodeExhausted`] after 12 colliding attempts.
pub fn generate_session_code<F>(taken: F) -> Result<String, EngineError>
where
    F: Fn(&str) -> bool,
{
    let mut rng = rand::rng();
    let upper = 10u32.pow(SESSION_CODE_DIGITS);
    for _ in 0..SESSION_CODE_RETRIES {
        let code = format!(
            "{:0width$}",
            rng.random_range(0..upper),
            width = SESSION_CODE_DIGITS as usize
        );
        if !taken(&code) {
            return Ok(code);
        }
    }
    Err(EngineError::CodeExhausted)
}
