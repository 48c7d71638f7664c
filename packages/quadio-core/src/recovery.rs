//! Guest-initiated resend requests with bounded exponential backoff.
//!
//! The chunk/prepare watchdogs detect stalls and ask for recovery; this
//! engine dedupes those asks while a backoff is pending, caps the attempt
//! count, and cancels cleanly when the track changes under the stalled
//! transfer. The actual REQUEST_DATA_RECOVERY send (and the choice of
//! upstream relay vs host) stays with the device router; the host-side
//! re-serve lives there too.

use parking_lot::Mutex;

use crate::protocol::SessionId;
use crate::signal::{Signal, SignalSender};
use crate::timers::{TimerRegistry, TIMER_RECOVERY_BACKOFF};

/// One in-flight recovery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecovery {
    pub file_name: String,
    pub index: usize,
    pub session_id: SessionId,
    pub next_chunk: u64,
    /// Attempts sent so far (1-based after the first send).
    pub attempt: u32,
}

/// Verdict when a backoff elapses.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send another request with these parameters.
    Retry(PendingRecovery),
    /// The track changed under the stall; counter reset, nothing to send.
    Cancelled,
    /// Attempt budget spent; give up and surface an error.
    Exhausted(PendingRecovery),
}

pub(crate) struct RecoveryEngine {
    backoff_ms: Vec<u64>,
    max_retries: u32,
    timers: TimerRegistry,
    signals: SignalSender,
    pending: Mutex<Option<PendingRecovery>>,
}

impl RecoveryEngine {
    pub fn new(
        backoff_ms: Vec<u64>,
        max_retries: u32,
        timers: TimerRegistry,
        signals: SignalSender,
    ) -> Self {
        Self {
            backoff_ms,
            max_retries,
            timers,
            signals,
            pending: Mutex::new(None),
        }
    }

    /// Opens a recovery cycle for the stalled transfer.
    ///
    /// Returns the request to send, or `None` while a backoff is already
    /// pending (watchdog ticks during the wait are deduped here).
    pub fn begin(
        &self,
        file_name: &str,
        index: usize,
        session_id: SessionId,
        next_chunk: u64,
    ) -> Option<PendingRecovery> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return None;
        }
        let request = PendingRecovery {
            file_name: file_name.to_string(),
            index,
            session_id,
            next_chunk,
            attempt: 1,
        };
        *pending = Some(request.clone());
        drop(pending);

        self.arm_backoff(0);
        log::info!(
            "[Recovery] Requesting resend of {file_name} from chunk {next_chunk} (attempt 1/{})",
            self.max_retries
        );
        Some(request)
    }

    /// The backoff elapsed. `current` is the receive engine's live transfer
    /// identity (name), `received` its chunk count; a changed track cancels
    /// the cycle and resets the counter.
    pub fn on_retry_due(&self, current_name: Option<&str>, received: u64) -> RetryDecision {
        let mut pending = self.pending.lock();
        let Some(mut cycle) = pending.take() else {
            return RetryDecision::Cancelled;
        };

        if current_name != Some(cycle.file_name.as_str()) {
            log::info!(
                "[Recovery] Track changed during backoff ({}), cancelling",
                cycle.file_name
            );
            return RetryDecision::Cancelled;
        }

        if cycle.attempt >= self.max_retries {
            log::warn!(
                "[Recovery] Giving up on {} after {} attempts",
                cycle.file_name,
                cycle.attempt
            );
            return RetryDecision::Exhausted(cycle);
        }

        cycle.attempt += 1;
        cycle.next_chunk = received;
        let backoff_index = (cycle.attempt as usize - 1).min(self.backoff_ms.len() - 1);
        *pending = Some(cycle.clone());
        drop(pending);

        self.arm_backoff(backoff_index);
        log::info!(
            "[Recovery] Requesting resend of {} from chunk {} (attempt {}/{})",
            cycle.file_name,
            cycle.next_chunk,
            cycle.attempt,
            self.max_retries
        );
        RetryDecision::Retry(cycle)
    }

    /// Data is flowing again (resume arrived or the file completed); close
    /// the cycle and reset the counter.
    pub fn clear(&self) {
        let was_pending = self.pending.lock().take().is_some();
        if was_pending {
            self.timers.clear(TIMER_RECOVERY_BACKOFF);
        }
    }

    /// Whether a cycle is currently waiting out its backoff.
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn arm_backoff(&self, backoff_index: usize) {
        let delay = std::time::Duration::from_millis(
            self.backoff_ms[backoff_index.min(self.backoff_ms.len() - 1)],
        );
        let signals = self.signals.clone();
        self.timers
            .set_timeout(TIMER_RECOVERY_BACKOFF, delay, move || {
                let _ = signals.send(Signal::RecoveryRetry);
            });
    }
}
