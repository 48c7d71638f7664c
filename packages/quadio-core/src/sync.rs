//! Playback clock synchronization: heartbeats, RTT sampling, sync-time
//! requests and resync scheduling.
//!
//! All devices sit on one LAN, so RTT-half compensation is disabled by
//! default; the engine still tracks RTT so the UI can show link quality.
//! Heartbeats, pings and sync replies are small control messages that ride
//! the same ordered link as media but are never blocked behind it: the
//! receive loop stays I/O-free and the send side yields between chunks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::events::{EventEmitter, SyncEvent};
use crate::protocol_constants::{
    HEARTBEAT_INTERVAL, NUDGE_DEBOUNCE, PING_INTERVAL, RESYNC_JITTER_MAX, RTT_HISTORY_LEN,
    SYNC_BUSY_RETRIES, SYNC_BUSY_RETRY_DELAY, SYNC_BUSY_THRESHOLD_MS,
};
use crate::signal::{Signal, SignalSender};
use crate::timers::{TimerRegistry, TIMER_HEARTBEAT, TIMER_NUDGE_DEBOUNCE, TIMER_PING, TIMER_RESYNC};
use crate::utils::now_millis;

use std::sync::Arc;

/// Verdict on an inbound SYNC_RESPONSE.
#[derive(Debug, PartialEq)]
pub enum SyncOutcome {
    /// Snap the local clock: `host_time` (+ offsets) is the position now.
    Apply {
        host_time: f64,
        is_playing: bool,
    },
    /// The host was busy (reply took too long); a retry is scheduled.
    RetryScheduled,
}

struct OutstandingSync {
    sent_at_ms: u64,
    retries_left: u32,
}

pub(crate) struct SyncEngine {
    use_ping_compensation: bool,
    timers: TimerRegistry,
    emitter: Arc<dyn EventEmitter>,
    signals: SignalSender,
    rtt_history: Mutex<VecDeque<u64>>,
    last_latency_ms: AtomicU64,
    outstanding: Mutex<Option<OutstandingSync>>,
}

impl SyncEngine {
    pub fn new(
        use_ping_compensation: bool,
        timers: TimerRegistry,
        emitter: Arc<dyn EventEmitter>,
        signals: SignalSender,
    ) -> Self {
        Self {
            use_ping_compensation,
            timers,
            emitter,
            signals,
            rtt_history: Mutex::new(VecDeque::with_capacity(RTT_HISTORY_LEN)),
            last_latency_ms: AtomicU64::new(0),
            outstanding: Mutex::new(None),
        }
    }

    /// Arms the guest-side heartbeat (1 s) and latency ping (2 s) ticks.
    pub fn start_guest_cadence(&self) {
        let signals = self.signals.clone();
        self.timers
            .set_interval(TIMER_HEARTBEAT, HEARTBEAT_INTERVAL, move || {
                let _ = signals.send(Signal::SendHeartbeat);
            });
        let signals = self.signals.clone();
        self.timers.set_interval(TIMER_PING, PING_INTERVAL, move || {
            let _ = signals.send(Signal::SendPing);
        });
    }

    /// PONG_LATENCY: one RTT sample. The published estimate is the minimum
    /// of the last 10 samples, which denoises scheduler and GC pauses.
    pub fn record_pong(&self, echoed_timestamp: u64) {
        let rtt = now_millis().saturating_sub(echoed_timestamp);
        let best = {
            let mut history = self.rtt_history.lock();
            if history.len() == RTT_HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(rtt);
            history.iter().copied().min().unwrap_or(rtt)
        };
        if self.last_latency_ms.swap(best, Ordering::SeqCst) != best {
            self.emitter
                .emit_sync(SyncEvent::LatencyUpdated { latency_ms: best });
        }
    }

    /// Latest published latency estimate.
    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        self.last_latency_ms.load(Ordering::SeqCst)
    }

    /// Opens a sync-time round. Returns the request timestamp to put on
    /// the wire; the retry budget refreshes unless a round is mid-retry.
    pub fn begin_sync_round(&self) -> u64 {
        let now = now_millis();
        let mut outstanding = self.outstanding.lock();
        let retries_left = outstanding
            .as_ref()
            .map_or(SYNC_BUSY_RETRIES, |o| o.retries_left);
        *outstanding = Some(OutstandingSync {
            sent_at_ms: now,
            retries_left,
        });
        now
    }

    /// SYNC_RESPONSE from the host. A reply slower than the busy
    /// threshold burns one retry ("host was busy") and schedules another
    /// GET_SYNC_TIME after a short delay.
    pub fn on_sync_response(
        &self,
        host_time: f64,
        is_playing: bool,
        req_ts: Option<u64>,
    ) -> SyncOutcome {
        let mut outstanding = self.outstanding.lock();
        let sent_at = req_ts.or(outstanding.as_ref().map(|o| o.sent_at_ms));
        let elapsed = sent_at.map_or(0, |t| now_millis().saturating_sub(t));

        if elapsed > SYNC_BUSY_THRESHOLD_MS {
            if let Some(o) = outstanding.as_mut() {
                if o.retries_left > 0 {
                    o.retries_left -= 1;
                    drop(outstanding);
                    log::debug!(
                        "[Sync] Host took {elapsed} ms to answer, retrying shortly"
                    );
                    let signals = self.signals.clone();
                    self.timers
                        .set_timeout(TIMER_RESYNC, SYNC_BUSY_RETRY_DELAY, move || {
                            let _ = signals.send(Signal::DoResync);
                        });
                    return SyncOutcome::RetryScheduled;
                }
            }
        }

        *outstanding = None;
        drop(outstanding);

        let host_time = if self.use_ping_compensation {
            host_time + self.latency_ms() as f64 / 2_000.0
        } else {
            host_time
        };
        self.emitter.emit_sync(SyncEvent::Resynced { host_time });
        SyncOutcome::Apply {
            host_time,
            is_playing,
        }
    }

    /// GLOBAL_RESYNC_REQUEST: every guest jitters 0..500 ms before asking,
    /// so the host is not answering the whole room in one burst.
    pub fn on_global_resync(&self) {
        let jitter = std::time::Duration::from_millis(
            rand::rng().random_range(0..RESYNC_JITTER_MAX.as_millis() as u64),
        );
        let signals = self.signals.clone();
        self.timers.set_timeout(TIMER_RESYNC, jitter, move || {
            let _ = signals.send(Signal::DoResync);
        });
    }

    /// Debounces the re-seek that follows a manual nudge.
    pub fn debounce_nudge_reseek(&self) {
        let signals = self.signals.clone();
        self.timers
            .set_timeout(TIMER_NUDGE_DEBOUNCE, NUDGE_DEBOUNCE, move || {
                let _ = signals.send(Signal::NudgeReseek);
            });
    }

    /// Drops guest cadence timers and any outstanding round.
    pub fn stop(&self) {
        self.timers.clear(TIMER_HEARTBEAT);
        self.timers.clear(TIMER_PING);
        self.timers.clear(TIMER_RESYNC);
        self.timers.clear(TIMER_NUDGE_DEBOUNCE);
        *self.outstanding.lock() = None;
        self.rtt_history.lock().clear();
        self.last_latency_ms.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::signal;

    fn engine(compensation: bool) -> (SyncEngine, signal::SignalReceiver) {
        let (tx, rx) = signal::channel();
        (
            SyncEngine::new(
                compensation,
                TimerRegistry::new(),
                Arc::new(NoopEventEmitter),
                tx,
            ),
            rx,
        )
    }

    #[tokio::test]
    async fn latency_publishes_min_of_history() {
        let (engine, _rx) = engine(false);
        for rtt in [40, 12, 80] {
            engine.record_pong(now_millis() - rtt);
        }
        // Samples are >= the injected offsets; the min tracks the smallest.
        assert!(engine.latency_ms() >= 12 && engine.latency_ms() < 40);
    }

    #[tokio::test]
    async fn rtt_history_is_bounded() {
        let (engine, _rx) = engine(false);
        for _ in 0..30 {
            engine.record_pong(now_millis());
        }
        assert!(engine.rtt_history.lock().len() <= RTT_HISTORY_LEN);
    }

    #[tokio::test]
    async fn fast_reply_applies_immediately() {
        let (engine, _rx) = engine(false);
        let req_ts = engine.begin_sync_round();
        let outcome = engine.on_sync_response(3.25, true, Some(req_ts));
        assert_eq!(
            outcome,
            SyncOutcome::Apply {
                host_time: 3.25,
                is_playing: true
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn busy_reply_schedules_retry_then_gives_in() {
        let (engine, mut rx) = engine(false);
        engine.begin_sync_round();

        // Pretend the reply took 400 ms.
        let stale_ts = now_millis().saturating_sub(400);
        assert_eq!(
            engine.on_sync_response(3.0, true, Some(stale_ts)),
            SyncOutcome::RetryScheduled
        );
        tokio::time::advance(SYNC_BUSY_RETRY_DELAY + std::time::Duration::from_millis(50)).await;
        assert!(matches!(rx.recv().await.unwrap(), Signal::DoResync));

        // Two retries total; the third slow reply is applied anyway.
        engine.begin_sync_round();
        assert_eq!(
            engine.on_sync_response(3.2, true, Some(stale_ts)),
            SyncOutcome::RetryScheduled
        );
        engine.begin_sync_round();
        assert!(matches!(
            engine.on_sync_response(3.4, true, Some(stale_ts)),
            SyncOutcome::Apply { .. }
        ));
    }

    #[tokio::test]
    async fn compensation_adds_half_rtt_when_enabled() {
        let (engine, _rx) = engine(true);
        engine.record_pong(now_millis() - 100);
        let req_ts = engine.begin_sync_round();
        match engine.on_sync_response(10.0, true, Some(req_ts)) {
            SyncOutcome::Apply { host_time, .. } => {
                assert!(host_time >= 10.05, "half RTT added, got {host_time}");
            }
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn global_resync_jitters_before_asking() {
        let (engine, mut rx) = engine(false);
        engine.on_global_resync();

        tokio::time::advance(RESYNC_JITTER_MAX + std::time::Duration::from_millis(50)).await;
        assert!(matches!(rx.recv().await.unwrap(), Signal::DoResync));
    }

    #[tokio::test(start_paused = true)]
    async fn guest_cadence_emits_heartbeat_and_ping() {
        let (engine, mut rx) = engine(false);
        engine.start_guest_cadence();

        tokio::time::advance(std::time::Duration::from_millis(2_200)).await;
        let mut heartbeats = 0;
        let mut pings = 0;
        while let Ok(signal) = rx.try_recv() {
            match signal {
                Signal::SendHeartbeat => heartbeats += 1,
                Signal::SendPing => pings += 1,
                _ => {}
            }
        }
        assert!(heartbeats >= 2, "heartbeat every second, saw {heartbeats}");
        assert!(pings >= 1, "ping every two seconds, saw {pings}");

        engine.stop();
        assert_eq!(engine.latency_ms(), 0);
    }
}
