//! Named, replaceable timers with guaranteed cancellation.
//!
//! Every engine timer (heartbeat, ping, chunk watchdog, prepare watchdog,
//! preload watchdog, debounced sync nudge, ...) registers under a logical
//! name; setting a name cancels whatever was previously installed under it,
//! and [`TimerRegistry::clear_all`] on session leave enforces the "no
//! orphaned timers" invariant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

// Well-known timer names. Engines may also register ad-hoc names (e.g. one
// per downstream peer) as long as they are cleared on teardown.
pub const TIMER_HEARTBEAT: &str = "heartbeat";
pub const TIMER_PING: &str = "ping";
pub const TIMER_CHUNK_WATCHDOG: &str = "chunk-watchdog";
pub const TIMER_PREPARE_WATCHDOG: &str = "prepare-watchdog";
pub const TIMER_AUTO_PLAY: &str = "auto-play";
pub const TIMER_PRELOAD_WATCHDOG: &str = "preload-watchdog";
pub const TIMER_PRELOAD_DEBOUNCE: &str = "preload-debounce";
pub const TIMER_NUDGE_DEBOUNCE: &str = "nudge-debounce";
pub const TIMER_FILE_WAIT: &str = "file-wait";
pub const TIMER_RECOVERY_BACKOFF: &str = "recovery-backoff";
pub const TIMER_RESYNC: &str = "resync";
pub const TIMER_ICE_PROBE_PREFIX: &str = "ice-probe:";

struct Entry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Registry mapping a logical name to at most one active timer.
///
/// Cheap to clone; clones share the same timer table.
#[derive(Clone)]
pub struct TimerRegistry {
    timers: Arc<DashMap<String, Entry>>,
    generation: Arc<AtomicU64>,
}

impl TimerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Installs a one-shot timer, cancelling any prior timer for `name`.
    pub fn set_timeout<F>(&self, name: &str, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timers = Arc::clone(&self.timers);
        let key = name.to_string();
        let cleanup_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Remove our own entry first so the callback can re-arm the
            // same name without racing the removal.
            timers.remove_if(&cleanup_key, |_, e| e.generation == generation);
            f();
        });
        self.install(key, Entry { generation, handle });
    }

    /// Installs a periodic timer (first fire after one period), cancelling
    /// any prior timer for `name`.
    pub fn set_interval<F>(&self, name: &str, period: Duration, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                f();
            }
        });
        self.install(name.to_string(), Entry { generation, handle });
    }

    fn install(&self, name: String, entry: Entry) {
        if let Some(old) = self.timers.insert(name, entry) {
            old.handle.abort();
        }
    }

    /// Cancels the timer for `name`. Returns whether one was active.
    pub fn clear(&self, name: &str) -> bool {
        match self.timers.remove(name) {
            Some((_, entry)) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every timer whose name starts with `prefix`.
    pub fn clear_prefix(&self, prefix: &str) {
        let names: Vec<String> = self
            .timers
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        for name in names {
            self.clear(&name);
        }
    }

    /// Cancels every managed timer. Called on session leave.
    pub fn clear_all(&self) {
        let names: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.clear(&name);
        }
    }

    /// Whether a timer is currently registered under `name`.
    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.timers.contains_key(name)
    }

    /// Number of active timers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_unregisters() {
        let registry = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        registry.set_timeout("t", Duration::from_millis(100), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(registry.is_active("t"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!registry.is_active("t"));
    }

    #[tokio::test(start_paused = true)]
    async fn setting_a_name_replaces_the_prior_timer() {
        let registry = TimerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&first);
        registry.set_timeout("t", Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&second);
        registry.set_timeout("t", Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0, "replaced timer must not fire");
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_fires_repeatedly_until_cleared() {
        let registry = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&fired);
        registry.set_interval("tick", Duration::from_millis(100), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let seen = fired.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected >= 3 ticks, saw {seen}");

        registry.clear("tick");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_leaves_nothing_active() {
        let registry = TimerRegistry::new();
        registry.set_timeout("a", Duration::from_secs(10), || {});
        registry.set_interval("b", Duration::from_secs(10), || {});
        registry.set_timeout("ice-probe:peer-1", Duration::from_secs(10), || {});
        assert_eq!(registry.active_count(), 3);

        registry.clear_all();
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.is_active("a"));
        assert!(!registry.is_active("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_prefix_only_touches_matching_names() {
        let registry = TimerRegistry::new();
        registry.set_timeout("ice-probe:p1", Duration::from_secs(10), || {});
        registry.set_timeout("ice-probe:p2", Duration::from_secs(10), || {});
        registry.set_timeout("heartbeat", Duration::from_secs(10), || {});

        registry.clear_prefix(TIMER_ICE_PROBE_PREFIX);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.is_active("heartbeat"));
    }

    #[tokio::test(start_paused = true)]
    async fn callback_can_rearm_same_name() {
        let registry = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&fired);
        let r2 = registry.clone();
        registry.set_timeout("chain", Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = Arc::clone(&c);
            r2.set_timeout("chain", Duration::from_millis(50), move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
