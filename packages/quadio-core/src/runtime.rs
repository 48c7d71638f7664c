//! Task spawning abstraction for runtime independence.
//!
//! The device routes its fire-and-forget background work through
//! [`TaskSpawner`]: the run loop, broadcast/unicast transfer loops,
//! preload sends and recovery re-serves. An embedding desktop app can
//! supply its own runtime by constructing the device's spawner from that
//! runtime's handle; the headless server uses the ambient Tokio runtime.
//!
//! Work that must be abortable mid-flight does NOT go through here: the
//! timer registry and the relay catch-up pumps keep their own
//! `JoinHandle`s, because this trait deliberately offers no cancellation
//! or join (spawned transfer loops cancel themselves via session-id
//! checks instead).

use std::future::Future;

/// Abstraction for spawning fire-and-forget background tasks.
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future that runs to completion independently of the
    /// caller. No handle is returned; cancellation, where needed, is the
    /// task's own concern.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based spawner for the standalone server and general use.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Creates a new `TokioSpawner` with the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioSpawner` using the current runtime's handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }
}
