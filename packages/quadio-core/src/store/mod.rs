//! Session-scoped staging storage for received media bytes.
//!
//! Each device stages incoming files on disk, keyed by chunk index, in one
//! of two slots: `current` (the playing track) and `preload` (the next
//! track). Heavy disk work runs on one background worker thread with an
//! MPSC command queue; the worker processes commands strictly sequentially,
//! so chunks written for one session never interleave with another.
//!
//! Slot locking: at most one active writer per slot. A newer session id may
//! preempt the lock; an older one is rejected with `LOCKED` unless the lock
//! has gone stale (60 s current / 20 s preload).

mod worker;

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{StoreError, StoreResult};
use crate::protocol::SessionId;
use crate::protocol_constants::{LOCK_FRESHNESS_CURRENT, LOCK_FRESHNESS_PRELOAD};
use crate::utils::safe_file_name;

pub use worker::WriteMode;

/// The two staging slots of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Current,
    Preload,
}

impl Slot {
    /// File-name prefix for this slot.
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Preload => "preload",
        }
    }

    /// Lock-freshness window: a writer lock older than this may be stolen.
    #[must_use]
    pub fn lock_freshness(&self) -> std::time::Duration {
        match self {
            Self::Current => LOCK_FRESHNESS_CURRENT,
            Self::Preload => LOCK_FRESHNESS_PRELOAD,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

pub(crate) enum Command {
    Start {
        slot: Slot,
        filename: String,
        session_id: SessionId,
        chunk_size: usize,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Write {
        slot: Slot,
        filename: String,
        session_id: SessionId,
        chunk_index: u64,
        bytes: Bytes,
        reply: Option<oneshot::Sender<StoreResult<()>>>,
    },
    End {
        slot: Slot,
        filename: String,
        session_id: SessionId,
        declared_total_bytes: u64,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Read {
        slot: Slot,
        filename: String,
        session_id: SessionId,
        chunk_index: u64,
        /// Identifies the requesting purpose (relay catch-up, recovery
        /// re-serve) in logs; replies route back over the oneshot.
        tag: String,
        reply: oneshot::Sender<StoreResult<Bytes>>,
    },
    ReadAll {
        slot: Slot,
        filename: String,
        reply: oneshot::Sender<StoreResult<Bytes>>,
    },
    Reset {
        slot: Slot,
        reply: oneshot::Sender<()>,
    },
    Cleanup {
        slot: Slot,
        filename: String,
        reply: oneshot::Sender<StoreResult<()>>,
    },
}

/// Handle to the device's staging store.
///
/// Cheap to clone; all clones feed the same worker queue, preserving
/// command order across the whole device.
#[derive(Clone)]
pub struct ChunkStore {
    tx: mpsc::UnboundedSender<Command>,
    dir: PathBuf,
    instance: String,
}

impl ChunkStore {
    /// Creates the staging directory (a per-process private directory under
    /// the system temp dir when `dir` is `None`) and spawns the I/O worker.
    pub fn new(dir: Option<PathBuf>, instance: &str) -> StoreResult<Self> {
        let dir = match dir {
            Some(d) => d,
            None => std::env::temp_dir().join(format!("quadio-{}", std::process::id())),
        };
        std::fs::create_dir_all(&dir)?;

        let (tx, rx) = mpsc::unbounded_channel();
        worker::spawn(rx, dir.clone());

        Ok(Self {
            tx,
            dir,
            instance: instance.to_string(),
        })
    }

    /// The staging directory backing this store.
    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.dir
    }

    /// On-disk file name for a (slot, track) pair:
    /// `<slot>_<safe(name)>_<instance>`.
    #[must_use]
    pub fn staging_name(&self, slot: Slot, filename: &str) -> String {
        format!("{}_{}_{}", slot.prefix(), safe_file_name(filename), self.instance)
    }

    /// Acquires the slot lock and opens the staging file for random writes.
    ///
    /// # Errors
    ///
    /// - [`StoreError::BadArgs`] on empty filename, zero chunk size or a
    ///   zero session id.
    /// - [`StoreError::Locked`] if the slot is held by a fresh,
    ///   equal-or-newer session.
    pub async fn start(
        &self,
        slot: Slot,
        filename: &str,
        session_id: SessionId,
        chunk_size: usize,
    ) -> StoreResult<()> {
        if filename.is_empty() {
            return Err(StoreError::BadArgs("empty filename".into()));
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start {
            slot,
            filename: self.staging_name(slot, filename),
            session_id,
            chunk_size,
            reply,
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Writes one chunk at `chunk_index * chunk_size` and awaits the result.
    pub async fn write(
        &self,
        slot: Slot,
        filename: &str,
        session_id: SessionId,
        chunk_index: u64,
        bytes: Bytes,
    ) -> StoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Write {
            slot,
            filename: self.staging_name(slot, filename),
            session_id,
            chunk_index,
            bytes,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Enqueues a chunk write without awaiting it. The worker's strictly
    /// sequential queue keeps writes ordered ahead of any later `end`.
    pub fn schedule_write(
        &self,
        slot: Slot,
        filename: &str,
        session_id: SessionId,
        chunk_index: u64,
        bytes: Bytes,
    ) -> StoreResult<()> {
        self.send(Command::Write {
            slot,
            filename: self.staging_name(slot, filename),
            session_id,
            chunk_index,
            bytes,
            reply: None,
        })
    }

    /// Flushes, verifies the staged size against `declared_total_bytes`
    /// (truncating excess) and releases the slot lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::IntegrityFail`] if the staged file is short. The lock
    /// is released on success *and* failure.
    pub async fn end(
        &self,
        slot: Slot,
        filename: &str,
        session_id: SessionId,
        declared_total_bytes: u64,
    ) -> StoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::End {
            slot,
            filename: self.staging_name(slot, filename),
            session_id,
            declared_total_bytes,
            reply,
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Reads the stored bytes for one chunk (short at end of file).
    pub async fn read(
        &self,
        slot: Slot,
        filename: &str,
        session_id: SessionId,
        chunk_index: u64,
        tag: &str,
    ) -> StoreResult<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Read {
            slot,
            filename: self.staging_name(slot, filename),
            session_id,
            chunk_index,
            tag: tag.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Reads the entire staged file (activating a finalized preload into a
    /// playable blob).
    pub async fn read_all(&self, slot: Slot, filename: &str) -> StoreResult<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReadAll {
            slot,
            filename: self.staging_name(slot, filename),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Aborts the slot: closes the handle and releases the lock. The staged
    /// file stays on disk until [`ChunkStore::cleanup`].
    pub async fn reset(&self, slot: Slot) -> StoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { slot, reply })?;
        rx.await.map_err(|_| StoreError::WorkerGone)
    }

    /// Deletes the backing file for a track unless the slot is currently
    /// locked on it.
    pub async fn cleanup(&self, slot: Slot, filename: &str) -> StoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cleanup {
            slot,
            filename: self.staging_name(slot, filename),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    fn send(&self, cmd: Command) -> StoreResult<()> {
        self.tx.send(cmd).map_err(|_| StoreError::WorkerGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(Some(dir.path().to_path_buf()), "test").unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn start_write_end_roundtrip() {
        let (_dir, store) = store();
        store.start(Slot::Current, "t.wav", 1, 4).await.unwrap();
        store
            .write(Slot::Current, "t.wav", 1, 0, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        store
            .write(Slot::Current, "t.wav", 1, 1, Bytes::from_static(b"ef"))
            .await
            .unwrap();
        store.end(Slot::Current, "t.wav", 1, 6).await.unwrap();

        let chunk = store
            .read(Slot::Current, "t.wav", 1, 0, "test")
            .await
            .unwrap();
        assert_eq!(&chunk[..], b"abcd");
        let chunk = store
            .read(Slot::Current, "t.wav", 1, 1, "test")
            .await
            .unwrap();
        assert_eq!(&chunk[..], b"ef");
    }

    #[tokio::test]
    async fn out_of_order_offsets_land_in_place() {
        let (_dir, store) = store();
        store.start(Slot::Current, "t.wav", 1, 2).await.unwrap();
        // The reorder buffer normally prevents this, but the store itself
        // accepts any offset.
        store
            .write(Slot::Current, "t.wav", 1, 2, Bytes::from_static(b"EE"))
            .await
            .unwrap();
        store
            .write(Slot::Current, "t.wav", 1, 0, Bytes::from_static(b"AA"))
            .await
            .unwrap();
        store
            .write(Slot::Current, "t.wav", 1, 1, Bytes::from_static(b"CC"))
            .await
            .unwrap();
        store.end(Slot::Current, "t.wav", 1, 6).await.unwrap();

        let path = store
            .staging_dir()
            .join(store.staging_name(Slot::Current, "t.wav"));
        assert_eq!(std::fs::read(path).unwrap(), b"AACCEE");
    }

    #[tokio::test]
    async fn bad_args_are_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.start(Slot::Current, "", 1, 4).await,
            Err(StoreError::BadArgs(_))
        ));
        assert!(matches!(
            store.start(Slot::Current, "t.wav", 1, 0).await,
            Err(StoreError::BadArgs(_))
        ));
        assert!(matches!(
            store.start(Slot::Current, "t.wav", 0, 4).await,
            Err(StoreError::BadArgs(_))
        ));
    }

    #[tokio::test]
    async fn fresh_lock_rejects_equal_or_older_session() {
        let (_dir, store) = store();
        store.start(Slot::Current, "a.wav", 5, 4).await.unwrap();

        let err = store.start(Slot::Current, "b.wav", 5, 4).await.unwrap_err();
        assert!(matches!(err, StoreError::Locked { holder: 5 }));
        let err = store.start(Slot::Current, "b.wav", 4, 4).await.unwrap_err();
        assert!(matches!(err, StoreError::Locked { holder: 5 }));
    }

    #[tokio::test]
    async fn newer_session_preempts_lock() {
        let (_dir, store) = store();
        store.start(Slot::Current, "a.wav", 5, 4).await.unwrap();
        store.start(Slot::Current, "b.wav", 6, 4).await.unwrap();

        // Writes for the preempted session are silently ignored.
        store
            .write(Slot::Current, "a.wav", 5, 0, Bytes::from_static(b"old!"))
            .await
            .unwrap();
        store
            .write(Slot::Current, "b.wav", 6, 0, Bytes::from_static(b"new!"))
            .await
            .unwrap();
        store.end(Slot::Current, "b.wav", 6, 4).await.unwrap();

        let path = store
            .staging_dir()
            .join(store.staging_name(Slot::Current, "b.wav"));
        assert_eq!(std::fs::read(path).unwrap(), b"new!");
    }

    #[tokio::test]
    async fn slots_lock_independently() {
        let (_dir, store) = store();
        store.start(Slot::Current, "a.wav", 5, 4).await.unwrap();
        store.start(Slot::Preload, "b.wav", 6, 4).await.unwrap();
        store.end(Slot::Current, "a.wav", 5, 0).await.unwrap();
        store.end(Slot::Preload, "b.wav", 6, 0).await.unwrap();
    }

    #[tokio::test]
    async fn end_truncates_excess_bytes() {
        let (_dir, store) = store();
        store.start(Slot::Current, "t.wav", 1, 4).await.unwrap();
        store
            .write(Slot::Current, "t.wav", 1, 0, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        store
            .write(Slot::Current, "t.wav", 1, 1, Bytes::from_static(b"efgh"))
            .await
            .unwrap();
        // Declared size is shorter than what was staged.
        store.end(Slot::Current, "t.wav", 1, 6).await.unwrap();

        let path = store
            .staging_dir()
            .join(store.staging_name(Slot::Current, "t.wav"));
        assert_eq!(std::fs::read(path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn end_fails_integrity_when_short() {
        let (_dir, store) = store();
        store.start(Slot::Current, "t.wav", 1, 4).await.unwrap();
        store
            .write(Slot::Current, "t.wav", 1, 0, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        let err = store.end(Slot::Current, "t.wav", 1, 100).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::IntegrityFail {
                expected: 100,
                actual: 4
            }
        ));

        // The lock was released despite the failure.
        store.start(Slot::Current, "t2.wav", 1, 4).await.unwrap();
    }

    #[tokio::test]
    async fn zero_byte_file_ends_cleanly() {
        let (_dir, store) = store();
        store.start(Slot::Current, "empty.wav", 1, 4).await.unwrap();
        store.end(Slot::Current, "empty.wav", 1, 0).await.unwrap();

        let path = store
            .staging_dir()
            .join(store.staging_name(Slot::Current, "empty.wav"));
        assert_eq!(std::fs::read(path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn mismatched_writes_are_silently_ignored() {
        let (_dir, store) = store();
        store.start(Slot::Current, "t.wav", 2, 4).await.unwrap();
        // Wrong session id
        store
            .write(Slot::Current, "t.wav", 1, 0, Bytes::from_static(b"XXXX"))
            .await
            .unwrap();
        // Wrong filename
        store
            .write(Slot::Current, "other.wav", 2, 0, Bytes::from_static(b"YYYY"))
            .await
            .unwrap();
        store
            .write(Slot::Current, "t.wav", 2, 0, Bytes::from_static(b"good"))
            .await
            .unwrap();
        store.end(Slot::Current, "t.wav", 2, 4).await.unwrap();

        let path = store
            .staging_dir()
            .join(store.staging_name(Slot::Current, "t.wav"));
        assert_eq!(std::fs::read(path).unwrap(), b"good");
    }

    #[tokio::test]
    async fn reset_releases_the_lock() {
        let (_dir, store) = store();
        store.start(Slot::Current, "t.wav", 5, 4).await.unwrap();
        store.reset(Slot::Current).await.unwrap();
        // Same (even equal) session can start again after reset.
        store.start(Slot::Current, "t.wav", 5, 4).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_refuses_locked_file_and_removes_idle_one() {
        let (_dir, store) = store();
        store.start(Slot::Current, "t.wav", 5, 4).await.unwrap();
        store
            .write(Slot::Current, "t.wav", 5, 0, Bytes::from_static(b"data"))
            .await
            .unwrap();
        let path = store
            .staging_dir()
            .join(store.staging_name(Slot::Current, "t.wav"));

        assert!(store.cleanup(Slot::Current, "t.wav").await.is_err());
        assert!(path.exists());

        store.end(Slot::Current, "t.wav", 5, 4).await.unwrap();
        store.cleanup(Slot::Current, "t.wav").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn scheduled_writes_complete_before_end() {
        let (_dir, store) = store();
        store.start(Slot::Current, "t.wav", 1, 4).await.unwrap();
        for i in 0..50u64 {
            store
                .schedule_write(
                    Slot::Current,
                    "t.wav",
                    1,
                    i,
                    Bytes::from(vec![i as u8; 4]),
                )
                .unwrap();
        }
        // end rides the same sequential queue, so it observes all writes.
        store.end(Slot::Current, "t.wav", 1, 200).await.unwrap();

        let chunk = store
            .read(Slot::Current, "t.wav", 1, 49, "test")
            .await
            .unwrap();
        assert_eq!(&chunk[..], &[49u8; 4]);
    }
}
