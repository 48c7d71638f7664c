//! Background I/O worker for the chunk store.
//!
//! One OS thread owns every file handle and processes commands strictly
//! sequentially off an MPSC queue. Replies travel back over per-command
//! oneshot channels, so async callers simply await them.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};
use crate::protocol::SessionId;
use crate::protocol_constants::FLUSH_EVERY_CHUNKS;

use super::{Command, Slot};

/// How the staging file is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Preferred: a read+write handle with positioned writes.
    RandomAccess,
    /// Fallback when a read+write handle cannot be opened: a buffered
    /// sequential writer that repositions by flush+seek.
    Streaming,
}

enum SlotWriter {
    RandomAccess(File),
    Streaming { inner: BufWriter<File>, pos: u64 },
}

impl SlotWriter {
    fn mode(&self) -> WriteMode {
        match self {
            Self::RandomAccess(_) => WriteMode::RandomAccess,
            Self::Streaming { .. } => WriteMode::Streaming,
        }
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Self::RandomAccess(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(bytes)
            }
            Self::Streaming { inner, pos } => {
                if *pos != offset {
                    inner.flush()?;
                    inner.get_mut().seek(SeekFrom::Start(offset))?;
                    *pos = offset;
                }
                inner.write_all(bytes)?;
                *pos += bytes.len() as u64;
                Ok(())
            }
        }
    }

    fn flush_durable(&mut self) -> std::io::Result<()> {
        match self {
            Self::RandomAccess(file) => file.sync_data(),
            Self::Streaming { inner, .. } => {
                inner.flush()?;
                inner.get_ref().sync_data()
            }
        }
    }

    fn file(&mut self) -> std::io::Result<&File> {
        match self {
            Self::RandomAccess(file) => Ok(file),
            Self::Streaming { inner, .. } => {
                inner.flush()?;
                Ok(inner.get_ref())
            }
        }
    }
}

struct ActiveSlot {
    filename: String,
    session_id: SessionId,
    chunk_size: usize,
    bytes_written: u64,
    chunks_since_flush: u64,
    locked_at: Instant,
    writer: SlotWriter,
    path: PathBuf,
}

struct Worker {
    dir: PathBuf,
    slots: HashMap<Slot, ActiveSlot>,
    /// Chunk size per staged file, kept past finalization so relay catch-up
    /// and recovery re-serves can read finalized files chunkwise.
    chunk_sizes: HashMap<String, u64>,
    /// Mismatch tuples already warned about, to prevent log storms during
    /// session churn.
    warned: HashSet<(&'static str, SessionId, SessionId, String)>,
}

/// Spawns the worker thread. It exits when every [`super::ChunkStore`]
/// clone (and with them the command sender) is dropped.
pub(crate) fn spawn(mut rx: mpsc::UnboundedReceiver<Command>, dir: PathBuf) {
    std::thread::Builder::new()
        .name("quadio-store".to_string())
        .spawn(move || {
            let mut worker = Worker {
                dir,
                slots: HashMap::new(),
                chunk_sizes: HashMap::new(),
                warned: HashSet::new(),
            };
            while let Some(cmd) = rx.blocking_recv() {
                worker.handle(cmd);
            }
            log::debug!("[Store] Worker shutting down");
        })
        .expect("failed to spawn chunk store worker thread");
}

impl Worker {
    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start {
                slot,
                filename,
                session_id,
                chunk_size,
                reply,
            } => {
                let _ = reply.send(self.start(slot, filename, session_id, chunk_size));
            }
            Command::Write {
                slot,
                filename,
                session_id,
                chunk_index,
                bytes,
                reply,
            } => {
                let result = self.write(slot, &filename, session_id, chunk_index, &bytes);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(e) = result {
                    log::warn!("[Store] Scheduled write failed on {slot}/{filename}: {e}");
                }
            }
            Command::End {
                slot,
                filename,
                session_id,
                declared_total_bytes,
                reply,
            } => {
                let _ = reply.send(self.end(slot, &filename, session_id, declared_total_bytes));
            }
            Command::Read {
                slot,
                filename,
                session_id,
                chunk_index,
                tag,
                reply,
            } => {
                let _ = reply.send(self.read(slot, &filename, session_id, chunk_index, &tag));
            }
            Command::ReadAll {
                slot,
                filename,
                reply,
            } => {
                let _ = reply.send(self.read_all(slot, &filename));
            }
            Command::Reset { slot, reply } => {
                self.reset(slot);
                let _ = reply.send(());
            }
            Command::Cleanup {
                slot,
                filename,
                reply,
            } => {
                let _ = reply.send(self.cleanup(slot, &filename));
            }
        }
    }

    fn start(
        &mut self,
        slot: Slot,
        filename: String,
        session_id: SessionId,
        chunk_size: usize,
    ) -> StoreResult<()> {
        if chunk_size == 0 {
            return Err(StoreError::BadArgs("chunk_size must be >= 1".into()));
        }
        if session_id == 0 {
            return Err(StoreError::BadArgs("session id must be >= 1".into()));
        }

        if let Some(existing) = self.slots.get(&slot) {
            let fresh = existing.locked_at.elapsed() < slot.lock_freshness();
            if fresh && existing.session_id >= session_id {
                return Err(StoreError::Locked {
                    holder: existing.session_id,
                });
            }
            log::info!(
                "[Store] Session {} preempts {} lock held by session {} ({})",
                session_id,
                slot,
                existing.session_id,
                if fresh { "newer session" } else { "stale lock" }
            );
            self.reset(slot);
        }

        let path = self.dir.join(&filename);
        let writer = open_writer(&path)?;
        log::debug!(
            "[Store] {} slot started: {} session={} mode={:?}",
            slot,
            filename,
            session_id,
            writer.mode()
        );
        self.chunk_sizes.insert(filename.clone(), chunk_size as u64);
        self.slots.insert(
            slot,
            ActiveSlot {
                filename,
                session_id,
                chunk_size,
                bytes_written: 0,
                chunks_since_flush: 0,
                locked_at: Instant::now(),
                writer,
                path,
            },
        );
        Ok(())
    }

    fn write(
        &mut self,
        slot: Slot,
        filename: &str,
        session_id: SessionId,
        chunk_index: u64,
        bytes: &[u8],
    ) -> StoreResult<()> {
        let mismatch = match self.slots.get(&slot) {
            None => Some(0),
            Some(a) if a.filename != filename || a.session_id != session_id => {
                Some(a.session_id)
            }
            Some(_) => None,
        };
        if let Some(expected) = mismatch {
            self.warn_mismatch("write", expected, session_id, filename);
            return Ok(());
        }
        let active = self.slots.get_mut(&slot).expect("checked above");

        let offset = chunk_index * active.chunk_size as u64;
        active.writer.write_at(offset, bytes)?;
        active.bytes_written += bytes.len() as u64;
        active.chunks_since_flush += 1;
        if active.chunks_since_flush >= FLUSH_EVERY_CHUNKS {
            active.writer.flush_durable()?;
            active.chunks_since_flush = 0;
        }
        Ok(())
    }

    fn end(
        &mut self,
        slot: Slot,
        filename: &str,
        session_id: SessionId,
        declared_total_bytes: u64,
    ) -> StoreResult<()> {
        let matches = self
            .slots
            .get(&slot)
            .is_some_and(|a| a.filename == filename && a.session_id == session_id);
        if !matches {
            let expected = self.slots.get(&slot).map_or(0, |a| a.session_id);
            self.warn_mismatch("end", expected, session_id, filename);
            return Err(StoreError::NotStarted);
        }

        // The lock is released on success and failure alike.
        let mut active = self.slots.remove(&slot).expect("checked above");

        active.writer.flush_durable()?;
        let file = active.writer.file()?;
        let actual = file.metadata()?.len();
        if actual > declared_total_bytes {
            log::warn!(
                "[Store] {} staged {} bytes, declared {} - truncating",
                active.filename,
                actual,
                declared_total_bytes
            );
            file.set_len(declared_total_bytes)?;
            file.sync_data()?;
        } else if actual < declared_total_bytes {
            return Err(StoreError::IntegrityFail {
                expected: declared_total_bytes,
                actual,
            });
        }
        log::debug!(
            "[Store] {} slot finalized: {} ({} bytes)",
            slot,
            active.filename,
            declared_total_bytes
        );
        Ok(())
    }

    fn read(
        &mut self,
        slot: Slot,
        filename: &str,
        session_id: SessionId,
        chunk_index: u64,
        tag: &str,
    ) -> StoreResult<Bytes> {
        // Flush pending buffered writes so the read sees them.
        if let Some(active) = self.slots.get_mut(&slot) {
            if active.filename == filename {
                if active.session_id != session_id {
                    log::debug!(
                        "[Store] read({tag}) session {} differs from active {}",
                        session_id,
                        active.session_id
                    );
                }
                active.writer.flush_durable()?;
            }
        }

        let Some(&chunk_size) = self.chunk_sizes.get(filename) else {
            return Err(StoreError::BadArgs(format!(
                "unknown staged file: {filename}"
            )));
        };
        let path = self.dir.join(filename);
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        let offset = chunk_index * chunk_size;
        if offset >= len {
            return Ok(Bytes::new());
        }
        file.seek(SeekFrom::Start(offset))?;
        let take = chunk_size.min(len - offset) as usize;
        let mut buf = vec![0u8; take];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn read_all(&mut self, slot: Slot, filename: &str) -> StoreResult<Bytes> {
        if let Some(active) = self.slots.get_mut(&slot) {
            if active.filename == filename {
                active.writer.flush_durable()?;
            }
        }
        let data = std::fs::read(self.dir.join(filename))?;
        Ok(Bytes::from(data))
    }

    fn reset(&mut self, slot: Slot) {
        if let Some(mut active) = self.slots.remove(&slot) {
            if let Err(e) = active.writer.flush_durable() {
                log::warn!("[Store] Flush on reset failed for {}: {e}", active.filename);
            }
            log::debug!("[Store] {} slot reset ({})", slot, active.filename);
        }
    }

    fn cleanup(&mut self, slot: Slot, filename: &str) -> StoreResult<()> {
        if let Some(active) = self.slots.get(&slot) {
            if active.filename == filename {
                return Err(StoreError::Locked {
                    holder: active.session_id,
                });
            }
        }
        self.chunk_sizes.remove(filename);
        match std::fs::remove_file(self.dir.join(filename)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Emits one warning per unique (command, expected, received, filename)
    /// tuple; duplicates are suppressed until any field changes.
    fn warn_mismatch(
        &mut self,
        command: &'static str,
        expected: SessionId,
        received: SessionId,
        filename: &str,
    ) {
        let key = (command, expected, received, filename.to_string());
        if self.warned.insert(key) {
            log::warn!(
                "[Store] Ignoring {command} for {filename}: session {received}, slot holds {expected}"
            );
        }
    }
}

fn open_writer(path: &Path) -> StoreResult<SlotWriter> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
    {
        Ok(file) => Ok(SlotWriter::RandomAccess(file)),
        Err(e) => {
            log::warn!(
                "[Store] Random-access open failed for {} ({e}), falling back to streaming writer",
                path.display()
            );
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            Ok(SlotWriter::Streaming {
                inner: BufWriter::new(file),
                pos: 0,
            })
        }
    }
}
