//! The ordered track list and its advance policies.
//!
//! The host owns the authoritative playlist; guests hold shadow copies
//! rebuilt from PLAYLIST_UPDATE / STATUS_SYNC. Indices are stable under
//! add and invalidated under removal.

use bytes::Bytes;
use rand::Rng;

use crate::protocol::{RepeatMode, TrackKind, TrackMeta};

/// One playlist entry. Local files own their media bytes; external streams
/// carry only an opaque id for the embedding player.
#[derive(Debug, Clone)]
pub struct PlaylistItem {
    pub kind: TrackKind,
    /// File name; doubles as the transfer identity on the wire.
    pub name: String,
    /// Display title.
    pub title: String,
    pub mime: String,
    pub external_id: Option<String>,
    /// Owned media bytes (host for local files; guests after staging).
    pub blob: Option<Bytes>,
}

impl PlaylistItem {
    /// A local file entry owning its bytes.
    #[must_use]
    pub fn local_file(name: &str, title: &str, mime: &str, blob: Bytes) -> Self {
        Self {
            kind: TrackKind::LocalFile,
            name: name.to_string(),
            title: title.to_string(),
            mime: mime.to_string(),
            external_id: None,
            blob: Some(blob),
        }
    }

    /// An external stream entry (state-only; no bytes ever transfer).
    #[must_use]
    pub fn external_stream(name: &str, title: &str, external_id: &str) -> Self {
        Self {
            kind: TrackKind::ExternalStream,
            name: name.to_string(),
            title: title.to_string(),
            mime: String::new(),
            external_id: Some(external_id.to_string()),
            blob: None,
        }
    }

    /// Wire metadata for this entry.
    #[must_use]
    pub fn meta(&self) -> TrackMeta {
        TrackMeta {
            kind: self.kind,
            name: self.name.clone(),
            title: self.title.clone(),
            external_id: self.external_id.clone(),
        }
    }
}

/// The ordered sequence plus playback policy flags.
#[derive(Debug, Default)]
pub struct Playlist {
    items: Vec<PlaylistItem>,
    current_index: usize,
    repeat: RepeatMode,
    shuffle: bool,
}

impl Playlist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry; existing indices stay valid.
    pub fn push(&mut self, item: PlaylistItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    /// Removes an entry. Indices past it shift; callers must treat every
    /// previously-held index as invalidated.
    pub fn remove(&mut self, index: usize) -> Option<PlaylistItem> {
        if index >= self.items.len() {
            return None;
        }
        let removed = self.items.remove(index);
        if self.current_index >= self.items.len() {
            self.current_index = self.items.len().saturating_sub(1);
        } else if index < self.current_index {
            self.current_index -= 1;
        }
        Some(removed)
    }

    /// Replaces the whole list (guest shadow-copy rebuild).
    pub fn replace(&mut self, metas: Vec<TrackMeta>, current_index: usize) {
        self.items = metas
            .into_iter()
            .map(|m| PlaylistItem {
                kind: m.kind,
                name: m.name,
                title: m.title,
                mime: String::new(),
                external_id: m.external_id,
                blob: None,
            })
            .collect();
        self.current_index = current_index.min(self.items.len().saturating_sub(1));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&PlaylistItem> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PlaylistItem> {
        self.items.get_mut(index)
    }

    /// Finds a local-file entry by transfer name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<(usize, &PlaylistItem)> {
        self.items
            .iter()
            .enumerate()
            .find(|(_, item)| item.name == name)
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn set_current_index(&mut self, index: usize) {
        if index < self.items.len() {
            self.current_index = index;
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&PlaylistItem> {
        self.items.get(self.current_index)
    }

    #[must_use]
    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: RepeatMode) {
        self.repeat = repeat;
    }

    #[must_use]
    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn set_shuffle(&mut self, shuffle: bool) {
        self.shuffle = shuffle;
    }

    /// Wire metadata for every entry.
    #[must_use]
    pub fn metas(&self) -> Vec<TrackMeta> {
        self.items.iter().map(PlaylistItem::meta).collect()
    }

    /// Index the preload engine should fetch next, if any.
    ///
    /// - repeat-one replays the current index
    /// - shuffle picks a uniform random *other* index (same index when the
    ///   list has one entry)
    /// - otherwise the successor, wrapping only when repeat-all
    #[must_use]
    pub fn preload_index(&self) -> Option<usize> {
        let len = self.items.len();
        if len == 0 {
            return None;
        }
        match (self.repeat, self.shuffle) {
            (RepeatMode::One, _) => Some(self.current_index),
            (_, true) => Some(self.random_other_index()),
            (repeat, false) => {
                let next = self.current_index + 1;
                if next < len {
                    Some(next)
                } else if repeat == RepeatMode::All {
                    Some(0)
                } else {
                    None
                }
            }
        }
    }

    /// Index to play after the current track ends (host auto-advance).
    /// Same policy as [`Playlist::preload_index`].
    #[must_use]
    pub fn advance_index(&self) -> Option<usize> {
        self.preload_index()
    }

    /// Index for an explicit "previous" command: wraps backwards.
    #[must_use]
    pub fn prev_index(&self) -> Option<usize> {
        let len = self.items.len();
        if len == 0 {
            return None;
        }
        Some(if self.current_index == 0 {
            len - 1
        } else {
            self.current_index - 1
        })
    }

    /// Index for an explicit "next" command: wraps forwards regardless of
    /// repeat mode (user intent beats end-of-list).
    #[must_use]
    pub fn next_command_index(&self) -> Option<usize> {
        let len = self.items.len();
        if len == 0 {
            return None;
        }
        if self.shuffle {
            return Some(self.random_other_index());
        }
        Some((self.current_index + 1) % len)
    }

    fn random_other_index(&self) -> usize {
        let len = self.items.len();
        if len == 1 {
            return self.current_index;
        }
        let mut rng = rand::rng();
        // Draw from len-1 candidates and skip over the current index.
        let pick = rng.random_range(0..len - 1);
        if pick >= self.current_index {
            pick + 1
        } else {
            pick
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist_of(n: usize) -> Playlist {
        let mut playlist = Playlist::new();
        for i in 0..n {
            playlist.push(PlaylistItem::local_file(
                &format!("t{i}.wav"),
                &format!("Track {i}"),
                "audio/wav",
                Bytes::from_static(b"pcm"),
            ));
        }
        playlist
    }

    #[test]
    fn push_keeps_indices_stable() {
        let mut playlist = playlist_of(2);
        playlist.set_current_index(1);
        let idx = playlist.push(PlaylistItem::local_file(
            "t2.wav",
            "Track 2",
            "audio/wav",
            Bytes::new(),
        ));
        assert_eq!(idx, 2);
        assert_eq!(playlist.current_index(), 1);
        assert_eq!(playlist.get(1).unwrap().name, "t1.wav");
    }

    #[test]
    fn remove_shifts_current_index() {
        let mut playlist = playlist_of(3);
        playlist.set_current_index(2);
        playlist.remove(0);
        assert_eq!(playlist.current_index(), 1);
        assert_eq!(playlist.current().unwrap().name, "t2.wav");
    }

    #[test]
    fn preload_index_sequential() {
        let mut playlist = playlist_of(3);
        assert_eq!(playlist.preload_index(), Some(1));
        playlist.set_current_index(2);
        assert_eq!(playlist.preload_index(), None, "no wrap with repeat off");
        playlist.set_repeat(RepeatMode::All);
        assert_eq!(playlist.preload_index(), Some(0));
    }

    #[test]
    fn preload_index_repeat_one_stays_put() {
        let mut playlist = playlist_of(3);
        playlist.set_current_index(1);
        playlist.set_repeat(RepeatMode::One);
        playlist.set_shuffle(true); // repeat-one wins over shuffle
        assert_eq!(playlist.preload_index(), Some(1));
    }

    #[test]
    fn preload_index_shuffle_avoids_current() {
        let mut playlist = playlist_of(4);
        playlist.set_current_index(2);
        playlist.set_shuffle(true);
        for _ in 0..50 {
            let pick = playlist.preload_index().unwrap();
            assert_ne!(pick, 2);
            assert!(pick < 4);
        }
    }

    #[test]
    fn shuffle_on_singleton_returns_same_index() {
        let mut playlist = playlist_of(1);
        playlist.set_shuffle(true);
        assert_eq!(playlist.preload_index(), Some(0));
    }

    #[test]
    fn prev_and_next_commands_wrap() {
        let mut playlist = playlist_of(3);
        assert_eq!(playlist.prev_index(), Some(2));
        playlist.set_current_index(2);
        assert_eq!(playlist.next_command_index(), Some(0));
    }

    #[test]
    fn replace_builds_shadow_copy() {
        let mut playlist = playlist_of(1);
        playlist.replace(
            vec![
                TrackMeta {
                    kind: TrackKind::LocalFile,
                    name: "a.wav".into(),
                    title: "A".into(),
                    external_id: None,
                },
                TrackMeta {
                    kind: TrackKind::ExternalStream,
                    name: "ext".into(),
                    title: "Radio".into(),
                    external_id: Some("xyz".into()),
                },
            ],
            1,
        );
        assert_eq!(playlist.len(), 2);
        assert_eq!(playlist.current_index(), 1);
        assert!(playlist.get(0).unwrap().blob.is_none());
    }

    #[test]
    fn empty_playlist_has_no_next() {
        let playlist = Playlist::new();
        assert_eq!(playlist.preload_index(), None);
        assert_eq!(playlist.prev_index(), None);
        assert_eq!(playlist.next_command_index(), None);
    }
}
