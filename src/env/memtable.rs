//! # MemTable
//!
//! In-memory sorted table holding every commit since the last flush.
//!
//! Entries are keyed by [`InternalKey`] (environment key ascending, sequence
//! descending), so several versions of a key coexist and a reader holding an
//! older sequence keeps seeing the version that was current when it started.
//! Tombstones are stored as [`EntryKind::Deletion`] with an empty value.

use crate::env::batch::{WalBatch, WriteOp};
use crossbeam_skiplist::SkipMap;
use std::cmp::Ordering as CmpOrdering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Whether an entry carries a value or marks a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    /// A tombstone indicating the key has been deleted
    Deletion = 0,
    /// A normal value
    Value = 1,
}

/// Versioned key used inside the memtable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    key: Vec<u8>,
    sequence: u64,
    kind: EntryKind,
}

impl InternalKey {
    /// Creates a new InternalKey.
    pub fn new(key: Vec<u8>, sequence: u64, kind: EntryKind) -> Self {
        Self { key, sequence, kind }
    }

    /// Returns the environment key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Returns the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the entry kind.
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    // Smallest internal key for `key`: the newest possible version.
    fn first_of(key: &[u8]) -> Self {
        Self::new(key.to_vec(), u64::MAX, EntryKind::Value)
    }

    // Largest internal key for `key`: the oldest possible version.
    fn last_of(key: &[u8]) -> Self {
        Self::new(key.to_vec(), 0, EntryKind::Deletion)
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

/// A visible entry: `None` value means the key is deleted at that sequence.
pub type MemEntry = (Vec<u8>, Option<Vec<u8>>);

fn internal_bounds(from: Bound<&[u8]>, to: Bound<&[u8]>) -> (Bound<InternalKey>, Bound<InternalKey>) {
    let lower = match from {
        Bound::Included(k) => Bound::Included(InternalKey::first_of(k)),
        Bound::Excluded(k) => Bound::Excluded(InternalKey::last_of(k)),
        Bound::Unbounded => Bound::Unbounded,
    };
    let upper = match to {
        Bound::Included(k) => Bound::Included(InternalKey::last_of(k)),
        Bound::Excluded(k) => Bound::Excluded(InternalKey::first_of(k)),
        Bound::Unbounded => Bound::Unbounded,
    };
    (lower, upper)
}

fn crossed(lower: &Bound<InternalKey>, upper: &Bound<InternalKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

/// MemTable stores recent commits in a lock-free SkipList.
pub struct MemTable {
    data: SkipMap<InternalKey, Vec<u8>>,
    size: AtomicUsize,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    /// Creates a new empty MemTable.
    pub fn new() -> Self {
        Self { data: SkipMap::new(), size: AtomicUsize::new(0) }
    }

    /// Inserts a value for `key` at `sequence`.
    pub fn put(&self, key: &[u8], value: &[u8], sequence: u64) {
        let entry_size = key.len() + value.len() + 16;
        self.data.insert(InternalKey::new(key.to_vec(), sequence, EntryKind::Value), value.to_vec());
        self.size.fetch_add(entry_size, Ordering::Relaxed);
    }

    /// Marks `key` as deleted at `sequence`.
    pub fn delete(&self, key: &[u8], sequence: u64) {
        let entry_size = key.len() + 16;
        self.data.insert(InternalKey::new(key.to_vec(), sequence, EntryKind::Deletion), Vec::new());
        self.size.fetch_add(entry_size, Ordering::Relaxed);
    }

    /// Applies every operation of a committed batch.
    pub fn apply(&self, batch: &WalBatch) {
        for op in &batch.ops {
            match op {
                WriteOp::Put { key, value } => self.put(key, value, batch.sequence),
                WriteOp::Delete { key } => self.delete(key, batch.sequence),
            }
        }
    }

    /// Looks up the newest version of `key` visible at `max_sequence`.
    ///
    /// Returns `None` when the memtable knows nothing about the key,
    /// `Some(None)` when the visible version is a tombstone.
    pub fn get(&self, key: &[u8], max_sequence: u64) -> Option<Option<Vec<u8>>> {
        let range = self.data.range(InternalKey::first_of(key)..=InternalKey::last_of(key));
        for entry in range {
            if entry.key().sequence() <= max_sequence {
                return Some(match entry.key().kind() {
                    EntryKind::Value => Some(entry.value().clone()),
                    EntryKind::Deletion => None,
                });
            }
        }
        None
    }

    /// Collects the newest visible version of every key within the bounds.
    pub fn scan(&self, from: Bound<&[u8]>, to: Bound<&[u8]>, max_sequence: u64) -> Vec<MemEntry> {
        let (lower, upper) = internal_bounds(from, to);
        if crossed(&lower, &upper) {
            return Vec::new();
        }

        let mut entries: Vec<MemEntry> = Vec::new();
        for entry in self.data.range((lower, upper)) {
            let ikey = entry.key();
            if ikey.sequence() > max_sequence {
                continue;
            }
            if entries.last().is_some_and(|(last, _)| last.as_slice() == ikey.key()) {
                continue;
            }
            let value = match ikey.kind() {
                EntryKind::Value => Some(entry.value().clone()),
                EntryKind::Deletion => None,
            };
            entries.push((ikey.key().to_vec(), value));
        }
        entries
    }

    /// Lazily walks the newest visible version of every key within the
    /// bounds, descending when `reverse` is set.
    ///
    /// Each step is one fresh seek into the skip list.
    pub fn cursor(
        self: &Arc<Self>,
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
        max_sequence: u64,
        reverse: bool,
    ) -> MemCursor {
        let (lower, upper) = internal_bounds(from, to);
        MemCursor { mem: Arc::clone(self), lower, upper, max_sequence, reverse }
    }

    /// Approximate size in bytes of everything inserted.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of versioned entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the MemTable contains no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Iterator returned by [`MemTable::cursor`].
pub struct MemCursor {
    mem: Arc<MemTable>,
    lower: Bound<InternalKey>,
    upper: Bound<InternalKey>,
    max_sequence: u64,
    reverse: bool,
}

impl Iterator for MemCursor {
    type Item = MemEntry;

    fn next(&mut self) -> Option<MemEntry> {
        loop {
            if crossed(&self.lower, &self.upper) {
                return None;
            }
            let key = {
                let mut range = self.mem.data.range((self.lower.clone(), self.upper.clone()));
                let entry = if self.reverse { range.next_back() } else { range.next() }?;
                entry.key().key().to_vec()
            };
            // Step past every version of `key`.
            if self.reverse {
                self.upper = Bound::Excluded(InternalKey::first_of(&key));
            } else {
                self.lower = Bound::Excluded(InternalKey::last_of(&key));
            }
            if let Some(value) = self.mem.get(&key, self.max_sequence) {
                return Some((key, value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_ordering() {
        let a1 = InternalKey::new(b"a".to_vec(), 1, EntryKind::Value);
        let a2 = InternalKey::new(b"a".to_vec(), 2, EntryKind::Value);
        let b1 = InternalKey::new(b"b".to_vec(), 1, EntryKind::Value);
        assert!(a2 < a1);
        assert!(a1 < b1);
    }

    #[test]
    fn test_get_respects_sequence() {
        let memtable = MemTable::new();
        memtable.put(b"k", b"v1", 1);
        memtable.put(b"k", b"v2", 3);
        memtable.delete(b"k", 5);

        assert_eq!(memtable.get(b"k", 0), None);
        assert_eq!(memtable.get(b"k", 2), Some(Some(b"v1".to_vec())));
        assert_eq!(memtable.get(b"k", 4), Some(Some(b"v2".to_vec())));
        assert_eq!(memtable.get(b"k", 5), Some(None));
        assert_eq!(memtable.get(b"other", 10), None);
    }

    #[test]
    fn test_scan_bounds() {
        let memtable = MemTable::new();
        for (i, key) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            memtable.put(*key, b"x", i as u64 + 1);
        }
        memtable.put(b"b", b"y", 10);

        let keys = |entries: Vec<MemEntry>| entries.into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        let all = memtable.scan(Bound::Unbounded, Bound::Unbounded, u64::MAX);
        assert_eq!(keys(all), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let mid = memtable.scan(Bound::Excluded(b"a"), Bound::Excluded(b"d"), u64::MAX);
        assert_eq!(mid[0], (b"b".to_vec(), Some(b"y".to_vec())));
        assert_eq!(mid.len(), 2);

        let old = memtable.scan(Bound::Included(b"b"), Bound::Included(b"b"), 5);
        assert_eq!(old, vec![(b"b".to_vec(), Some(b"x".to_vec()))]);

        assert!(memtable.scan(Bound::Included(b"d"), Bound::Included(b"a"), u64::MAX).is_empty());
    }

    #[test]
    fn test_cursor_both_directions() {
        let memtable = Arc::new(MemTable::new());
        for (i, key) in [b"a", b"b", b"c", b"d", b"e"].iter().enumerate() {
            memtable.put(*key, b"x", i as u64 + 1);
        }
        memtable.put(b"b", b"y", 10);
        memtable.delete(b"c", 11);
        // Only visible to readers past sequence 20.
        memtable.put(b"e", b"late", 21);

        let keys = |cursor: MemCursor| cursor.map(|(k, _)| k).collect::<Vec<_>>();
        let forward = memtable.cursor(Bound::Unbounded, Bound::Unbounded, 20, false);
        assert_eq!(forward.collect::<Vec<_>>(), memtable.scan(Bound::Unbounded, Bound::Unbounded, 20));

        let mut backward = memtable.cursor(Bound::Excluded(b"a"), Bound::Included(b"e"), 20, true);
        assert_eq!(backward.next(), Some((b"e".to_vec(), Some(b"x".to_vec()))));
        assert_eq!(backward.next(), Some((b"d".to_vec(), Some(b"x".to_vec()))));
        assert_eq!(backward.next(), Some((b"c".to_vec(), None)));
        assert_eq!(backward.next(), Some((b"b".to_vec(), Some(b"y".to_vec()))));
        assert_eq!(backward.next(), None);

        // A key whose every version is newer than the reader is skipped.
        memtable.put(b"f", b"late", 22);
        let backward = memtable.cursor(Bound::Unbounded, Bound::Unbounded, 20, true);
        assert_eq!(keys(backward), vec![b"e".to_vec(), b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);

        assert!(memtable.cursor(Bound::Included(b"d"), Bound::Included(b"a"), u64::MAX, true).next().is_none());
    }
}
