//! Multi-way merge over memtable and table sources.
//!
//! Sources are ordered newest first. For a key present in several sources the
//! newest one wins; the merge yields tombstones as `None` and leaves filtering
//! them to the caller, so compaction and reads can share it.
//!
//! A reverse merge takes sources in descending key order and yields the
//! largest key first; the newest source still wins.

use crate::error::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A boxed source of `(key, Some(value) | None)` entries in merge order.
pub type Source = Box<dyn Iterator<Item = Result<(Vec<u8>, Option<Vec<u8>>)>> + Send>;

struct MergeEntry {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    source: usize,
    reverse: bool,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // The heap pops the greatest entry: the next key in merge order, then
        // the newest source.
        let keys = if self.reverse { self.key.cmp(&other.key) } else { other.key.cmp(&self.key) };
        keys.then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges sorted sources, newest source winning on equal keys.
pub struct MergeIterator {
    heap: BinaryHeap<MergeEntry>,
    sources: Vec<Source>,
    error: Option<crate::Error>,
    reverse: bool,
}

impl MergeIterator {
    /// Creates a merge over ascending `sources`, index 0 being the newest.
    pub fn new(sources: Vec<Source>) -> Self {
        Self::with_direction(sources, false)
    }

    /// Creates a merge over descending `sources`, index 0 being the newest.
    pub fn new_reverse(sources: Vec<Source>) -> Self {
        Self::with_direction(sources, true)
    }

    fn with_direction(sources: Vec<Source>, reverse: bool) -> Self {
        let mut iter = Self { heap: BinaryHeap::new(), sources, error: None, reverse };
        for index in 0..iter.sources.len() {
            iter.advance(index);
        }
        iter
    }

    fn advance(&mut self, index: usize) {
        match self.sources[index].next() {
            Some(Ok((key, value))) => {
                self.heap.push(MergeEntry { key, value, source: index, reverse: self.reverse })
            }
            Some(Err(e)) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            self.heap.clear();
            return Some(Err(e));
        }
        let entry = self.heap.pop()?;
        self.advance(entry.source);

        // Drop older versions of the same key.
        while self.heap.peek().is_some_and(|next| next.key == entry.key) {
            if let Some(shadowed) = self.heap.pop() {
                self.advance(shadowed.source);
            }
        }
        if let Some(e) = self.error.take() {
            self.heap.clear();
            return Some(Err(e));
        }
        Some(Ok((entry.key, entry.value)))
    }
}
