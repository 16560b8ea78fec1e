//! Read and write transactions.
//!
//! A [`ReadTxn`] pins the view (memtable plus tables) and the sequence that
//! were current when it began. A [`WriteTxn`] owns the environment's writer
//! lock and buffers its changes in an overlay that its own reads see; nothing
//! reaches the WAL or the memtable until [`WriteTxn::commit`].
//!
//! Iterators returned by [`Txn::range`] are owned snapshots: a write
//! transaction may keep mutating while it walks one.

use crate::env::merge::{MergeIterator, Source};
use crate::env::{EnvInner, View, WriterState};
use crate::error::{Error, Result};
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Longest key accepted by a sub-database.
pub const MAX_KEY_LENGTH: usize = 511;

/// Handle to a named sub-database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Db {
    id: u32,
}

impl Db {
    pub(crate) fn new(id: u32) -> Self {
        Self { id }
    }

    /// Numeric id of the sub-database.
    pub fn id(&self) -> u32 {
        self.id
    }

    fn prefix(&self) -> [u8; 4] {
        self.id.to_be_bytes()
    }

    pub(crate) fn env_key(&self, key: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(key.len() + 4);
        buf.extend_from_slice(&self.prefix());
        buf.extend_from_slice(key);
        buf
    }

    fn bounds(&self, from: Bound<&[u8]>, to: Bound<&[u8]>) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let lower = match from {
            Bound::Included(k) => Bound::Included(self.env_key(k)),
            Bound::Excluded(k) => Bound::Excluded(self.env_key(k)),
            Bound::Unbounded => Bound::Included(self.prefix().to_vec()),
        };
        let upper = match to {
            Bound::Included(k) => Bound::Included(self.env_key(k)),
            Bound::Excluded(k) => Bound::Excluded(self.env_key(k)),
            Bound::Unbounded => Bound::Excluded((self.id + 1).to_be_bytes().to_vec()),
        };
        (lower, upper)
    }
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

fn is_empty_range(lower: &Bound<Vec<u8>>, upper: &Bound<Vec<u8>>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

fn as_ref_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Live entries of one sub-database, ascending or descending.
///
/// Keys are returned without the sub-database prefix. Tombstones are skipped.
pub struct EntryIter {
    inner: Option<MergeIterator>,
    // The bound the walk heads towards: upper when ascending, lower when not.
    end: Bound<Vec<u8>>,
    reverse: bool,
}

impl EntryIter {
    fn new(sources: Vec<Source>, upper: Bound<Vec<u8>>) -> Self {
        Self { inner: Some(MergeIterator::new(sources)), end: upper, reverse: false }
    }

    fn new_reverse(sources: Vec<Source>, lower: Bound<Vec<u8>>) -> Self {
        Self { inner: Some(MergeIterator::new_reverse(sources)), end: lower, reverse: true }
    }

    fn empty() -> Self {
        Self { inner: None, end: Bound::Unbounded, reverse: false }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match (&self.end, self.reverse) {
            (Bound::Included(u), false) => key > u.as_slice(),
            (Bound::Excluded(u), false) => key >= u.as_slice(),
            (Bound::Included(l), true) => key < l.as_slice(),
            (Bound::Excluded(l), true) => key <= l.as_slice(),
            (Bound::Unbounded, _) => false,
        }
    }
}

impl Iterator for EntryIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = self.inner.as_mut()?.next();
            match item {
                None => {
                    self.inner = None;
                    return None;
                }
                Some(Err(e)) => {
                    self.inner = None;
                    return Some(Err(e));
                }
                Some(Ok((key, value))) => {
                    if self.past_end(&key) {
                        self.inner = None;
                        return None;
                    }
                    if let Some(value) = value {
                        return Some(Ok((key[4..].to_vec(), value)));
                    }
                }
            }
        }
    }
}

/// Read access shared by read and write transactions.
pub trait Txn {
    /// Value stored under `key`, if any.
    fn get(&self, db: Db, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Entries with keys between the bounds, ascending.
    fn range(&self, db: Db, from: Bound<&[u8]>, to: Bound<&[u8]>) -> EntryIter;

    /// Entries with keys between the bounds, descending.
    fn range_rev(&self, db: Db, from: Bound<&[u8]>, to: Bound<&[u8]>) -> EntryIter;

    /// Every entry of `db`, ascending.
    fn iter(&self, db: Db) -> EntryIter {
        self.range(db, Bound::Unbounded, Bound::Unbounded)
    }

    /// Entries whose key starts with `prefix`.
    fn prefix(&self, db: Db, prefix: &[u8]) -> EntryIter {
        match prefix_successor(prefix) {
            Some(end) => self.range(db, Bound::Included(prefix), Bound::Excluded(end.as_slice())),
            None => self.range(db, Bound::Included(prefix), Bound::Unbounded),
        }
    }

    /// Last entry between the bounds.
    fn last_in_range(
        &self,
        db: Db,
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.range_rev(db, from, to).next().transpose()
    }

    /// Number of live entries in `db`.
    fn count(&self, db: Db) -> Result<u64> {
        let mut count = 0;
        for entry in self.iter(db) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

/// A consistent read-only view of the environment.
#[derive(Clone)]
pub struct ReadTxn {
    view: Arc<View>,
    sequence: u64,
}

impl ReadTxn {
    pub(crate) fn new(view: Arc<View>, sequence: u64) -> Self {
        Self { view, sequence }
    }

    /// Sequence this transaction reads at.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn get_env_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.view.memtable.get(key, self.sequence) {
            return Ok(entry);
        }
        for table in &self.view.tables {
            if let Some(entry) = table.get(key)? {
                return Ok(entry);
            }
        }
        Ok(None)
    }

    fn sources(&self, lower: &Bound<Vec<u8>>, upper: &Bound<Vec<u8>>, reverse: bool) -> Vec<Source> {
        let mut sources: Vec<Source> = Vec::with_capacity(self.view.tables.len() + 1);
        let mem = self.view.memtable.cursor(as_ref_bound(lower), as_ref_bound(upper), self.sequence, reverse);
        sources.push(Box::new(mem.map(Ok::<_, Error>)));
        for table in &self.view.tables {
            if reverse {
                sources.push(Box::new(table.iter_rev(as_ref_bound(upper))));
            } else {
                sources.push(Box::new(table.iter(as_ref_bound(lower))));
            }
        }
        sources
    }
}

impl Txn for ReadTxn {
    fn get(&self, db: Db, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_env_key(&db.env_key(key))
    }

    fn range(&self, db: Db, from: Bound<&[u8]>, to: Bound<&[u8]>) -> EntryIter {
        let (lower, upper) = db.bounds(from, to);
        if is_empty_range(&lower, &upper) {
            return EntryIter::empty();
        }
        let sources = self.sources(&lower, &upper, false);
        EntryIter::new(sources, upper)
    }

    fn range_rev(&self, db: Db, from: Bound<&[u8]>, to: Bound<&[u8]>) -> EntryIter {
        let (lower, upper) = db.bounds(from, to);
        if is_empty_range(&lower, &upper) {
            return EntryIter::empty();
        }
        let sources = self.sources(&lower, &upper, true);
        EntryIter::new_reverse(sources, lower)
    }
}

/// The environment's single writer.
///
/// Dropping a `WriteTxn` without calling [`commit`](WriteTxn::commit) discards
/// every change it made.
pub struct WriteTxn<'env> {
    inner: &'env EnvInner,
    state: MutexGuard<'env, WriterState>,
    base: ReadTxn,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'env> WriteTxn<'env> {
    pub(crate) fn new(inner: &'env EnvInner, state: MutexGuard<'env, WriterState>, base: ReadTxn) -> Self {
        Self { inner, state, base, pending: BTreeMap::new() }
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::validation(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                MAX_KEY_LENGTH
            )));
        }
        Ok(())
    }

    /// Stores `value` under `key`, replacing any existing value.
    pub fn put(&mut self, db: Db, key: &[u8], value: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        self.pending.insert(db.env_key(key), Some(value.to_vec()));
        Ok(())
    }

    /// Stores `value` only if `key` is absent. Returns whether it was written.
    pub fn put_if_absent(&mut self, db: Db, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.get(db, key)?.is_some() {
            return Ok(false);
        }
        self.put(db, key, value)?;
        Ok(true)
    }

    /// Removes `key`. Returns whether a value was present.
    pub fn delete(&mut self, db: Db, key: &[u8]) -> Result<bool> {
        let existed = self.get(db, key)?.is_some();
        if existed {
            self.pending.insert(db.env_key(key), None);
        }
        Ok(existed)
    }

    /// Number of buffered changes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Applies the buffered changes atomically.
    pub fn commit(mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        self.inner.commit(&mut self.state, pending)
    }

    /// Discards the buffered changes.
    pub fn abort(self) {}

    // Owned copy of the buffered changes within the bounds.
    fn overlay(&self, lower: &Bound<Vec<u8>>, upper: &Bound<Vec<u8>>, reverse: bool) -> Source {
        let range = self.pending.range((lower.clone(), upper.clone()));
        let copy = |(k, v): (&Vec<u8>, &Option<Vec<u8>>)| Ok::<_, Error>((k.clone(), v.clone()));
        let overlay: Vec<Result<(Vec<u8>, Option<Vec<u8>>)>> =
            if reverse { range.rev().map(copy).collect() } else { range.map(copy).collect() };
        Box::new(overlay.into_iter())
    }
}

impl Txn for WriteTxn<'_> {
    fn get(&self, db: Db, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let env_key = db.env_key(key);
        match self.pending.get(&env_key) {
            Some(value) => Ok(value.clone()),
            None => self.base.get_env_key(&env_key),
        }
    }

    fn range(&self, db: Db, from: Bound<&[u8]>, to: Bound<&[u8]>) -> EntryIter {
        let (lower, upper) = db.bounds(from, to);
        if is_empty_range(&lower, &upper) {
            return EntryIter::empty();
        }
        let mut sources = vec![self.overlay(&lower, &upper, false)];
        sources.extend(self.base.sources(&lower, &upper, false));
        EntryIter::new(sources, upper)
    }

    fn range_rev(&self, db: Db, from: Bound<&[u8]>, to: Bound<&[u8]>) -> EntryIter {
        let (lower, upper) = db.bounds(from, to);
        if is_empty_range(&lower, &upper) {
            return EntryIter::empty();
        }
        let mut sources = vec![self.overlay(&lower, &upper, true)];
        sources.extend(self.base.sources(&lower, &upper, true));
        EntryIter::new_reverse(sources, lower)
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::debug!("Aborting write transaction with {} pending changes", self.pending.len());
        }
    }
}
