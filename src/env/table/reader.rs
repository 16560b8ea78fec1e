//! Memory-mapped table reader.
//!
//! The mapping is created once at open. Later reads only touch the mapping,
//! so a table whose file has been unlinked (compaction, or the whole shard
//! directory removed by an operator) stays readable for as long as a view
//! holds it.

use crate::env::table::block::{decode_block, read_block};
use crate::env::table::{untag_value, BlockHandle, Footer, FOOTER_SIZE};
use crate::error::{Error, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An open, immutable table.
#[derive(Debug)]
pub struct Table {
    number: u64,
    path: PathBuf,
    mmap: Mmap,
    index: Vec<(Vec<u8>, BlockHandle)>,
    num_entries: u64,
}

impl Table {
    /// Maps the table file and loads its index.
    pub fn open<P: AsRef<Path>>(path: P, number: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len() as usize;
        if file_size < FOOTER_SIZE {
            return Err(Error::corruption(format!("Table {:?} too small: {} bytes", path, file_size)));
        }

        // SAFETY: table files are never modified after `TableBuilder::finish`.
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let footer = Footer::decode(&mmap[file_size - FOOTER_SIZE..])?;
        let index_data = read_block(&mmap, &footer.index_handle)?;
        let index = decode_block(&index_data)?
            .into_iter()
            .map(|(last_key, handle)| Ok((last_key, BlockHandle::decode(&handle)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { number, path, mmap, index, num_entries: footer.num_entries })
    }

    /// Table file number.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Path of the table file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the mapped file in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Number of entries, tombstones included.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    fn load_block(&self, index: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = read_block(&self.mmap, &self.index[index].1)?;
        decode_block(&data)
    }

    // Index of the first block whose last key is >= `key`.
    fn block_for(&self, key: &[u8]) -> usize {
        self.index.partition_point(|(last, _)| last.as_slice() < key)
    }

    /// Looks up `key`.
    ///
    /// Returns `None` when the table has no entry, `Some(None)` for a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        let block = self.block_for(key);
        if block >= self.index.len() {
            return Ok(None);
        }
        let entries = self.load_block(block)?;
        match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(pos) => Ok(Some(untag_value(&entries[pos].1)?)),
            Err(_) => Ok(None),
        }
    }

    /// Iterates entries from the lower bound to the end of the table.
    pub fn iter(self: &Arc<Self>, from: Bound<&[u8]>) -> TableIter {
        let block = match from {
            Bound::Included(k) | Bound::Excluded(k) => self.block_for(k),
            Bound::Unbounded => 0,
        };
        TableIter {
            table: Arc::clone(self),
            block,
            entries: Vec::new(),
            pos: 0,
            lower: from.map(|k| k.to_vec()),
            done: false,
        }
    }

    /// Iterates entries backwards from the upper bound to the start of the
    /// table.
    pub fn iter_rev(self: &Arc<Self>, to: Bound<&[u8]>) -> TableRevIter {
        let last = self.index.len().checked_sub(1);
        let next_block = match to {
            Bound::Included(k) | Bound::Excluded(k) => last.map(|last| self.block_for(k).min(last)),
            Bound::Unbounded => last,
        };
        TableRevIter {
            table: Arc::clone(self),
            next_block,
            entries: Vec::new(),
            remaining: 0,
            upper: to.map(|k| k.to_vec()),
            done: false,
        }
    }
}

/// Streams the entries of one table, loading a block at a time.
pub struct TableIter {
    table: Arc<Table>,
    block: usize,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
    lower: Bound<Vec<u8>>,
    done: bool,
}

impl TableIter {
    fn fill(&mut self) -> Result<bool> {
        while self.pos >= self.entries.len() {
            if self.block >= self.table.index.len() {
                return Ok(false);
            }
            self.entries = self.table.load_block(self.block)?;
            self.block += 1;
            self.pos = match &self.lower {
                Bound::Included(k) => self.entries.partition_point(|(e, _)| e < k),
                Bound::Excluded(k) => self.entries.partition_point(|(e, _)| e <= k),
                Bound::Unbounded => 0,
            };
            self.lower = Bound::Unbounded;
        }
        Ok(true)
    }
}

impl Iterator for TableIter {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(true) => {}
            Ok(false) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        }
        let (key, stored) = std::mem::take(&mut self.entries[self.pos]);
        self.pos += 1;
        Some(untag_value(&stored).map(|value| (key, value)))
    }
}

/// Streams the entries of one table in descending key order.
pub struct TableRevIter {
    table: Arc<Table>,
    next_block: Option<usize>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    // Entries of the current block not yet yielded, counted from the front.
    remaining: usize,
    upper: Bound<Vec<u8>>,
    done: bool,
}

impl TableRevIter {
    fn fill(&mut self) -> Result<bool> {
        while self.remaining == 0 {
            let Some(block) = self.next_block else {
                return Ok(false);
            };
            self.entries = self.table.load_block(block)?;
            self.next_block = block.checked_sub(1);
            self.remaining = match &self.upper {
                Bound::Included(k) => self.entries.partition_point(|(e, _)| e <= k),
                Bound::Excluded(k) => self.entries.partition_point(|(e, _)| e < k),
                Bound::Unbounded => self.entries.len(),
            };
            self.upper = Bound::Unbounded;
        }
        Ok(true)
    }
}

impl Iterator for TableRevIter {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(true) => {}
            Ok(false) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.remaining -= 1;
        let (key, stored) = std::mem::take(&mut self.entries[self.remaining]);
        Some(untag_value(&stored).map(|value| (key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::table::{tag_value, TableBuilder};
    use tempfile::TempDir;

    fn build(dir: &TempDir, n: usize) -> Arc<Table> {
        let path = dir.path().join("000001.sst");
        let mut builder = TableBuilder::new(&path).unwrap();
        builder.set_block_size(128);
        for i in 0..n {
            let key = format!("key{:05}", i);
            let value = if i % 10 == 9 { tag_value(None) } else { tag_value(Some(key.as_bytes())) };
            builder.add(key.as_bytes(), &value).unwrap();
        }
        builder.finish().unwrap();
        Arc::new(Table::open(&path, 1).unwrap())
    }

    #[test]
    fn test_table_get() {
        let dir = TempDir::new().unwrap();
        let table = build(&dir, 500);
        assert_eq!(table.num_entries(), 500);

        assert_eq!(table.get(b"key00042").unwrap(), Some(Some(b"key00042".to_vec())));
        assert_eq!(table.get(b"key00049").unwrap(), Some(None));
        assert_eq!(table.get(b"key99999").unwrap(), None);
        assert_eq!(table.get(b"aaa").unwrap(), None);
    }

    #[test]
    fn test_table_iter_from_bound() {
        let dir = TempDir::new().unwrap();
        let table = build(&dir, 300);

        let all: Vec<_> = table.iter(Bound::Unbounded).map(|r| r.unwrap()).collect();
        assert_eq!(all.len(), 300);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

        let mut iter = table.iter(Bound::Excluded(b"key00100"));
        assert_eq!(iter.next().unwrap().unwrap().0, b"key00101".to_vec());

        let mut iter = table.iter(Bound::Included(b"key00100"));
        assert_eq!(iter.next().unwrap().unwrap().0, b"key00100".to_vec());
    }

    #[test]
    fn test_table_iter_rev_from_bound() {
        let dir = TempDir::new().unwrap();
        let table = build(&dir, 300);

        let all: Vec<_> = table.iter_rev(Bound::Unbounded).map(|r| r.unwrap()).collect();
        assert_eq!(all.len(), 300);
        assert_eq!(all[0].0, b"key00299".to_vec());
        assert!(all.windows(2).all(|w| w[0].0 > w[1].0));

        let mut iter = table.iter_rev(Bound::Excluded(b"key00100"));
        assert_eq!(iter.next().unwrap().unwrap().0, b"key00099".to_vec());

        let mut iter = table.iter_rev(Bound::Included(b"key00100"));
        assert_eq!(iter.next().unwrap().unwrap(), (b"key00100".to_vec(), Some(b"key00100".to_vec())));
        assert_eq!(iter.count(), 100);

        // Between two keys, and past either end of the table.
        let mut iter = table.iter_rev(Bound::Included(b"key00100a"));
        assert_eq!(iter.next().unwrap().unwrap().0, b"key00100".to_vec());
        let mut iter = table.iter_rev(Bound::Included(b"zzz"));
        assert_eq!(iter.next().unwrap().unwrap().0, b"key00299".to_vec());
        assert!(table.iter_rev(Bound::Excluded(b"key00000")).next().is_none());
        assert!(table.iter_rev(Bound::Included(b"aaa")).next().is_none());
    }

    #[test]
    fn test_table_readable_after_unlink() {
        let dir = TempDir::new().unwrap();
        let table = build(&dir, 50);
        std::fs::remove_file(table.path()).unwrap();
        assert_eq!(table.get(b"key00001").unwrap(), Some(Some(b"key00001".to_vec())));
    }

    #[test]
    fn test_truncated_table_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.sst");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(Table::open(&path, 1), Err(Error::Corruption(_))));
    }
}
