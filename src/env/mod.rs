//! # Shard environment
//!
//! An `Env` is one storage directory holding any number of named
//! sub-databases. It gives the engine variants what they need from an
//! embedded store:
//!
//! - **single writer, many readers**: write transactions are serialized on a
//!   mutex; read transactions pin an immutable view and a sequence number, so
//!   they never see a partial commit and never wait for the writer.
//! - **durability**: every commit is appended to a write-ahead log before it
//!   becomes visible.
//! - **memory-mapped tables**: when the memtable grows past
//!   [`EnvOptions::memtable_size`] it is flushed into an immutable sorted table
//!   that readers access through a mapping.
//!
//! ## Directory layout
//!
//! ```text
//! <dir>/LOCK           held by the read-write opener
//! <dir>/MANIFEST       tables, live log number, sub-database registry
//! <dir>/000001.log     write-ahead log
//! <dir>/000002.sst     tables
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use planb::env::{Env, Txn};
//! use planb::EnvOptions;
//!
//! # fn main() -> planb::Result<()> {
//! let env = Env::open("./shard", EnvOptions::default())?;
//! let db = env.open_db("data")?;
//! env.write(|txn| txn.put(db, b"key", b"value"))?;
//! assert_eq!(env.begin_read().get(db, b"key")?, Some(b"value".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod table;
pub mod txn;
pub mod wal;

pub use txn::{prefix_successor, Db, EntryIter, ReadTxn, Txn, WriteTxn, MAX_KEY_LENGTH};

use crate::config::EnvOptions;
use crate::env::batch::WalBatch;
use crate::env::manifest::{Manifest, TableMeta, MANIFEST_FILE};
use crate::env::memtable::MemTable;
use crate::env::merge::{MergeIterator, Source};
use crate::env::table::{table_filename, tag_value, Table, TableBuilder};
use crate::env::wal::{wal_filename, WalReader, WalWriter};
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a reader sees: the live memtable plus the tables, newest first.
pub(crate) struct View {
    pub(crate) memtable: Arc<MemTable>,
    pub(crate) tables: Vec<Arc<Table>>,
}

/// State owned by whoever holds the writer lock.
pub(crate) struct WriterState {
    manifest: Manifest,
    wal: Option<WalWriter>,
    sequence: u64,
}

pub(crate) struct EnvInner {
    path: PathBuf,
    _lock: Option<fs::File>,
    options: EnvOptions,
    current: RwLock<(Arc<View>, u64)>,
    writer: Mutex<WriterState>,
    dbs: RwLock<BTreeMap<String, u32>>,
}

/// Space usage and shape of an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvStat {
    /// Number of tables
    pub tables: usize,
    /// Bytes held in tables
    pub table_bytes: u64,
    /// Approximate bytes held in the memtable
    pub memtable_bytes: usize,
    /// Entries across tables, tombstones and shadowed versions included
    pub table_entries: u64,
    /// Last committed sequence
    pub sequence: u64,
}

/// An open storage environment. Cheap to clone.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("path", &self.inner.path)
            .field("read_only", &self.inner.options.read_only)
            .finish()
    }
}

/// Name of the file a read-write opener locks.
pub const LOCK_FILE: &str = "LOCK";

fn dir_has_entries(path: &Path) -> Result<bool> {
    for entry in fs::read_dir(path)? {
        if entry?.file_name() != LOCK_FILE {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Takes the exclusive lock that keeps a second writer out of `path`.
fn lock_dir(path: &Path) -> Result<fs::File> {
    let file = fs::OpenOptions::new().create(true).truncate(false).write(true).open(path.join(LOCK_FILE))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(fs::TryLockError::WouldBlock) => Err(Error::Locked(path.to_path_buf())),
        Err(fs::TryLockError::Error(e)) => Err(Error::Io(e)),
    }
}

impl Env {
    /// Opens the environment at `path`.
    ///
    /// A missing or empty directory is initialised unless the options are
    /// read only (then it is [`Error::NotFound`]). A read-write open locks the
    /// directory until the last clone is dropped; a second read-write open
    /// meanwhile is [`Error::Locked`]. A directory with files but
    /// no manifest, a garbled manifest, or a damaged table is reported as
    /// [`Error::CorruptShard`].
    pub fn open<P: AsRef<Path>>(path: P, options: EnvOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let read_only = options.read_only;

        let has_manifest = path.join(MANIFEST_FILE).is_file();
        if !has_manifest {
            if path.is_dir() && dir_has_entries(&path)? {
                return Err(Error::corrupt_shard(&path, "directory has files but no manifest"));
            }
            if read_only || !options.create_if_missing {
                return Err(Error::not_found(format!("no environment at {:?}", path)));
            }
            fs::create_dir_all(&path)?;
        }
        let lock = if read_only { None } else { Some(lock_dir(&path)?) };
        if !has_manifest {
            Manifest::default().store(&path)?;
            log::info!("Created environment at {:?}", path);
        }

        let manifest = Manifest::load(&path)?;
        let mut tables = Vec::with_capacity(manifest.tables.len());
        for meta in &manifest.tables {
            let table = Table::open(path.join(table_filename(meta.number)), meta.number)
                .map_err(|e| Error::corrupt_shard(&path, format!("table {}: {}", meta.number, e)))?;
            tables.push(Arc::new(table));
        }

        let memtable = Arc::new(MemTable::new());
        let mut sequence = manifest.last_sequence;
        let log_path = path.join(wal_filename(manifest.log_number));
        if log_path.is_file() {
            for batch in WalReader::open(&log_path)?.recover()? {
                if batch.sequence > manifest.last_sequence {
                    memtable.apply(&batch);
                    sequence = sequence.max(batch.sequence);
                }
            }
        }
        log::debug!(
            "Opened environment {:?}: {} tables, {} recovered entries, sequence {}",
            path,
            tables.len(),
            memtable.len(),
            sequence
        );

        let dbs = manifest.dbs.clone();
        let view = Arc::new(View { memtable, tables });
        let inner = EnvInner {
            path,
            _lock: lock,
            options,
            current: RwLock::new((view, sequence)),
            writer: Mutex::new(WriterState { manifest, wal: None, sequence }),
            dbs: RwLock::new(dbs),
        };

        if !read_only {
            // Start from a clean log: recovered entries go to a table, a torn
            // tail is discarded.
            let mut state = inner.writer.lock();
            if inner.view().memtable.is_empty() {
                fs::File::create(&log_path)?;
                state.wal = Some(WalWriter::open(&log_path)?);
            } else {
                inner.flush(&mut state)?;
            }
        }

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Directory of the environment.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether the environment was opened read only.
    pub fn is_read_only(&self) -> bool {
        self.inner.options.read_only
    }

    /// Returns the handle of sub-database `name`, registering it if needed.
    ///
    /// Must not be called while this thread holds a [`WriteTxn`].
    pub fn open_db(&self, name: &str) -> Result<Db> {
        if let Some(id) = self.inner.dbs.read().get(name) {
            return Ok(Db::new(*id));
        }

        if self.is_read_only() {
            // Unknown to this environment, so it is empty; the id is not persisted.
            let mut dbs = self.inner.dbs.write();
            let next = dbs.values().max().map_or(1, |max| max + 1);
            let id = *dbs.entry(name.to_string()).or_insert(next);
            return Ok(Db::new(id));
        }

        let mut state = self.inner.writer.lock();
        let id = match state.manifest.dbs.get(name) {
            Some(id) => *id,
            None => {
                let id = state.manifest.next_db_id();
                state.manifest.dbs.insert(name.to_string(), id);
                state.manifest.store(&self.inner.path)?;
                log::debug!("Registered sub-database {:?} as {} in {:?}", name, id, self.inner.path);
                id
            }
        };
        self.inner.dbs.write().insert(name.to_string(), id);
        Ok(Db::new(id))
    }

    /// Names of the registered sub-databases.
    pub fn db_names(&self) -> Vec<String> {
        self.inner.dbs.read().keys().cloned().collect()
    }

    /// Starts a read transaction on the current state.
    pub fn begin_read(&self) -> ReadTxn {
        let current = self.inner.current.read();
        ReadTxn::new(Arc::clone(&current.0), current.1)
    }

    /// Runs `f` against a read transaction.
    pub fn read<R>(&self, f: impl FnOnce(&ReadTxn) -> Result<R>) -> Result<R> {
        f(&self.begin_read())
    }

    /// Acquires the writer lock and starts a write transaction.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        if self.is_read_only() {
            return Err(Error::ReadOnly(self.inner.path.clone()));
        }
        let state = self.inner.writer.lock();
        let base = self.begin_read();
        Ok(WriteTxn::new(&self.inner, state, base))
    }

    /// Runs `f` in a write transaction.
    ///
    /// Commits when `f` returns `Ok`; when it returns `Err` or panics, every
    /// change it made is discarded.
    pub fn write<R>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> Result<R>) -> Result<R> {
        let mut txn = self.begin_write()?;
        let result = f(&mut txn)?;
        txn.commit()?;
        Ok(result)
    }

    /// Runs `f` while no write transaction can start.
    ///
    /// The log is synced first, so the directory on disk reflects every
    /// commit made so far. Open read transactions are unaffected.
    pub fn lock<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        if self.is_read_only() {
            return f();
        }
        let mut state = self.inner.writer.lock();
        if let Some(wal) = state.wal.as_mut() {
            wal.sync()?;
        }
        f()
    }

    /// Flushes the memtable and rewrites all tables into one, dropping deleted
    /// and overwritten entries.
    pub fn compact(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly(self.inner.path.clone()));
        }
        let mut state = self.inner.writer.lock();
        self.inner.compact(&mut state)
    }

    /// Flushes the memtable into a table.
    pub fn flush(&self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        let mut state = self.inner.writer.lock();
        self.inner.flush(&mut state)
    }

    /// Syncs the write-ahead log.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.inner.writer.lock();
        if let Some(wal) = state.wal.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }

    /// Current space usage.
    pub fn stat(&self) -> EnvStat {
        let current = self.inner.current.read();
        let (view, sequence) = (&current.0, current.1);
        EnvStat {
            tables: view.tables.len(),
            table_bytes: view.tables.iter().map(|t| t.file_size()).sum(),
            memtable_bytes: view.memtable.approximate_size(),
            table_entries: view.tables.iter().map(|t| t.num_entries()).sum(),
            sequence,
        }
    }
}

impl EnvInner {
    fn view(&self) -> Arc<View> {
        Arc::clone(&self.current.read().0)
    }

    fn publish(&self, view: Arc<View>, sequence: u64) {
        *self.current.write() = (view, sequence);
    }

    pub(crate) fn commit(
        &self,
        state: &mut WriterState,
        pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = WalBatch::from_pending(state.sequence + 1, pending);
        let view = self.view();

        let used = state.manifest.table_bytes()
            + view.memtable.approximate_size() as u64
            + batch.approximate_size() as u64;
        if used > self.options.max_store_size {
            return Err(Error::StoreFull { used, limit: self.options.max_store_size });
        }

        let wal = state.wal.as_mut().ok_or_else(|| Error::ReadOnly(self.path.clone()))?;
        wal.append(&batch)?;
        if self.options.sync_wal {
            wal.sync()?;
        } else {
            wal.flush()?;
        }

        view.memtable.apply(&batch);
        state.sequence = batch.sequence;
        self.publish(Arc::clone(&view), state.sequence);

        if view.memtable.approximate_size() >= self.options.memtable_size {
            self.flush(state)?;
        }
        Ok(())
    }

    fn write_table(
        &self,
        state: &mut WriterState,
        sources: Vec<Source>,
        keep_tombstones: bool,
    ) -> Result<Option<(TableMeta, Arc<Table>)>> {
        let number = state.manifest.allocate_file_number();
        let path = self.path.join(table_filename(number));
        let mut builder = TableBuilder::new(&path)?;
        builder.set_block_size(self.options.block_size);
        builder.set_compression(self.options.compression);

        for entry in MergeIterator::new(sources) {
            let (key, value) = entry?;
            if value.is_none() && !keep_tombstones {
                continue;
            }
            builder.add(&key, &tag_value(value.as_deref()))?;
        }

        let entries = builder.num_entries();
        if entries == 0 {
            drop(builder);
            fs::remove_file(&path)?;
            return Ok(None);
        }
        let size = builder.finish()?;
        let table = Arc::new(Table::open(&path, number)?);
        Ok(Some((TableMeta { number, size, entries }, table)))
    }

    // Moves the memtable into a table and starts a new log.
    fn flush(&self, state: &mut WriterState) -> Result<()> {
        let view = self.view();
        if view.memtable.is_empty() {
            return Ok(());
        }

        let entries = view.memtable.scan(Bound::Unbounded, Bound::Unbounded, u64::MAX);
        let source: Source = Box::new(entries.into_iter().map(Ok::<_, Error>));
        let keep_tombstones = !view.tables.is_empty();
        let written = self.write_table(state, vec![source], keep_tombstones)?;

        let old_log = state.manifest.log_number;
        let new_log = state.manifest.allocate_file_number();
        let mut tables = view.tables.clone();
        if let Some((meta, table)) = written {
            log::info!(
                "Flushed memtable of {:?} into table {} ({} bytes)",
                self.path,
                meta.number,
                meta.size
            );
            state.manifest.tables.insert(0, meta);
            tables.insert(0, table);
        }
        state.manifest.log_number = new_log;
        state.manifest.last_sequence = state.sequence;
        state.manifest.store(&self.path)?;

        state.wal = Some(WalWriter::open(self.path.join(wal_filename(new_log)))?);
        if let Err(e) = fs::remove_file(self.path.join(wal_filename(old_log))) {
            log::warn!("Failed to remove old log {} in {:?}: {}", old_log, self.path, e);
        }

        self.publish(Arc::new(View { memtable: Arc::new(MemTable::new()), tables }), state.sequence);
        Ok(())
    }

    fn compact(&self, state: &mut WriterState) -> Result<()> {
        self.flush(state)?;
        let view = self.view();
        if view.tables.is_empty() {
            return Ok(());
        }
        let before: u64 = view.tables.iter().map(|t| t.file_size()).sum();

        let sources: Vec<Source> = view
            .tables
            .iter()
            .map(|t| Box::new(t.iter(Bound::Unbounded)) as Source)
            .collect();
        let written = self.write_table(state, sources, false)?;

        let obsolete: Vec<u64> = state.manifest.tables.iter().map(|t| t.number).collect();
        let mut tables = Vec::new();
        state.manifest.tables.clear();
        if let Some((meta, table)) = written {
            state.manifest.tables.push(meta);
            tables.push(table);
        }
        state.manifest.store(&self.path)?;

        for number in obsolete {
            if let Err(e) = fs::remove_file(self.path.join(table_filename(number))) {
                log::warn!("Failed to remove table {} in {:?}: {}", number, self.path, e);
            }
        }

        let after = state.manifest.table_bytes();
        self.publish(Arc::new(View { memtable: Arc::clone(&view.memtable), tables }), state.sequence);
        log::info!("Compacted {:?}: {} -> {} bytes", self.path, before, after);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_options() -> EnvOptions {
        EnvOptions::default().memtable_size(1024).block_size(256)
    }

    #[test]
    fn test_write_commit_and_abort() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let db = env.open_db("data").unwrap();

        env.write(|txn| txn.put(db, b"a", b"1")).unwrap();
        let result: Result<()> = env.write(|txn| {
            txn.put(db, b"b", b"2")?;
            Err(Error::internal("boom"))
        });
        assert!(result.is_err());

        let read = env.begin_read();
        assert_eq!(read.get(db, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(read.get(db, b"b").unwrap(), None);
    }

    #[test]
    fn test_reader_isolation() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), small_options()).unwrap();
        let db = env.open_db("data").unwrap();
        env.write(|txn| txn.put(db, b"k", b"old")).unwrap();

        let before = env.begin_read();
        for i in 0..200u32 {
            env.write(|txn| txn.put(db, &i.to_be_bytes(), &[0u8; 32])).unwrap();
        }
        env.write(|txn| txn.put(db, b"k", b"new")).unwrap();

        assert_eq!(before.get(db, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(before.count(db).unwrap(), 1);
        assert_eq!(env.begin_read().get(db, b"k").unwrap(), Some(b"new".to_vec()));
        assert!(env.stat().tables > 0);
    }

    #[test]
    fn test_sub_databases_are_isolated() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let a = env.open_db("a").unwrap();
        let b = env.open_db("b").unwrap();
        env.write(|txn| {
            txn.put(a, b"k1", b"a1")?;
            txn.put(b, b"k0", b"b0")?;
            txn.put(b, b"k2", b"b2")
        })
        .unwrap();

        let read = env.begin_read();
        let keys: Vec<_> = read.iter(a).map(|e| e.unwrap().0).collect();
        assert_eq!(keys, vec![b"k1".to_vec()]);
        assert_eq!(read.count(b).unwrap(), 2);
        assert_eq!(env.db_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_iterate_while_writing() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let db = env.open_db("data").unwrap();
        env.write(|txn| {
            for i in 0..10u8 {
                txn.put(db, &[i], &[i])?;
            }
            Ok(())
        })
        .unwrap();

        env.write(|txn| {
            for entry in txn.iter(db) {
                let (key, _) = entry?;
                if key[0] % 2 == 0 {
                    txn.delete(db, &key)?;
                }
            }
            assert_eq!(txn.count(db)?, 5);
            Ok(())
        })
        .unwrap();
        assert_eq!(env.begin_read().count(db).unwrap(), 5);
    }

    #[test]
    fn test_range_rev_across_tables_and_memtable() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), small_options()).unwrap();
        let db = env.open_db("data").unwrap();
        let neighbour = env.open_db("neighbour").unwrap();
        for i in 0..120u32 {
            env.write(|txn| {
                txn.put(db, &i.to_be_bytes(), &[1u8; 24])?;
                txn.put(neighbour, &i.to_be_bytes(), &[9u8; 24])
            })
            .unwrap();
        }
        // Newer versions and tombstones shadow rows already in tables.
        env.write(|txn| {
            for i in (0..120u32).step_by(7) {
                txn.delete(db, &i.to_be_bytes())?;
            }
            txn.put(db, &50u32.to_be_bytes(), b"fresh")
        })
        .unwrap();
        assert!(env.stat().tables > 1);

        let read = env.begin_read();
        let mut forward: Vec<_> = read.iter(db).map(|e| e.unwrap()).collect();
        forward.reverse();
        let backward: Vec<_> = read.range_rev(db, Bound::Unbounded, Bound::Unbounded).map(|e| e.unwrap()).collect();
        assert_eq!(backward, forward);

        let (from, to) = (10u32.to_be_bytes(), 60u32.to_be_bytes());
        let keys: Vec<_> = read
            .range_rev(db, Bound::Excluded(&from[..]), Bound::Included(&to[..]))
            .map(|e| u32::from_be_bytes(e.unwrap().0.try_into().unwrap()))
            .collect();
        let expected: Vec<u32> = (11..=60).rev().filter(|i| i % 7 != 0).collect();
        assert_eq!(keys, expected);

        let last = read.last_in_range(db, Bound::Unbounded, Bound::Excluded(&56u32.to_be_bytes()[..])).unwrap();
        assert_eq!(last.map(|(k, _)| k), Some(55u32.to_be_bytes().to_vec()));
        let last = read.last_in_range(db, Bound::Unbounded, Bound::Included(&50u32.to_be_bytes()[..])).unwrap();
        assert_eq!(last, Some((50u32.to_be_bytes().to_vec(), b"fresh".to_vec())));
        assert_eq!(read.last_in_range(db, Bound::Unbounded, Bound::Included(&0u32.to_be_bytes()[..])).unwrap(), None);

        // A write transaction sees its own buffered changes walking backwards.
        env.write(|txn| {
            txn.put(db, &200u32.to_be_bytes(), b"pending")?;
            txn.delete(db, &118u32.to_be_bytes())?;
            let mut rev = txn.range_rev(db, Bound::Unbounded, Bound::Unbounded);
            assert_eq!(rev.next().transpose()?.map(|(k, _)| k), Some(200u32.to_be_bytes().to_vec()));
            assert_eq!(rev.next().transpose()?.map(|(k, _)| k), Some(117u32.to_be_bytes().to_vec()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_reopen_recovers_log_and_tables() {
        let dir = TempDir::new().unwrap();
        {
            let env = Env::open(dir.path(), small_options()).unwrap();
            let db = env.open_db("data").unwrap();
            for i in 0..100u32 {
                env.write(|txn| txn.put(db, &i.to_be_bytes(), &[1u8; 40])).unwrap();
            }
            env.write(|txn| txn.delete(db, &5u32.to_be_bytes()).map(|_| ())).unwrap();
        }

        let env = Env::open(dir.path(), small_options()).unwrap();
        let db = env.open_db("data").unwrap();
        let read = env.begin_read();
        assert_eq!(read.count(db).unwrap(), 99);
        assert_eq!(read.get(db, &5u32.to_be_bytes()).unwrap(), None);
        assert!(read.sequence() >= 101);
    }

    #[test]
    fn test_compact_drops_garbage() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), small_options()).unwrap();
        let db = env.open_db("data").unwrap();
        for round in 0..3u8 {
            for i in 0..50u32 {
                env.write(|txn| txn.put(db, &i.to_be_bytes(), &[round; 40])).unwrap();
            }
        }
        env.write(|txn| {
            for i in 0..25u32 {
                txn.delete(db, &i.to_be_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        env.compact().unwrap();
        let stat = env.stat();
        assert_eq!(stat.tables, 1);
        assert_eq!(stat.table_entries, 25);
        assert_eq!(env.begin_read().get(db, &30u32.to_be_bytes()).unwrap(), Some(vec![2u8; 40]));
    }

    #[test]
    fn test_store_full() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default().max_store_size(256)).unwrap();
        let db = env.open_db("data").unwrap();
        let err = env.write(|txn| txn.put(db, b"big", &[0u8; 512])).unwrap_err();
        assert!(matches!(err, Error::StoreFull { .. }));
        assert_eq!(env.begin_read().get(db, b"big").unwrap(), None);
    }

    #[test]
    fn test_key_length_limit() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let db = env.open_db("data").unwrap();
        let err = env.write(|txn| txn.put(db, &[1u8; MAX_KEY_LENGTH + 1], b"v")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_open_failures() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let err = Env::open(&missing, EnvOptions::default().read_only(true)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let stray = dir.path().join("stray");
        fs::create_dir_all(&stray).unwrap();
        fs::write(stray.join("data.mdb"), b"junk").unwrap();
        let err = Env::open(&stray, EnvOptions::default()).unwrap_err();
        assert!(matches!(err, Error::CorruptShard { .. }));
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let db = env.open_db("data").unwrap();
        env.write(|txn| txn.put(db, b"k", b"v")).unwrap();

        let err = Env::open(dir.path(), EnvOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Locked(_)), "{:?}", err);
        let reader = Env::open(dir.path(), EnvOptions::default().read_only(true)).unwrap();
        assert_eq!(reader.begin_read().get(reader.open_db("data").unwrap(), b"k").unwrap(), Some(b"v".to_vec()));

        let clone = env.clone();
        drop(env);
        assert!(matches!(Env::open(dir.path(), EnvOptions::default()), Err(Error::Locked(_))));
        drop(clone);
        let reopened = Env::open(dir.path(), EnvOptions::default()).unwrap();
        assert_eq!(reopened.begin_read().get(db, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_read_only_env() {
        let dir = TempDir::new().unwrap();
        {
            let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
            let db = env.open_db("data").unwrap();
            env.write(|txn| txn.put(db, b"k", b"v")).unwrap();
        }
        let env = Env::open(dir.path(), EnvOptions::default().read_only(true)).unwrap();
        let db = env.open_db("data").unwrap();
        assert_eq!(env.begin_read().get(db, b"k").unwrap(), Some(b"v".to_vec()));
        assert!(matches!(env.begin_write(), Err(Error::ReadOnly(_))));
        let unknown = env.open_db("other").unwrap();
        assert_eq!(env.begin_read().count(unknown).unwrap(), 0);
    }
}
