//! Shard lifecycle: lazy opening, caching and whole-node maintenance.
//!
//! Every map has one shard directory, `shards/<uuid>`. Shards open on first
//! use with the settings of the map's document and stay cached until closed.
//! Handles are reference counted. Closing a shard another thread still uses
//! keeps a weak link to it, and `get_shard` hands that same handle back until
//! the last user drops it, so a directory never has two open environments.

use crate::archive;
use crate::config::{EnvOptions, PlanBConfig};
use crate::context::{resolve_doc, DocStore, SecurityContext, TaskContext, TaskContextFactory};
use crate::db::{now_millis, PlanBDb, ShardDb};
use crate::error::{Error, Result};
use crate::settings::PlanBDoc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Directory layout under the node's root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of shard directories.
    pub fn shards_dir(&self) -> PathBuf {
        self.root.join("shards")
    }

    /// Queue of parts waiting to be merged.
    pub fn merging_dir(&self) -> PathBuf {
        self.root.join("merging")
    }

    /// Scratch space for unzipped parts.
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Directory of the shard of map `uuid`.
    pub fn shard_dir(&self, uuid: &str) -> PathBuf {
        self.shards_dir().join(uuid)
    }

    /// Creates every directory of the layout.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [self.shards_dir(), self.merging_dir(), self.scratch_dir()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// An open shard and the document it was opened with.
#[derive(Debug)]
pub struct Shard {
    doc: PlanBDoc,
    path: PathBuf,
    db: ShardDb,
}

impl Shard {
    /// Document of the shard's map.
    pub fn doc(&self) -> &PlanBDoc {
        &self.doc
    }

    /// Shard directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The variant behind the common interface.
    pub fn db(&self) -> &dyn PlanBDb {
        self.db.as_db()
    }

    /// The concrete variant.
    pub fn variant(&self) -> &ShardDb {
        &self.db
    }
}

/// Opens, caches and maintains the node's shards.
pub struct ShardManager {
    paths: StatePaths,
    options: EnvOptions,
    docs: Arc<dyn DocStore>,
    security: Arc<dyn SecurityContext>,
    shards: RwLock<HashMap<String, Arc<Shard>>>,
    released: Mutex<HashMap<String, Weak<Shard>>>,
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("paths", &self.paths)
            .field("open", &self.shards.read().len())
            .finish()
    }
}

impl ShardManager {
    /// Creates a manager for the node configured by `config`.
    pub fn new(config: &PlanBConfig, docs: Arc<dyn DocStore>, security: Arc<dyn SecurityContext>) -> Result<Self> {
        config.validate()?;
        let paths = StatePaths::new(&config.path);
        paths.create_dirs()?;
        Ok(Self {
            paths,
            options: config.env.clone(),
            docs,
            security,
            shards: RwLock::new(HashMap::new()),
            released: Mutex::new(HashMap::new()),
        })
    }

    /// The node's directory layout.
    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// The shard of the map with uuid or name `map`, opening it if needed.
    pub fn get_shard(&self, map: &str) -> Result<Arc<Shard>> {
        if let Some(shard) = self.shards.read().get(map) {
            return Ok(Arc::clone(shard));
        }
        let doc = resolve_doc(self.docs.as_ref(), map)?;

        let mut shards = self.shards.write();
        if let Some(shard) = shards.get(&doc.uuid) {
            return Ok(Arc::clone(shard));
        }
        if let Some(shard) = self.released.lock().remove(&doc.uuid).and_then(|weak| weak.upgrade()) {
            log::debug!("Shard {} was closed while in use, caching it again", doc.uuid);
            shards.insert(doc.uuid.clone(), Arc::clone(&shard));
            return Ok(shard);
        }
        let path = self.paths.shard_dir(&doc.uuid);
        fs::create_dir_all(&path)?;
        let db = ShardDb::open(&path, &doc, &self.options)?;
        log::info!("Opened shard for map {} ({})", doc.name, doc.uuid);
        let shard = Arc::new(Shard { doc, path, db });
        shards.insert(shard.doc.uuid.clone(), Arc::clone(&shard));
        Ok(shard)
    }

    /// Runs `f` against the shard of `map`.
    pub fn with_db<R>(&self, map: &str, f: impl FnOnce(&dyn PlanBDb) -> Result<R>) -> Result<R> {
        let shard = self.get_shard(map)?;
        f(shard.db())
    }

    /// Runs `f` while no write can start on the shard of `map`. Readers are
    /// not blocked.
    pub fn lock<R>(&self, map: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let shard = self.get_shard(map)?;
        shard.db().env().lock(f)
    }

    /// Zips a consistent copy of the shard of `map` into `zip_path`.
    pub fn snapshot(&self, map: &str, zip_path: &Path) -> Result<()> {
        let shard = self.get_shard(map)?;
        shard.db().env().lock(|| archive::zip_dir(shard.path(), zip_path).map(|_| ()))?;
        log::info!("Snapshot of {} written to {:?}", shard.doc().name, zip_path);
        Ok(())
    }

    /// Merges the shard directory `source` into the shard of `map`. Returns
    /// false when a part with content `hash` was merged before.
    pub fn merge_part(&self, map: &str, source: &Path, hash: Option<&str>) -> Result<bool> {
        let shard = self.get_shard(map)?;
        shard.db().merge_part(source, hash)
    }

    /// Uuids of every shard directory on disk.
    pub fn shard_uuids(&self) -> Result<Vec<String>> {
        let mut uuids = Vec::new();
        for entry in fs::read_dir(self.paths.shards_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                uuids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        uuids.sort();
        Ok(uuids)
    }

    /// Runs `f` on every shard on disk as the processing user. A failing
    /// shard is logged and skipped. Returns the shards `f` succeeded on.
    fn for_each_shard(
        &self,
        task: Option<&dyn TaskContext>,
        action: &str,
        mut f: impl FnMut(&Shard) -> Result<()>,
    ) -> Result<usize> {
        let uuids = self.shard_uuids()?;
        let mut done = 0;
        self.security.as_processing_user(&mut || {
            for uuid in &uuids {
                if let Some(task) = task {
                    if task.is_cancelled() {
                        log::info!("{} cancelled after {} of {} shards", action, done, uuids.len());
                        return Ok(());
                    }
                    task.info(&format!("{} {}", action, uuid));
                }
                match self.get_shard(uuid).and_then(|shard| f(&shard)) {
                    Ok(()) => done += 1,
                    Err(e) => log::warn!("{} of shard {} failed: {}", action, uuid, e),
                }
            }
            Ok(())
        })?;
        Ok(done)
    }

    /// Compacts every shard. Returns the shards compacted.
    pub fn compact_all(&self) -> Result<usize> {
        self.for_each_shard(None, "Compaction", |shard| shard.db().compact())
    }

    /// Applies each map's condense and retention policy, checking `task` for
    /// cancellation between shards. Returns the shards processed.
    pub fn condense_all(&self, task: &dyn TaskContext) -> Result<usize> {
        let now = now_millis();
        self.for_each_shard(Some(task), "Condense", |shard| shard.db().maintain(now))
    }

    /// Scheduled form of [`ShardManager::condense_all`], running under a task
    /// context from `factory`.
    pub fn run_condense(&self, factory: &dyn TaskContextFactory) -> Result<usize> {
        let task = factory.create("PlanB condense");
        task.info("Condensing shards");
        self.condense_all(task.as_ref())
    }

    /// Drops the cached shard of map `uuid`. A shard still held elsewhere
    /// closes with its last handle.
    pub fn close(&self, uuid: &str) -> Result<()> {
        // Held until the weak link is recorded, so `get_shard` always finds a
        // live shard in one map or the other.
        let mut shards = self.shards.write();
        match shards.remove(uuid) {
            Some(shard) => self.close_shard(shard),
            None => Err(Error::not_found(format!("open shard {}", uuid))),
        }
    }

    /// Drops every cached shard.
    pub fn close_all(&self) -> Result<()> {
        let mut shards = self.shards.write();
        let mut first_error = None;
        for (_, shard) in shards.drain() {
            if let Err(e) = self.close_shard(shard) {
                log::warn!("Closing shard failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn close_shard(&self, shard: Arc<Shard>) -> Result<()> {
        match Arc::try_unwrap(shard) {
            Ok(shard) => {
                log::info!("Closing shard for map {} ({})", shard.doc.name, shard.doc.uuid);
                shard.db.close()
            }
            Err(shared) => {
                log::debug!("Shard {} still in use, closing with its last handle", shared.doc.uuid);
                let mut released = self.released.lock();
                released.retain(|_, weak| weak.strong_count() > 0);
                released.insert(shared.doc.uuid.clone(), Arc::downgrade(&shared));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::KeyPrefix;
    use crate::context::{MemoryDocStore, NoSecurity, SimpleTaskContext, SimpleTaskContextFactory};
    use crate::db::StateDb;
    use crate::settings::StateType;
    use crate::val::Val;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ShardManager {
        let docs = MemoryDocStore::new();
        docs.insert(PlanBDoc::with_defaults("uuid-1", "alpha", StateType::State)).unwrap();
        docs.insert(PlanBDoc::with_defaults("uuid-2", "beta", StateType::Histogram)).unwrap();
        ShardManager::new(&PlanBConfig::new(dir.path()), Arc::new(docs), Arc::new(NoSecurity)).unwrap()
    }

    fn state(shard: &Shard) -> &StateDb {
        match shard.variant() {
            ShardDb::State(db) => db,
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_shards_are_cached_by_uuid() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let by_name = manager.get_shard("alpha").unwrap();
        let by_uuid = manager.get_shard("uuid-1").unwrap();
        assert!(Arc::ptr_eq(&by_name, &by_uuid));
        assert!(manager.paths().shard_dir("uuid-1").is_dir());
        assert!(matches!(manager.get_shard("gamma"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_snapshot_zips_consistent_copy() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let shard = manager.get_shard("alpha").unwrap();
        let db = state(&shard);
        db.write(|txn| db.insert(txn, &KeyPrefix::new("k"), &Val::Int(7))).unwrap();

        let zip = dir.path().join("alpha.zip");
        manager.snapshot("alpha", &zip).unwrap();
        let restored = dir.path().join("restored");
        archive::unzip(&zip, &restored).unwrap();

        let copy = StateDb::open(&restored, Default::default(), &EnvOptions::default()).unwrap();
        assert_eq!(copy.get(&KeyPrefix::new("k")).unwrap(), Some(Val::Int(7)));
    }

    #[test]
    fn test_condense_all_stops_when_cancelled() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.get_shard("alpha").unwrap();
        manager.get_shard("beta").unwrap();

        assert_eq!(manager.condense_all(&SimpleTaskContext::new("condense")).unwrap(), 2);
        assert_eq!(manager.compact_all().unwrap(), 2);
        assert_eq!(manager.run_condense(&SimpleTaskContextFactory).unwrap(), 2);
        let cancelled = SimpleTaskContext::new("condense");
        cancelled.cancel();
        assert_eq!(manager.condense_all(&cancelled).unwrap(), 0);
    }

    #[test]
    fn test_close_while_held_keeps_one_environment() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let held = manager.get_shard("alpha").unwrap();
        state(&held).write(|txn| state(&held).insert(txn, &KeyPrefix::new("k1"), &Val::Int(1))).unwrap();

        manager.close("uuid-1").unwrap();
        let reopened = manager.get_shard("alpha").unwrap();
        assert!(Arc::ptr_eq(&held, &reopened));

        state(&held).write(|txn| state(&held).insert(txn, &KeyPrefix::new("k2"), &Val::Int(2))).unwrap();
        state(&reopened).write(|txn| state(&reopened).insert(txn, &KeyPrefix::new("k3"), &Val::Int(3))).unwrap();
        drop(held);
        drop(reopened);
        manager.close_all().unwrap();

        let fresh = manager.get_shard("alpha").unwrap();
        for (key, value) in [("k1", 1), ("k2", 2), ("k3", 3)] {
            assert_eq!(state(&fresh).get(&KeyPrefix::new(key)).unwrap(), Some(Val::Int(value)), "{}", key);
        }
    }

    #[test]
    fn test_close_drops_cache_entry() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let first = manager.get_shard("alpha").unwrap();
        drop(first);
        manager.close("uuid-1").unwrap();
        assert!(matches!(manager.close("uuid-1"), Err(Error::NotFound(_))));

        let held = manager.get_shard("alpha").unwrap();
        manager.close_all().unwrap();
        assert_eq!(held.db().count().unwrap(), 0);
    }
}
