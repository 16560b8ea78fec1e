//! Engine variants.
//!
//! Every variant owns a [`DbCore`]: the shard's environment, its `data` and
//! `info` sub-databases and the schema recorded on first open. Variants add
//! their key and value codecs on top and implement [`PlanBDb`]. [`ShardDb`]
//! dispatches over the closed set of variants.

pub mod histogram;
pub mod metric;
pub mod range_state;
pub mod session;
pub mod state;
pub mod temporal_range_state;
pub mod temporal_state;
pub mod trace;

pub use histogram::HistogramDb;
pub use metric::MetricDb;
pub use range_state::RangeStateDb;
pub use session::SessionDb;
pub use state::StateDb;
pub use temporal_range_state::TemporalRangeStateDb;
pub use temporal_state::TemporalStateDb;
pub use trace::TraceDb;

use crate::codec::sortable::Reader;
use crate::codec::{KeyCodec, ValueCodec};
use crate::config::EnvOptions;
use crate::env::{Db, Env, EnvStat, Txn, WriteTxn};
use crate::error::{Error, Result};
use crate::lookup::UsedLookups;
use crate::query::{ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, TimeFilter};
use crate::settings::{PlanBDoc, SchemaInfo, Settings, StateType};
use crate::val::Val;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sub-database holding a shard's rows.
pub const DATA_DB: &str = "data";

/// Sub-database holding schema, counters and the merge ledger.
pub const INFO_DB: &str = "info";

const SCHEMA_KEY: &[u8] = b"schema";
const MERGED_PREFIX: &str = "merged:";

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Description of an open shard.
#[derive(Debug, Clone)]
pub struct DbInfo {
    /// Variant
    pub state_type: StateType,
    /// Shard directory
    pub path: PathBuf,
    /// Recorded schema
    pub schema: SchemaInfo,
    /// Registered sub-databases
    pub dbs: Vec<String>,
    /// Environment statistics
    pub stat: EnvStat,
    /// Rows in the primary data
    pub count: u64,
}

/// State shared by every variant.
#[derive(Debug, Clone)]
pub struct DbCore {
    env: Env,
    data: Db,
    info: Db,
    state_type: StateType,
    settings: Settings,
    schema: SchemaInfo,
}

impl DbCore {
    /// Opens the shard at `path` and checks its recorded schema.
    ///
    /// The first read-write open records the schema; a later open with a
    /// different schema fails with [`Error::SchemaMismatch`].
    pub fn open(
        path: &Path,
        state_type: StateType,
        settings: Settings,
        schema_version: u32,
        options: &EnvOptions,
    ) -> Result<Self> {
        let options = options.clone().max_store_size(settings.max_store_size());
        let env = Env::open(path, options)?;
        let data = env.open_db(DATA_DB)?;
        let info = env.open_db(INFO_DB)?;
        let schema = SchemaInfo::new(schema_version, &settings)?;

        let stored = env.read(|txn| Self::read_schema(txn, info))?;
        match stored {
            Some(stored) => stored.validate(&schema)?,
            None if !env.is_read_only() => {
                let json = serde_json::to_vec(&schema)?;
                env.write(|txn| txn.put(info, SCHEMA_KEY, &json))?;
            }
            None => {}
        }
        log::info!("Opened {:?} shard at {:?}", state_type, path);
        Ok(Self { env, data, info, state_type, settings, schema })
    }

    fn read_schema(txn: &dyn Txn, info: Db) -> Result<Option<SchemaInfo>> {
        match txn.get(info, SCHEMA_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// The shard's environment.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Primary data sub-database.
    pub fn data(&self) -> Db {
        self.data
    }

    /// Info sub-database.
    pub fn info_db(&self) -> Db {
        self.info
    }

    /// Settings the shard was opened with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Schema the shard was opened with.
    pub fn schema(&self) -> &SchemaInfo {
        &self.schema
    }

    /// Whether a part with content hash `hash` has been merged.
    pub fn is_merged(&self, txn: &dyn Txn, hash: &str) -> Result<bool> {
        Ok(txn.get(self.info, format!("{}{}", MERGED_PREFIX, hash).as_bytes())?.is_some())
    }

    /// Records that the part with content hash `hash` has been merged.
    pub fn mark_merged(&self, txn: &mut WriteTxn<'_>, hash: &str) -> Result<()> {
        txn.put(self.info, format!("{}{}", MERGED_PREFIX, hash).as_bytes(), &now_millis().to_be_bytes())
    }

    /// Rows in the primary data.
    pub fn count(&self) -> Result<u64> {
        self.env.read(|txn| txn.count(self.data))
    }

    /// Describes the shard.
    pub fn info(&self) -> Result<DbInfo> {
        Ok(DbInfo {
            state_type: self.state_type,
            path: self.env.path().to_path_buf(),
            schema: self.schema.clone(),
            dbs: self.env.db_names(),
            stat: self.env.stat(),
            count: self.count()?,
        })
    }

    /// Merges the shard at `source` into this one.
    ///
    /// `open` opens the source; `merge` copies its rows inside the target's
    /// write transaction. With a content `hash`, an already merged part is
    /// skipped and the hash is recorded in the same transaction as the rows.
    /// Returns whether anything was merged.
    pub(crate) fn merge_from<S>(
        &self,
        source: &Path,
        hash: Option<&str>,
        open: impl FnOnce(&Path, &EnvOptions) -> Result<S>,
        merge: impl FnOnce(&mut WriteTxn<'_>, &S) -> Result<u64>,
    ) -> Result<bool> {
        if let Some(hash) = hash {
            if self.env.read(|txn| self.is_merged(txn, hash))? {
                log::debug!("Part {} already merged into {:?}", hash, self.env.path());
                return Ok(false);
            }
        }

        let options = EnvOptions::default().read_only(true);
        let source_db = open(source, &options)?;
        let rows = self.env.write(|txn| {
            if let Some(hash) = hash {
                if self.is_merged(&*txn, hash)? {
                    return Ok(None);
                }
            }
            let rows = merge(txn, &source_db)?;
            if let Some(hash) = hash {
                self.mark_merged(txn, hash)?;
            }
            Ok(Some(rows))
        })?;

        match rows {
            Some(rows) => {
                log::info!("Merged {} rows from {:?} into {:?}", rows, source, self.env.path());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deletes primary rows for which `expired(key, value)` holds, then
    /// removes lookup entries no remaining row references.
    pub(crate) fn delete_where(
        &self,
        keys: Option<&KeyCodec>,
        values: Option<&ValueCodec>,
        mut expired: impl FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<u64> {
        let deleted = self.env.write(|txn| {
            let mut deleted = 0;
            for entry in txn.iter(self.data) {
                let (key, value) = entry?;
                if expired(&key, &value)? {
                    txn.delete(self.data, &key)?;
                    deleted += 1;
                }
            }
            if deleted > 0 {
                delete_unused_lookups(txn, self.data, keys, values)?;
            }
            Ok(deleted)
        })?;
        if deleted > 0 {
            log::info!("Deleted {} old rows from {:?}", deleted, self.env.path());
        }
        Ok(deleted)
    }
}

/// Removes lookup entries that no row of `data` references.
pub(crate) fn delete_unused_lookups(
    txn: &mut WriteTxn<'_>,
    data: Db,
    keys: Option<&KeyCodec>,
    values: Option<&ValueCodec>,
) -> Result<usize> {
    let mut used_keys = UsedLookups::new();
    let mut used_values = UsedLookups::new();
    for entry in txn.iter(data) {
        let (key, value) = entry?;
        if let Some(codec) = keys {
            if let Some(r) = codec.lookup_ref(&mut Reader::new(&key))? {
                r.record(&mut used_keys);
            }
        }
        if let Some(codec) = values {
            if let Some(r) = codec.lookup_ref(&value)? {
                r.record(&mut used_values);
            }
        }
    }
    let mut removed = 0;
    if let Some(codec) = keys {
        removed += codec.delete_unused(txn, &used_keys)?;
    }
    if let Some(codec) = values {
        removed += codec.delete_unused(txn, &used_values)?;
    }
    Ok(removed)
}

/// Operations every engine variant supports.
pub trait PlanBDb: Send + Sync {
    /// The variant.
    fn state_type(&self) -> StateType;

    /// Shared shard state.
    fn core(&self) -> &DbCore;

    /// The shard's environment.
    fn env(&self) -> &Env {
        self.core().env()
    }

    /// Runs `f` in a write transaction that commits when `f` returns `Ok`.
    fn write<R>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> Result<R>) -> Result<R>
    where
        Self: Sized,
    {
        self.env().write(f)
    }

    /// Rows in the primary data.
    fn count(&self) -> Result<u64> {
        self.core().count()
    }

    /// Merges the shard at `source` into this one.
    fn merge(&self, source: &Path) -> Result<()> {
        self.merge_part(source, None).map(|_| ())
    }

    /// Merges the part at `source` unless a part with content `hash` was
    /// merged before. Returns whether anything was merged.
    fn merge_part(&self, source: &Path, hash: Option<&str>) -> Result<bool>;

    /// Condenses history older than `before`. Returns rows removed.
    fn condense(&self, _before: i64) -> Result<u64> {
        Ok(0)
    }

    /// Deletes data older than `before`, aged by the data's own time when
    /// `use_state_time` is set and the variant has one. Returns rows removed.
    fn delete_old_data(&self, before: i64, use_state_time: bool) -> Result<u64>;

    /// Applies the configured condense and retention policies as of `now`.
    fn maintain(&self, now: i64) -> Result<()> {
        let settings = self.core().settings();
        if let Some(condense) = settings.condense().filter(|c| c.enabled) {
            self.condense(now.saturating_sub(duration_millis(condense.duration)))?;
        }
        let retention = settings.retention();
        if retention.enabled {
            self.delete_old_data(now.saturating_sub(duration_millis(retention.duration)), retention.use_state_time)?;
        }
        Ok(())
    }

    /// Streams rows matching `criteria` to `consumer`, projected by `fields`.
    fn search(
        &self,
        criteria: &ExpressionCriteria,
        fields: &mut FieldIndex,
        time_filter: Option<&TimeFilter>,
        factory: &ExpressionPredicateFactory,
        consumer: &mut dyn FnMut(Vec<Val>) -> ControlFlow<()>,
    ) -> Result<()>;

    /// Rewrites the shard's files, dropping deleted data.
    fn compact(&self) -> Result<()> {
        self.env().compact()
    }

    /// Describes the shard.
    fn info(&self) -> Result<DbInfo> {
        self.core().info()
    }
}

/// An open shard of any variant.
#[derive(Debug, Clone)]
pub enum ShardDb {
    /// Plain state
    State(StateDb),
    /// Temporal state
    TemporalState(TemporalStateDb),
    /// Range and ranged state
    RangeState(RangeStateDb),
    /// Temporal range and temporal ranged state
    TemporalRangeState(TemporalRangeStateDb),
    /// Sessions
    Session(SessionDb),
    /// Histograms
    Histogram(HistogramDb),
    /// Metrics
    Metric(MetricDb),
    /// Traces
    Trace(TraceDb),
}

fn settings_error(doc: &PlanBDoc) -> Error {
    Error::invalid_argument(format!("settings of map {:?} do not fit {:?}", doc.name, doc.state_type))
}

impl ShardDb {
    /// Opens the shard at `path` as described by `doc`.
    pub fn open(path: &Path, doc: &PlanBDoc, options: &EnvOptions) -> Result<Self> {
        doc.validate()?;
        Ok(match (&doc.settings, doc.state_type) {
            (Settings::State(s), StateType::State) => ShardDb::State(StateDb::open(path, s.clone(), options)?),
            (Settings::TemporalState(s), StateType::TemporalState) => {
                ShardDb::TemporalState(TemporalStateDb::open(path, s.clone(), options)?)
            }
            (Settings::RangeState(s), StateType::RangeState | StateType::RangedState) => {
                let ranged = doc.state_type == StateType::RangedState;
                ShardDb::RangeState(RangeStateDb::open(path, s.clone(), ranged, options)?)
            }
            (
                Settings::TemporalRangeState(s),
                StateType::TemporalRangeState | StateType::TemporalRangedState,
            ) => {
                let ranged = doc.state_type == StateType::TemporalRangedState;
                ShardDb::TemporalRangeState(TemporalRangeStateDb::open(path, s.clone(), ranged, options)?)
            }
            (Settings::Session(s), StateType::Session) => ShardDb::Session(SessionDb::open(path, s.clone(), options)?),
            (Settings::Histogram(s), StateType::Histogram) => {
                ShardDb::Histogram(HistogramDb::open(path, s.clone(), options)?)
            }
            (Settings::Metric(s), StateType::Metric) => ShardDb::Metric(MetricDb::open(path, s.clone(), options)?),
            (Settings::Trace(s), StateType::Trace) => ShardDb::Trace(TraceDb::open(path, s.clone(), options)?),
            _ => return Err(settings_error(doc)),
        })
    }

    /// The variant behind the common interface.
    pub fn as_db(&self) -> &dyn PlanBDb {
        match self {
            ShardDb::State(db) => db,
            ShardDb::TemporalState(db) => db,
            ShardDb::RangeState(db) => db,
            ShardDb::TemporalRangeState(db) => db,
            ShardDb::Session(db) => db,
            ShardDb::Histogram(db) => db,
            ShardDb::Metric(db) => db,
            ShardDb::Trace(db) => db,
        }
    }

    /// Syncs the shard's log. The shard closes when the last handle drops.
    pub fn close(self) -> Result<()> {
        let env = self.as_db().env().clone();
        drop(self);
        env.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{KeyType, StateKeySchema, StateSettings};
    use tempfile::TempDir;

    #[test]
    fn test_schema_is_recorded_and_checked() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::State(StateSettings::new());
        let core = DbCore::open(dir.path(), StateType::State, settings.clone(), 1, &EnvOptions::default()).unwrap();
        drop(core);

        let reopened = DbCore::open(dir.path(), StateType::State, settings, 1, &EnvOptions::default()).unwrap();
        assert!(reopened.env().db_names().contains(&DATA_DB.to_string()));
        drop(reopened);

        let other = Settings::State(StateSettings::new().key_schema(StateKeySchema::new(KeyType::Int)));
        let result = DbCore::open(dir.path(), StateType::State, other, 1, &EnvOptions::default());
        assert!(matches!(result, Err(Error::SchemaMismatch(_))));
    }

    #[test]
    fn test_merge_ledger() {
        let dir = TempDir::new().unwrap();
        let core = DbCore::open(
            dir.path(),
            StateType::State,
            Settings::State(StateSettings::new()),
            1,
            &EnvOptions::default(),
        )
        .unwrap();
        assert!(!core.env().read(|txn| core.is_merged(txn, "abc")).unwrap());
        core.env().write(|txn| core.mark_merged(txn, "abc")).unwrap();
        assert!(core.env().read(|txn| core.is_merged(txn, "abc")).unwrap());
    }

    #[test]
    fn test_settings_must_fit_state_type() {
        let dir = TempDir::new().unwrap();
        let mut doc = PlanBDoc::with_defaults("uuid", "map", StateType::State);
        doc.state_type = StateType::Trace;
        assert!(ShardDb::open(dir.path(), &doc, &EnvOptions::default()).is_err());
    }
}
