//! Sessions: time intervals per key.
//!
//! Rows are keyed by `(prefix, start, end)` and hold only their insert time.
//! Intervals of one key that overlap or touch are one session: condensing
//! rewrites them into a single row, and reads coalesce them on the fly so the
//! result does not depend on whether a condense has run.

use crate::codec::sortable::{self, Reader};
use crate::codec::{KeyCodec, KeyPrefix, ValueCodec};
use crate::config::EnvOptions;
use crate::db::{now_millis, DbCore, PlanBDb};
use crate::env::{Db, Txn, WriteTxn};
use crate::error::{Error, Result};
use crate::query::{fields, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, Row, Search, TimeFilter};
use crate::settings::{SessionSettings, Settings, StateType};
use crate::val::Val;
use std::ops::ControlFlow;
use std::path::Path;

/// Layout version of session shards.
pub const SCHEMA_VERSION: u32 = 1;

/// A session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Key
    pub key: KeyPrefix,
    /// Inclusive start, epoch millis
    pub start: i64,
    /// Inclusive end, epoch millis
    pub end: i64,
    /// When the latest contributing row was written
    pub insert_time: i64,
}

impl Session {
    /// Whether `time` lies inside the session.
    pub fn contains(&self, time: i64) -> bool {
        self.start <= time && time <= self.end
    }
}

impl Row for Session {
    fn field(&self, name: &str) -> Val {
        match name {
            fields::KEY => self.key.to_val(),
            fields::START => Val::Date(self.start),
            fields::END => Val::Date(self.end),
            fields::INSERT_TIME => Val::Date(self.insert_time),
            _ => Val::Null,
        }
    }

    fn time(&self) -> Option<i64> {
        Some(self.start)
    }
}

struct RawSession {
    key: Vec<u8>,
    prefix_len: usize,
    start: i64,
    end: i64,
    insert_time: i64,
}

impl RawSession {
    fn prefix(&self) -> &[u8] {
        &self.key[..self.prefix_len]
    }
}

struct Group {
    first: RawSession,
    end: i64,
    insert_time: i64,
    keys: Vec<Vec<u8>>,
}

impl Group {
    fn new(row: RawSession) -> Self {
        Self { end: row.end, insert_time: row.insert_time, keys: vec![row.key.clone()], first: row }
    }

    /// Absorbs `row` if it belongs to the same key and overlaps or touches.
    fn absorb(&mut self, row: &RawSession) -> bool {
        if row.prefix() != self.first.prefix() || row.start > self.end {
            return false;
        }
        self.end = self.end.max(row.end);
        self.insert_time = self.insert_time.max(row.insert_time);
        self.keys.push(row.key.clone());
        true
    }
}

/// Session shard.
#[derive(Debug, Clone)]
pub struct SessionDb {
    core: DbCore,
    settings: SessionSettings,
    keys: KeyCodec,
}

impl SessionDb {
    /// Opens the shard at `path`.
    pub fn open(path: &Path, settings: SessionSettings, options: &EnvOptions) -> Result<Self> {
        let core = DbCore::open(path, StateType::Session, Settings::Session(settings.clone()), SCHEMA_VERSION, options)?;
        let keys = KeyCodec::open(
            core.env(),
            "key",
            settings.key_schema.key_type,
            settings.key_schema.hash_length,
        )?;
        Ok(Self { core, settings, keys })
    }

    /// Records that `key` was active from `start` to `end`.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, key: &KeyPrefix, start: i64, end: i64) -> Result<()> {
        if start > end {
            return Err(Error::validation(format!("session start {} is after its end {}", start, end)));
        }
        let resolution = self.settings.key_schema.temporal_resolution;
        self.put_row(txn, key, resolution.truncate(start), resolution.truncate(end), now_millis())
    }

    fn put_row(&self, txn: &mut WriteTxn<'_>, key: &KeyPrefix, start: i64, end: i64, insert_time: i64) -> Result<()> {
        let mut encoded = Vec::new();
        self.keys.encode(txn, key, &mut encoded)?;
        sortable::put_i64(&mut encoded, start);
        sortable::put_i64(&mut encoded, end);
        txn.put(self.core.data(), &encoded, &insert_time.to_be_bytes())
    }

    fn raw(&self, key: Vec<u8>, value: &[u8]) -> Result<RawSession> {
        let mut reader = Reader::new(&key);
        self.keys.lookup_ref(&mut reader)?;
        let prefix_len = reader.position();
        let start = reader.i64()?;
        let end = reader.i64()?;
        let insert_time = ValueCodec::insert_time(value)?;
        Ok(RawSession { key, prefix_len, start, end, insert_time })
    }

    fn resolve(&self, txn: &dyn Txn, group: &Group) -> Result<Session> {
        Ok(Session {
            key: self.keys.decode(txn, &mut Reader::new(group.first.prefix()))?,
            start: group.first.start,
            end: group.end,
            insert_time: group.insert_time,
        })
    }

    /// Walks coalesced sessions of the rows under `prefix` (all rows when
    /// empty) until `f` breaks.
    fn for_each_session(
        &self,
        txn: &dyn Txn,
        prefix: &[u8],
        f: &mut dyn FnMut(&Group) -> Result<ControlFlow<()>>,
    ) -> Result<()> {
        let mut group: Option<Group> = None;
        for entry in txn.prefix(self.core.data(), prefix) {
            let (key, value) = entry?;
            let row = self.raw(key, &value)?;
            if let Some(g) = group.as_mut() {
                if g.absorb(&row) {
                    continue;
                }
            }
            if let Some(done) = group.replace(Group::new(row)) {
                if f(&done)?.is_break() {
                    return Ok(());
                }
            }
        }
        if let Some(done) = group {
            f(&done)?;
        }
        Ok(())
    }

    /// The session of `key` containing `time`.
    pub fn get_state(&self, key: &KeyPrefix, time: i64) -> Result<Option<Session>> {
        let txn = self.core.env().begin_read();
        let mut prefix = Vec::new();
        if !self.keys.encode_existing(&txn, key, &mut prefix)? {
            return Ok(None);
        }
        let mut found = None;
        self.for_each_session(&txn, &prefix, &mut |group| {
            if group.first.start > time {
                return Ok(ControlFlow::Break(()));
            }
            if time <= group.end {
                found = Some(self.resolve(&txn, group)?);
                return Ok(ControlFlow::Break(()));
            }
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(found)
    }

    /// Every coalesced session in key order.
    pub fn sessions(&self) -> Result<Vec<Session>> {
        let txn = self.core.env().begin_read();
        let mut out = Vec::new();
        self.for_each_session(&txn, &[], &mut |group| {
            out.push(self.resolve(&txn, group)?);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(out)
    }

    fn write_group(&self, txn: &mut WriteTxn<'_>, data: Db, group: &Group) -> Result<u64> {
        if group.keys.len() < 2 {
            return Ok(0);
        }
        for key in &group.keys {
            txn.delete(data, key)?;
        }
        let mut key = group.first.prefix().to_vec();
        sortable::put_i64(&mut key, group.first.start);
        sortable::put_i64(&mut key, group.end);
        txn.put(data, &key, &group.insert_time.to_be_bytes())?;
        Ok(group.keys.len() as u64 - 1)
    }

    /// Coalesces sessions starting before `condense_before`, then deletes
    /// sessions that ended before `delete_before`. Returns rows removed.
    pub fn condense_and_expire(&self, condense_before: i64, delete_before: i64) -> Result<u64> {
        let data = self.core.data();
        let condensed = self.core.env().write(|txn| {
            let mut removed = 0;
            let mut group: Option<Group> = None;
            for entry in txn.iter(data) {
                let (key, value) = entry?;
                let row = self.raw(key, &value)?;
                if row.start >= condense_before {
                    if let Some(done) = group.take() {
                        removed += self.write_group(txn, data, &done)?;
                    }
                    continue;
                }
                if let Some(g) = group.as_mut() {
                    if g.absorb(&row) {
                        continue;
                    }
                }
                if let Some(done) = group.replace(Group::new(row)) {
                    removed += self.write_group(txn, data, &done)?;
                }
            }
            if let Some(done) = group {
                removed += self.write_group(txn, data, &done)?;
            }
            Ok(removed)
        })?;
        if condensed > 0 {
            log::info!("Condensed {} session rows in {:?}", condensed, self.core.env().path());
        }
        let expired = self.delete_old_data(delete_before, true)?;
        Ok(condensed + expired)
    }
}

impl PlanBDb for SessionDb {
    fn state_type(&self) -> StateType {
        StateType::Session
    }

    fn core(&self) -> &DbCore {
        &self.core
    }

    fn merge_part(&self, source: &Path, hash: Option<&str>) -> Result<bool> {
        self.core.merge_from(
            source,
            hash,
            |path, options| SessionDb::open(path, self.settings.clone(), options),
            |txn, src| {
                let src_txn = src.core.env().begin_read();
                let mut rows = 0;
                for entry in src_txn.iter(src.core.data()) {
                    let (key, value) = entry?;
                    let row = src.raw(key, &value)?;
                    let prefix = src.keys.decode(&src_txn, &mut Reader::new(row.prefix()))?;
                    self.put_row(txn, &prefix, row.start, row.end, row.insert_time)?;
                    rows += 1;
                }
                Ok(rows)
            },
        )
    }

    fn condense(&self, before: i64) -> Result<u64> {
        self.condense_and_expire(before, i64::MIN)
    }

    /// Deletes sessions by their end when `use_state_time` is set, otherwise
    /// by insert time.
    fn delete_old_data(&self, before: i64, use_state_time: bool) -> Result<u64> {
        self.core.delete_where(Some(&self.keys), None, |key, value| {
            let time = if use_state_time {
                Reader::new(&key[key.len().saturating_sub(8)..]).i64()?
            } else {
                ValueCodec::insert_time(value)?
            };
            Ok(time < before)
        })
    }

    fn search(
        &self,
        criteria: &ExpressionCriteria,
        fields: &mut FieldIndex,
        time_filter: Option<&TimeFilter>,
        factory: &ExpressionPredicateFactory,
        consumer: &mut dyn FnMut(Vec<Val>) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut search = Search::new(criteria, fields, time_filter, factory, consumer)?;
        let txn = self.core.env().begin_read();
        self.for_each_session(&txn, &[], &mut |group| {
            let session = self.resolve(&txn, group)?;
            Ok(search.accept(&session))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{TemporalKeySchema, TemporalResolution};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SessionDb {
        let settings = SessionSettings::new()
            .key_schema(TemporalKeySchema::default().temporal_resolution(TemporalResolution::Millisecond));
        SessionDb::open(dir.path(), settings, &EnvOptions::default()).unwrap()
    }

    fn insert_sessions(db: &SessionDb, key: &KeyPrefix) {
        db.write(|txn| {
            db.insert(txn, key, 100, 200)?;
            db.insert(txn, key, 150, 300)?;
            db.insert(txn, key, 300, 400)?;
            db.insert(txn, key, 1_000, 1_100)?;
            db.insert(txn, &KeyPrefix::new("other"), 0, 5_000)
        })
        .unwrap();
    }

    #[test]
    fn test_reads_coalesce_overlapping_sessions() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let key = KeyPrefix::new("TEST");
        insert_sessions(&db, &key);

        let session = db.get_state(&key, 250).unwrap().unwrap();
        assert_eq!((session.start, session.end), (100, 400));
        assert!(db.get_state(&key, 500).unwrap().is_none());
        assert_eq!(db.get_state(&key, 1_100).unwrap().unwrap().start, 1_000);
        assert!(db.get_state(&KeyPrefix::new("missing"), 250).unwrap().is_none());

        let sessions = db.sessions().unwrap();
        assert_eq!(sessions.len(), 3);
        assert_eq!(db.count().unwrap(), 5);
    }

    #[test]
    fn test_condense_preserves_coverage() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let key = KeyPrefix::new("TEST");
        insert_sessions(&db, &key);
        let before = db.sessions().unwrap();

        assert_eq!(db.condense_and_expire(now_millis(), 0).unwrap(), 2);
        assert_eq!(db.count().unwrap(), 3);
        let after = db.sessions().unwrap();
        let spans = |s: &[Session]| s.iter().map(|s| (s.start, s.end)).collect::<Vec<_>>();
        assert_eq!(spans(&after), spans(&before));
    }

    #[test]
    fn test_condense_with_expiry_removes_everything_old() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        insert_sessions(&db, &KeyPrefix::new("TEST"));
        let now = now_millis();
        assert_eq!(db.condense_and_expire(now, now).unwrap(), 5);
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn test_search_streams_coalesced_rows() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        insert_sessions(&db, &KeyPrefix::new("TEST"));
        let mut fields = FieldIndex::with_fields([fields::KEY, fields::START, fields::END]);
        let mut rows = Vec::new();
        db.search(
            &ExpressionCriteria::new(crate::query::Expression::equals(fields::KEY, "TEST")),
            &mut fields,
            None,
            &ExpressionPredicateFactory::new(),
            &mut |row| {
                rows.push(row);
                ControlFlow::Continue(())
            },
        )
        .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Val::string("TEST"), Val::Date(100), Val::Date(400)],
                vec![Val::string("TEST"), Val::Date(1_000), Val::Date(1_100)],
            ]
        );
    }
}
