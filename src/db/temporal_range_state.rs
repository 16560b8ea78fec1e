//! Numeric ranges with effective-time versioning.
//!
//! Keys are `(start, end, effective time)`. A point query picks the containing
//! range with the greatest start, then end, that has a version effective at the
//! query time, and returns that range's latest such version.

use crate::codec::sortable::{self, Reader};
use crate::codec::ValueCodec;
use crate::config::EnvOptions;
use crate::db::range_state::{bound_val, check_range, max_bound, put_bound, read_bound};
use crate::db::{delete_unused_lookups, now_millis, DbCore, PlanBDb};
use crate::env::{Txn, WriteTxn};
use crate::error::Result;
use crate::query::{fields, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, Row, Search, TimeFilter};
use crate::settings::{RangeType, Settings, StateType, TemporalRangeStateSettings};
use crate::val::Val;
use std::ops::{Bound, ControlFlow};
use std::path::Path;

/// Layout version of temporal range state shards.
pub const SCHEMA_VERSION: u32 = 1;

const TIME_LEN: usize = 8;

/// A decoded temporal range row.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalRangeStateEntry {
    /// Inclusive lower bound
    pub key_start: i64,
    /// Inclusive upper bound
    pub key_end: i64,
    /// Start of the bucket the value became effective in
    pub effective_time: i64,
    /// Value
    pub value: Val,
    /// When the row was written
    pub insert_time: i64,
    range_type: RangeType,
}

impl Row for TemporalRangeStateEntry {
    fn field(&self, name: &str) -> Val {
        match name {
            fields::KEY_START => bound_val(self.range_type, self.key_start),
            fields::KEY_END => bound_val(self.range_type, self.key_end),
            fields::EFFECTIVE_TIME => Val::Date(self.effective_time),
            fields::VALUE_TYPE => Val::string(self.value.type_name()),
            fields::VALUE => self.value.clone(),
            fields::INSERT_TIME => Val::Date(self.insert_time),
            _ => Val::Null,
        }
    }

    fn time(&self) -> Option<i64> {
        Some(self.effective_time)
    }
}

/// Range and time to value shard, serving TEMPORAL_RANGE_STATE and
/// TEMPORAL_RANGED_STATE.
#[derive(Debug, Clone)]
pub struct TemporalRangeStateDb {
    core: DbCore,
    settings: TemporalRangeStateSettings,
    ranged: bool,
    values: ValueCodec,
}

impl TemporalRangeStateDb {
    /// Opens the shard at `path`. `ranged` selects TEMPORAL_RANGED_STATE
    /// semantics.
    pub fn open(
        path: &Path,
        settings: TemporalRangeStateSettings,
        ranged: bool,
        options: &EnvOptions,
    ) -> Result<Self> {
        let state_type = if ranged { StateType::TemporalRangedState } else { StateType::TemporalRangeState };
        let core = DbCore::open(
            path,
            state_type,
            Settings::TemporalRangeState(settings.clone()),
            SCHEMA_VERSION,
            options,
        )?;
        let values = ValueCodec::open(core.env(), "value", &settings.value_schema)?;
        Ok(Self { core, settings, ranged, values })
    }

    fn range_type(&self) -> RangeType {
        self.settings.key_schema.range_type
    }

    /// Stores `value` for `start..=end` from `effective_time` on.
    pub fn insert(
        &self,
        txn: &mut WriteTxn<'_>,
        start: i64,
        end: i64,
        effective_time: i64,
        value: &Val,
    ) -> Result<bool> {
        let effective_time = self.settings.key_schema.temporal_resolution.truncate(effective_time);
        let overwrite = self.settings.overwrite && !self.ranged;
        self.put_row(txn, start, end, effective_time, value, now_millis(), overwrite)
    }

    #[allow(clippy::too_many_arguments)]
    fn put_row(
        &self,
        txn: &mut WriteTxn<'_>,
        start: i64,
        end: i64,
        effective_time: i64,
        value: &Val,
        insert_time: i64,
        overwrite: bool,
    ) -> Result<bool> {
        check_range(self.range_type(), start, end)?;
        let mut key = Vec::with_capacity(24);
        put_bound(&mut key, self.range_type(), start);
        put_bound(&mut key, self.range_type(), end);
        sortable::put_i64(&mut key, effective_time);
        let value = self.values.encode(txn, insert_time, value)?;
        if overwrite {
            txn.put(self.core.data(), &key, &value)?;
            Ok(true)
        } else {
            txn.put_if_absent(self.core.data(), &key, &value)
        }
    }

    /// The version in effect at `time` of the range containing `key`.
    pub fn get_state(&self, key: i64, time: i64) -> Result<Option<TemporalRangeStateEntry>> {
        if !self.range_type().fits(key) {
            return Ok(None);
        }
        let range_type = self.range_type();
        let txn = self.core.env().begin_read();
        let mut upper = Vec::with_capacity(24);
        put_bound(&mut upper, range_type, key);
        put_bound(&mut upper, range_type, max_bound(range_type));
        sortable::put_i64(&mut upper, i64::MAX);

        for entry in txn.range_rev(self.core.data(), Bound::Unbounded, Bound::Included(upper.as_slice())) {
            let (k, v) = entry?;
            let mut reader = Reader::new(&k);
            reader.take(range_type.width())?;
            let end = read_bound(&mut reader, range_type)?;
            let effective_time = reader.i64()?;
            if end >= key && effective_time <= time {
                return Ok(Some(self.decode_entry(&txn, &k, &v)?));
            }
        }
        Ok(None)
    }

    fn decode_entry(&self, txn: &dyn Txn, key: &[u8], value: &[u8]) -> Result<TemporalRangeStateEntry> {
        let mut reader = Reader::new(key);
        Ok(TemporalRangeStateEntry {
            key_start: read_bound(&mut reader, self.range_type())?,
            key_end: read_bound(&mut reader, self.range_type())?,
            effective_time: reader.i64()?,
            value: self.values.decode(txn, value)?,
            insert_time: ValueCodec::insert_time(value)?,
            range_type: self.range_type(),
        })
    }

    fn effective_time(key: &[u8]) -> Result<i64> {
        Reader::new(&key[key.len().saturating_sub(TIME_LEN)..]).i64()
    }

    /// Every row in key order.
    pub fn entries(&self) -> Result<Vec<TemporalRangeStateEntry>> {
        let txn = self.core.env().begin_read();
        txn.iter(self.core.data())
            .map(|entry| {
                let (key, value) = entry?;
                self.decode_entry(&txn, &key, &value)
            })
            .collect()
    }
}

impl PlanBDb for TemporalRangeStateDb {
    fn state_type(&self) -> StateType {
        if self.ranged {
            StateType::TemporalRangedState
        } else {
            StateType::TemporalRangeState
        }
    }

    fn core(&self) -> &DbCore {
        &self.core
    }

    fn merge_part(&self, source: &Path, hash: Option<&str>) -> Result<bool> {
        self.core.merge_from(
            source,
            hash,
            |path, options| TemporalRangeStateDb::open(path, self.settings.clone(), self.ranged, options),
            |txn, src| {
                let src_txn = src.core.env().begin_read();
                let mut rows = 0;
                for entry in src_txn.iter(src.core.data()) {
                    let (key, value) = entry?;
                    let row = src.decode_entry(&src_txn, &key, &value)?;
                    self.put_row(
                        txn,
                        row.key_start,
                        row.key_end,
                        row.effective_time,
                        &row.value,
                        row.insert_time,
                        true,
                    )?;
                    rows += 1;
                }
                Ok(rows)
            },
        )
    }

    /// Keeps, per range, only the latest version effective before `before`.
    fn condense(&self, before: i64) -> Result<u64> {
        let data = self.core.data();
        let removed = self.core.env().write(|txn| {
            let mut removed = 0;
            let mut previous: Option<Vec<u8>> = None;
            for entry in txn.iter(data) {
                let (key, _) = entry?;
                if Self::effective_time(&key)? >= before {
                    previous = None;
                    continue;
                }
                let range_len = key.len() - TIME_LEN;
                if let Some(prev) = previous.take() {
                    if prev[..range_len] == key[..range_len] {
                        txn.delete(data, &prev)?;
                        removed += 1;
                    }
                }
                previous = Some(key);
            }
            if removed > 0 {
                delete_unused_lookups(txn, data, None, Some(&self.values))?;
            }
            Ok(removed)
        })?;
        if removed > 0 {
            log::info!("Condensed {} rows in {:?}", removed, self.core.env().path());
        }
        Ok(removed)
    }

    fn delete_old_data(&self, before: i64, use_state_time: bool) -> Result<u64> {
        self.core.delete_where(None, Some(&self.values), |key, value| {
            let time = if use_state_time { Self::effective_time(key)? } else { ValueCodec::insert_time(value)? };
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
        for entry in txn.iter(self.core.data()) {
            let (key, value) = entry?;
            let row = self.decode_entry(&txn, &key, &value)?;
            if search.accept(&row).is_break() {
                break;
            }
        }
        Ok(())
    }
}
