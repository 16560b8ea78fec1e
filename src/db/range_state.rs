//! Numeric range to value state.
//!
//! Each row is keyed by its `(start, end)` bounds, both inclusive, in the
//! configured [`RangeType`] width. RANGE_STATE inserts replace the value of an
//! identical range; RANGED_STATE inserts never replace an existing one.
//! Overlapping ranges are stored as they are; a point query returns the
//! containing range with the greatest start, then the greatest end.

use crate::codec::sortable::{self, Reader};
use crate::codec::ValueCodec;
use crate::config::EnvOptions;
use crate::db::{now_millis, DbCore, PlanBDb};
use crate::env::{Txn, WriteTxn};
use crate::error::{Error, Result};
use crate::query::{fields, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, Row, Search, TimeFilter};
use crate::settings::{RangeStateSettings, RangeType, Settings, StateType};
use crate::val::Val;
use std::ops::{Bound, ControlFlow};
use std::path::Path;

/// Layout version of range state shards.
pub const SCHEMA_VERSION: u32 = 1;

pub(crate) fn check_range(range_type: RangeType, start: i64, end: i64) -> Result<()> {
    if start > end {
        return Err(Error::validation(format!("range start {} is after its end {}", start, end)));
    }
    if !range_type.fits(start) || !range_type.fits(end) {
        return Err(Error::validation(format!("range {}..={} does not fit {:?} bounds", start, end, range_type)));
    }
    Ok(())
}

pub(crate) fn put_bound(buf: &mut Vec<u8>, range_type: RangeType, v: i64) {
    match range_type {
        RangeType::Byte => sortable::put_i8(buf, v as i8),
        RangeType::Short => sortable::put_i16(buf, v as i16),
        RangeType::Int => sortable::put_i32(buf, v as i32),
        RangeType::Long => sortable::put_i64(buf, v),
    }
}

pub(crate) fn read_bound(reader: &mut Reader<'_>, range_type: RangeType) -> Result<i64> {
    Ok(match range_type {
        RangeType::Byte => reader.i8()? as i64,
        RangeType::Short => reader.i16()? as i64,
        RangeType::Int => reader.i32()? as i64,
        RangeType::Long => reader.i64()?,
    })
}

pub(crate) fn bound_val(range_type: RangeType, v: i64) -> Val {
    match range_type {
        RangeType::Byte => Val::Byte(v as i8),
        RangeType::Short => Val::Short(v as i16),
        RangeType::Int => Val::Int(v as i32),
        RangeType::Long => Val::Long(v),
    }
}

/// Largest bound representable in `range_type`.
pub(crate) fn max_bound(range_type: RangeType) -> i64 {
    match range_type {
        RangeType::Byte => i8::MAX as i64,
        RangeType::Short => i16::MAX as i64,
        RangeType::Int => i32::MAX as i64,
        RangeType::Long => i64::MAX,
    }
}

/// A decoded range row.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeStateEntry {
    /// Inclusive lower bound
    pub key_start: i64,
    /// Inclusive upper bound
    pub key_end: i64,
    /// Value
    pub value: Val,
    /// When the row was written
    pub insert_time: i64,
    range_type: RangeType,
}

impl RangeStateEntry {
    /// Whether `key` lies inside the range.
    pub fn contains(&self, key: i64) -> bool {
        self.key_start <= key && key <= self.key_end
    }
}

impl Row for RangeStateEntry {
    fn field(&self, name: &str) -> Val {
        match name {
            fields::KEY_START => bound_val(self.range_type, self.key_start),
            fields::KEY_END => bound_val(self.range_type, self.key_end),
            fields::VALUE_TYPE => Val::string(self.value.type_name()),
            fields::VALUE => self.value.clone(),
            fields::INSERT_TIME => Val::Date(self.insert_time),
            _ => Val::Null,
        }
    }
}

/// Range to value shard, serving both RANGE_STATE and RANGED_STATE.
#[derive(Debug, Clone)]
pub struct RangeStateDb {
    core: DbCore,
    settings: RangeStateSettings,
    ranged: bool,
    values: ValueCodec,
}

impl RangeStateDb {
    /// Opens the shard at `path`. `ranged` selects RANGED_STATE semantics.
    pub fn open(path: &Path, settings: RangeStateSettings, ranged: bool, options: &EnvOptions) -> Result<Self> {
        let state_type = if ranged { StateType::RangedState } else { StateType::RangeState };
        let core = DbCore::open(path, state_type, Settings::RangeState(settings.clone()), SCHEMA_VERSION, options)?;
        let values = ValueCodec::open(core.env(), "value", &settings.value_schema)?;
        Ok(Self { core, settings, ranged, values })
    }

    fn range_type(&self) -> RangeType {
        self.settings.key_schema.range_type
    }

    /// Stores `value` for the range `start..=end`. Returns whether the row
    /// was written.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, start: i64, end: i64, value: &Val) -> Result<bool> {
        let overwrite = self.settings.overwrite && !self.ranged;
        self.put_row(txn, start, end, value, now_millis(), overwrite)
    }

    fn put_row(
        &self,
        txn: &mut WriteTxn<'_>,
        start: i64,
        end: i64,
        value: &Val,
        insert_time: i64,
        overwrite: bool,
    ) -> Result<bool> {
        check_range(self.range_type(), start, end)?;
        let mut key = Vec::with_capacity(16);
        put_bound(&mut key, self.range_type(), start);
        put_bound(&mut key, self.range_type(), end);
        let value = self.values.encode(txn, insert_time, value)?;
        if overwrite {
            txn.put(self.core.data(), &key, &value)?;
            Ok(true)
        } else {
            txn.put_if_absent(self.core.data(), &key, &value)
        }
    }

    /// The range containing `key`.
    pub fn get_state(&self, key: i64) -> Result<Option<RangeStateEntry>> {
        if !self.range_type().fits(key) {
            return Ok(None);
        }
        let txn = self.core.env().begin_read();
        let mut upper = Vec::with_capacity(16);
        put_bound(&mut upper, self.range_type(), key);
        put_bound(&mut upper, self.range_type(), max_bound(self.range_type()));

        // Walking down from (key, max) meets starts <= key in descending
        // order, so the first row reaching key is the answer.
        for entry in txn.range_rev(self.core.data(), Bound::Unbounded, Bound::Included(upper.as_slice())) {
            let (k, v) = entry?;
            let mut reader = Reader::new(&k);
            reader.take(self.range_type().width())?;
            if read_bound(&mut reader, self.range_type())? >= key {
                return Ok(Some(self.decode_entry(&txn, &k, &v)?));
            }
        }
        Ok(None)
    }

    fn decode_entry(&self, txn: &dyn Txn, key: &[u8], value: &[u8]) -> Result<RangeStateEntry> {
        let mut reader = Reader::new(key);
        Ok(RangeStateEntry {
            key_start: read_bound(&mut reader, self.range_type())?,
            key_end: read_bound(&mut reader, self.range_type())?,
            value: self.values.decode(txn, value)?,
            insert_time: ValueCodec::insert_time(value)?,
            range_type: self.range_type(),
        })
    }

    /// Every row in key order.
    pub fn entries(&self) -> Result<Vec<RangeStateEntry>> {
        let txn = self.core.env().begin_read();
        txn.iter(self.core.data())
            .map(|entry| {
                let (key, value) = entry?;
                self.decode_entry(&txn, &key, &value)
            })
            .collect()
    }
}

impl PlanBDb for RangeStateDb {
    fn state_type(&self) -> StateType {
        if self.ranged {
            StateType::RangedState
        } else {
            StateType::RangeState
        }
    }

    fn core(&self) -> &DbCore {
        &self.core
    }

    fn merge_part(&self, source: &Path, hash: Option<&str>) -> Result<bool> {
        self.core.merge_from(
            source,
            hash,
            |path, options| RangeStateDb::open(path, self.settings.clone(), self.ranged, options),
            |txn, src| {
                let src_txn = src.core.env().begin_read();
                let mut rows = 0;
                for entry in src_txn.iter(src.core.data()) {
                    let (key, value) = entry?;
                    let row = src.decode_entry(&src_txn, &key, &value)?;
                    self.put_row(txn, row.key_start, row.key_end, &row.value, row.insert_time, true)?;
                    rows += 1;
                }
                Ok(rows)
            },
        )
    }

    fn delete_old_data(&self, before: i64, _use_state_time: bool) -> Result<u64> {
        self.core.delete_where(None, Some(&self.values), |_, value| Ok(ValueCodec::insert_time(value)? < before))
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
