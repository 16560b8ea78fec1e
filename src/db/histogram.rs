//! Counts per key and time bucket.
//!
//! Inserting adds to the bucket's count and merging sums counts, so the
//! result of loading a set of parts does not depend on how they were split.

use crate::codec::sortable::{self, Reader};
use crate::codec::{KeyCodec, KeyPrefix, ValueCodec};
use crate::config::EnvOptions;
use crate::db::{now_millis, DbCore, PlanBDb};
use crate::env::{Txn, WriteTxn};
use crate::error::{Error, Result};
use crate::query::{fields, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, Row, Search, TimeFilter};
use crate::settings::{HistogramSettings, Settings, StateType};
use crate::val::Val;
use std::ops::{Bound, ControlFlow};
use std::path::Path;

/// Layout version of histogram shards.
pub const SCHEMA_VERSION: u32 = 1;

const TIME_LEN: usize = 8;

/// One histogram bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramEntry {
    /// Key, usually a tag set
    pub key: KeyPrefix,
    /// Bucket start
    pub time: i64,
    /// Count
    pub count: i64,
    /// When the bucket was last written
    pub insert_time: i64,
}

impl Row for HistogramEntry {
    fn field(&self, name: &str) -> Val {
        match name {
            fields::KEY => self.key.to_val(),
            fields::TIME => Val::Date(self.time),
            fields::COUNT => Val::Long(self.count),
            fields::INSERT_TIME => Val::Date(self.insert_time),
            tag => self.key.tag(tag).cloned().unwrap_or(Val::Null),
        }
    }

    fn time(&self) -> Option<i64> {
        Some(self.time)
    }
}

fn encode_value(insert_time: i64, count: i64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&insert_time.to_be_bytes());
    out[8..].copy_from_slice(&count.to_be_bytes());
    out
}

fn decode_count(value: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = value
        .get(8..16)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::corruption("histogram value is truncated"))?;
    Ok(i64::from_be_bytes(bytes))
}

/// Histogram shard.
#[derive(Debug, Clone)]
pub struct HistogramDb {
    core: DbCore,
    settings: HistogramSettings,
    keys: KeyCodec,
}

impl HistogramDb {
    /// Opens the shard at `path`.
    pub fn open(path: &Path, settings: HistogramSettings, options: &EnvOptions) -> Result<Self> {
        let core = DbCore::open(path, StateType::Histogram, Settings::Histogram(settings.clone()), SCHEMA_VERSION, options)?;
        let keys = KeyCodec::open(
            core.env(),
            "key",
            settings.key_schema.key_type,
            settings.key_schema.hash_length,
        )?;
        Ok(Self { core, settings, keys })
    }

    /// Adds `count` to the bucket of `key` containing `time`.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, key: &KeyPrefix, time: i64, count: i64) -> Result<()> {
        let time = self.settings.key_schema.temporal_resolution.truncate(time);
        self.add(txn, key, time, count, now_millis())
    }

    fn add(&self, txn: &mut WriteTxn<'_>, key: &KeyPrefix, time: i64, count: i64, insert_time: i64) -> Result<()> {
        let mut encoded = Vec::new();
        self.keys.encode(txn, key, &mut encoded)?;
        sortable::put_i64(&mut encoded, time);
        let data = self.core.data();
        let (total, insert_time) = match txn.get(data, &encoded)? {
            Some(existing) => (
                decode_count(&existing)?.saturating_add(count),
                ValueCodec::insert_time(&existing)?.max(insert_time),
            ),
            None => (count, insert_time),
        };
        txn.put(data, &encoded, &encode_value(insert_time, total))
    }

    fn decode_entry(&self, txn: &dyn Txn, key: &[u8], value: &[u8]) -> Result<HistogramEntry> {
        let mut reader = Reader::new(key);
        Ok(HistogramEntry {
            key: self.keys.decode(txn, &mut reader)?,
            time: reader.i64()?,
            count: decode_count(value)?,
            insert_time: ValueCodec::insert_time(value)?,
        })
    }

    /// Count of the bucket of `key` containing `time`.
    pub fn get(&self, key: &KeyPrefix, time: i64) -> Result<Option<i64>> {
        let txn = self.core.env().begin_read();
        let mut encoded = Vec::new();
        if !self.keys.encode_existing(&txn, key, &mut encoded)? {
            return Ok(None);
        }
        sortable::put_i64(&mut encoded, self.settings.key_schema.temporal_resolution.truncate(time));
        txn.get(self.core.data(), &encoded)?.map(|v| decode_count(&v)).transpose()
    }

    /// Buckets of `key` starting in `[from, to)`, in time order.
    pub fn get_range(&self, key: &KeyPrefix, from: i64, to: i64) -> Result<Vec<HistogramEntry>> {
        let txn = self.core.env().begin_read();
        let mut lower = Vec::new();
        if !self.keys.encode_existing(&txn, key, &mut lower)? {
            return Ok(Vec::new());
        }
        let mut upper = lower.clone();
        sortable::put_i64(&mut lower, from);
        sortable::put_i64(&mut upper, to);
        txn.range(
            self.core.data(),
            Bound::Included(lower.as_slice()),
            Bound::Excluded(upper.as_slice()),
        )
        .map(|entry| {
            let (k, v) = entry?;
            self.decode_entry(&txn, &k, &v)
        })
        .collect()
    }

    /// Every bucket in key order.
    pub fn entries(&self) -> Result<Vec<HistogramEntry>> {
        let txn = self.core.env().begin_read();
        txn.iter(self.core.data())
            .map(|entry| {
                let (key, value) = entry?;
                self.decode_entry(&txn, &key, &value)
            })
            .collect()
    }
}

impl PlanBDb for HistogramDb {
    fn state_type(&self) -> StateType {
        StateType::Histogram
    }

    fn core(&self) -> &DbCore {
        &self.core
    }

    /// Adds the source's counts to this shard's buckets.
    fn merge_part(&self, source: &Path, hash: Option<&str>) -> Result<bool> {
        self.core.merge_from(
            source,
            hash,
            |path, options| HistogramDb::open(path, self.settings.clone(), options),
            |txn, src| {
                let src_txn = src.core.env().begin_read();
                let mut rows = 0;
                for entry in src_txn.iter(src.core.data()) {
                    let (key, value) = entry?;
                    let row = src.decode_entry(&src_txn, &key, &value)?;
                    self.add(txn, &row.key, row.time, row.count, row.insert_time)?;
                    rows += 1;
                }
                Ok(rows)
            },
        )
    }

    fn delete_old_data(&self, before: i64, use_state_time: bool) -> Result<u64> {
        self.core.delete_where(Some(&self.keys), None, |key, value| {
            let time = if use_state_time {
                Reader::new(&key[key.len().saturating_sub(TIME_LEN)..]).i64()?
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
