//! Aggregated numeric samples per key and time bucket.

use crate::codec::sortable::{self, Reader};
use crate::codec::{KeyCodec, KeyPrefix, ValueCodec};
use crate::config::EnvOptions;
use crate::db::{now_millis, DbCore, PlanBDb};
use crate::env::{Txn, WriteTxn};
use crate::error::{Error, Result};
use crate::query::{fields, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, Row, Search, TimeFilter};
use crate::settings::{MetricSettings, Settings, StateType};
use crate::val::Val;
use std::ops::{Bound, ControlFlow};
use std::path::Path;

/// Layout version of metric shards.
pub const SCHEMA_VERSION: u32 = 1;

const TIME_LEN: usize = 8;
const VALUE_LEN: usize = 56;

/// Aggregate of the samples in one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricValue {
    /// Time of the latest sample
    pub latest_time: i64,
    /// Latest sample
    pub latest: i64,
    /// Smallest sample
    pub min: i64,
    /// Largest sample
    pub max: i64,
    /// Number of samples
    pub count: i64,
    /// Sum of samples
    pub sum: i64,
}

impl MetricValue {
    /// Aggregate of a single sample.
    pub fn sample(time: i64, value: i64) -> Self {
        Self { latest_time: time, latest: value, min: value, max: value, count: 1, sum: value }
    }

    /// Combines two aggregates. The later sample wins `latest`; on equal
    /// times the larger value does, so combining is order independent.
    pub fn combine(self, other: MetricValue) -> MetricValue {
        let (latest_time, latest) = (self.latest_time, self.latest).max((other.latest_time, other.latest));
        MetricValue {
            latest_time,
            latest,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            count: self.count.saturating_add(other.count),
            sum: self.sum.saturating_add(other.sum),
        }
    }

    /// Mean of the samples.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    fn encode(&self, insert_time: i64) -> Vec<u8> {
        let mut out = Vec::with_capacity(VALUE_LEN);
        for v in [insert_time, self.latest_time, self.latest, self.min, self.max, self.count, self.sum] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != VALUE_LEN {
            return Err(Error::corruption(format!("metric value has {} bytes", bytes.len())));
        }
        let mut reader = Reader::new(&bytes[8..]);
        Ok(Self {
            latest_time: read_be(&mut reader)?,
            latest: read_be(&mut reader)?,
            min: read_be(&mut reader)?,
            max: read_be(&mut reader)?,
            count: read_be(&mut reader)?,
            sum: read_be(&mut reader)?,
        })
    }
}

fn read_be(reader: &mut Reader<'_>) -> Result<i64> {
    let bytes = reader.take(8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(i64::from_be_bytes(buf))
}

/// One metric bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEntry {
    /// Key, usually a tag set
    pub key: KeyPrefix,
    /// Bucket start
    pub time: i64,
    /// Aggregate
    pub value: MetricValue,
    /// When the bucket was last written
    pub insert_time: i64,
}

impl Row for MetricEntry {
    fn field(&self, name: &str) -> Val {
        match name {
            fields::KEY => self.key.to_val(),
            fields::TIME => Val::Date(self.time),
            fields::LATEST => Val::Long(self.value.latest),
            fields::MIN => Val::Long(self.value.min),
            fields::MAX => Val::Long(self.value.max),
            fields::COUNT => Val::Long(self.value.count),
            fields::SUM => Val::Long(self.value.sum),
            fields::AVERAGE => Val::Double(self.value.average()),
            fields::INSERT_TIME => Val::Date(self.insert_time),
            tag => self.key.tag(tag).cloned().unwrap_or(Val::Null),
        }
    }

    fn time(&self) -> Option<i64> {
        Some(self.time)
    }
}

/// Metric shard.
#[derive(Debug, Clone)]
pub struct MetricDb {
    core: DbCore,
    settings: MetricSettings,
    keys: KeyCodec,
}

impl MetricDb {
    /// Opens the shard at `path`.
    pub fn open(path: &Path, settings: MetricSettings, options: &EnvOptions) -> Result<Self> {
        let core = DbCore::open(path, StateType::Metric, Settings::Metric(settings.clone()), SCHEMA_VERSION, options)?;
        let keys = KeyCodec::open(
            core.env(),
            "key",
            settings.key_schema.key_type,
            settings.key_schema.hash_length,
        )?;
        Ok(Self { core, settings, keys })
    }

    /// Adds the sample `value` taken at `time` to its bucket.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, key: &KeyPrefix, time: i64, value: i64) -> Result<()> {
        let bucket = self.settings.key_schema.temporal_resolution.truncate(time);
        self.add(txn, key, bucket, MetricValue::sample(time, value), now_millis())
    }

    fn add(
        &self,
        txn: &mut WriteTxn<'_>,
        key: &KeyPrefix,
        bucket: i64,
        value: MetricValue,
        insert_time: i64,
    ) -> Result<()> {
        let mut encoded = Vec::new();
        self.keys.encode(txn, key, &mut encoded)?;
        sortable::put_i64(&mut encoded, bucket);
        let data = self.core.data();
        let (value, insert_time) = match txn.get(data, &encoded)? {
            Some(existing) => (
                MetricValue::decode(&existing)?.combine(value),
                ValueCodec::insert_time(&existing)?.max(insert_time),
            ),
            None => (value, insert_time),
        };
        txn.put(data, &encoded, &value.encode(insert_time))
    }

    fn decode_entry(&self, txn: &dyn Txn, key: &[u8], value: &[u8]) -> Result<MetricEntry> {
        let mut reader = Reader::new(key);
        Ok(MetricEntry {
            key: self.keys.decode(txn, &mut reader)?,
            time: reader.i64()?,
            value: MetricValue::decode(value)?,
            insert_time: ValueCodec::insert_time(value)?,
        })
    }

    /// Aggregate of the bucket of `key` containing `time`.
    pub fn get(&self, key: &KeyPrefix, time: i64) -> Result<Option<MetricValue>> {
        let txn = self.core.env().begin_read();
        let mut encoded = Vec::new();
        if !self.keys.encode_existing(&txn, key, &mut encoded)? {
            return Ok(None);
        }
        sortable::put_i64(&mut encoded, self.settings.key_schema.temporal_resolution.truncate(time));
        txn.get(self.core.data(), &encoded)?.map(|v| MetricValue::decode(&v)).transpose()
    }

    /// Buckets of `key` starting in `[from, to)`, in time order.
    pub fn get_range(&self, key: &KeyPrefix, from: i64, to: i64) -> Result<Vec<MetricEntry>> {
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
}

impl PlanBDb for MetricDb {
    fn state_type(&self) -> StateType {
        StateType::Metric
    }

    fn core(&self) -> &DbCore {
        &self.core
    }

    fn merge_part(&self, source: &Path, hash: Option<&str>) -> Result<bool> {
        self.core.merge_from(
            source,
            hash,
            |path, options| MetricDb::open(path, self.settings.clone(), options),
            |txn, src| {
                let src_txn = src.core.env().begin_read();
                let mut rows = 0;
                for entry in src_txn.iter(src.core.data()) {
                    let (key, value) = entry?;
                    let row = src.decode_entry(&src_txn, &key, &value)?;
                    self.add(txn, &row.key, row.time, row.value, row.insert_time)?;
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
