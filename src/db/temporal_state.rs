//! Time-versioned state.
//!
//! Keys are the encoded prefix followed by the effective time, truncated to
//! the configured resolution. A point query finds the latest version at or
//! before the requested time with one reverse-bounded range scan.

use crate::codec::sortable::{self, Reader};
use crate::codec::{KeyCodec, KeyPrefix, ValueCodec};
use crate::config::EnvOptions;
use crate::db::{delete_unused_lookups, now_millis, DbCore, PlanBDb};
use crate::env::{Txn, WriteTxn};
use crate::error::Result;
use crate::query::{fields, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, Row, Search, TimeFilter};
use crate::settings::{Settings, StateType, TemporalStateSettings};
use crate::val::Val;
use std::ops::{Bound, ControlFlow};
use std::path::Path;

/// Layout version of temporal state shards.
pub const SCHEMA_VERSION: u32 = 1;

const TIME_LEN: usize = 8;

/// A decoded temporal state row.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalStateEntry {
    /// Key
    pub key: KeyPrefix,
    /// Start of the bucket the value became effective in
    pub effective_time: i64,
    /// Value
    pub value: Val,
    /// When the row was written
    pub insert_time: i64,
}

impl Row for TemporalStateEntry {
    fn field(&self, name: &str) -> Val {
        match name {
            fields::KEY => self.key.to_val(),
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

/// Key and time to value shard.
#[derive(Debug, Clone)]
pub struct TemporalStateDb {
    core: DbCore,
    settings: TemporalStateSettings,
    keys: KeyCodec,
    values: ValueCodec,
}

impl TemporalStateDb {
    /// Opens the shard at `path`.
    pub fn open(path: &Path, settings: TemporalStateSettings, options: &EnvOptions) -> Result<Self> {
        let core = DbCore::open(
            path,
            StateType::TemporalState,
            Settings::TemporalState(settings.clone()),
            SCHEMA_VERSION,
            options,
        )?;
        let keys = KeyCodec::open(
            core.env(),
            "key",
            settings.key_schema.key_type,
            settings.key_schema.hash_length,
        )?;
        let values = ValueCodec::open(core.env(), "value", &settings.value_schema)?;
        Ok(Self { core, settings, keys, values })
    }

    /// Stores `value` for `key` from `effective_time` on.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, key: &KeyPrefix, effective_time: i64, value: &Val) -> Result<bool> {
        let effective_time = self.settings.key_schema.temporal_resolution.truncate(effective_time);
        self.put_row(txn, key, effective_time, value, now_millis(), self.settings.overwrite)
    }

    fn put_row(
        &self,
        txn: &mut WriteTxn<'_>,
        key: &KeyPrefix,
        effective_time: i64,
        value: &Val,
        insert_time: i64,
        overwrite: bool,
    ) -> Result<bool> {
        let mut encoded = Vec::new();
        self.keys.encode(txn, key, &mut encoded)?;
        sortable::put_i64(&mut encoded, effective_time);
        let value = self.values.encode(txn, insert_time, value)?;
        if overwrite {
            txn.put(self.core.data(), &encoded, &value)?;
            Ok(true)
        } else {
            txn.put_if_absent(self.core.data(), &encoded, &value)
        }
    }

    /// The version of `key` in effect at `time`: the one with the greatest
    /// effective time not after `time`.
    pub fn get_state(&self, key: &KeyPrefix, time: i64) -> Result<Option<TemporalStateEntry>> {
        let txn = self.core.env().begin_read();
        let mut prefix = Vec::new();
        if !self.keys.encode_existing(&txn, key, &mut prefix)? {
            return Ok(None);
        }
        let mut upper = prefix.clone();
        sortable::put_i64(&mut upper, time);

        // Prefixes are self-delimiting, so every key in [prefix, prefix+time]
        // belongs to this prefix.
        let found = txn.last_in_range(
            self.core.data(),
            Bound::Included(prefix.as_slice()),
            Bound::Included(upper.as_slice()),
        )?;
        match found {
            Some((k, v)) => Ok(Some(self.decode_entry(&txn, &k, &v)?)),
            None => Ok(None),
        }
    }

    fn decode_entry(&self, txn: &dyn Txn, key: &[u8], value: &[u8]) -> Result<TemporalStateEntry> {
        let mut reader = Reader::new(key);
        Ok(TemporalStateEntry {
            key: self.keys.decode(txn, &mut reader)?,
            effective_time: reader.i64()?,
            value: self.values.decode(txn, value)?,
            insert_time: ValueCodec::insert_time(value)?,
        })
    }

    fn effective_time(key: &[u8]) -> Result<i64> {
        Reader::new(&key[key.len().saturating_sub(TIME_LEN)..]).i64()
    }

    /// Every row in key order.
    pub fn entries(&self) -> Result<Vec<TemporalStateEntry>> {
        let txn = self.core.env().begin_read();
        txn.iter(self.core.data())
            .map(|entry| {
                let (key, value) = entry?;
                self.decode_entry(&txn, &key, &value)
            })
            .collect()
    }
}

impl PlanBDb for TemporalStateDb {
    fn state_type(&self) -> StateType {
        StateType::TemporalState
    }

    fn core(&self) -> &DbCore {
        &self.core
    }

    fn merge_part(&self, source: &Path, hash: Option<&str>) -> Result<bool> {
        self.core.merge_from(
            source,
            hash,
            |path, options| TemporalStateDb::open(path, self.settings.clone(), options),
            |txn, src| {
                let src_txn = src.core.env().begin_read();
                let mut rows = 0;
                for entry in src_txn.iter(src.core.data()) {
                    let (key, value) = entry?;
                    let row = src.decode_entry(&src_txn, &key, &value)?;
                    self.put_row(txn, &row.key, row.effective_time, &row.value, row.insert_time, true)?;
                    rows += 1;
                }
                Ok(rows)
            },
        )
    }

    /// Keeps, per key, only the latest version that became effective before
    /// `before`; versions after it are untouched.
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
                let prefix_len = key.len() - TIME_LEN;
                if let Some(prev) = previous.take() {
                    if prev.len() == key.len() && prev[..prefix_len] == key[..prefix_len] {
                        txn.delete(data, &prev)?;
                        removed += 1;
                    }
                }
                previous = Some(key);
            }
            if removed > 0 {
                delete_unused_lookups(txn, data, Some(&self.keys), Some(&self.values))?;
            }
            Ok(removed)
        })?;
        if removed > 0 {
            log::info!("Condensed {} rows in {:?}", removed, self.core.env().path());
        }
        Ok(removed)
    }

    fn delete_old_data(&self, before: i64, use_state_time: bool) -> Result<u64> {
        self.core.delete_where(Some(&self.keys), Some(&self.values), |key, value| {
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
