//! Plain key to value state.

use crate::codec::sortable::Reader;
use crate::codec::{KeyCodec, KeyPrefix, ValueCodec};
use crate::config::EnvOptions;
use crate::db::{now_millis, DbCore, PlanBDb};
use crate::env::{Txn, WriteTxn};
use crate::error::Result;
use crate::query::{fields, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, Row, Search, TimeFilter};
use crate::settings::{Settings, StateSettings, StateType};
use crate::val::Val;
use std::ops::ControlFlow;
use std::path::Path;

/// Layout version of state shards.
pub const SCHEMA_VERSION: u32 = 1;

/// A decoded state row.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    /// Key
    pub key: KeyPrefix,
    /// Value
    pub value: Val,
    /// When the row was written
    pub insert_time: i64,
}

impl Row for StateEntry {
    fn field(&self, name: &str) -> Val {
        match name {
            fields::KEY => self.key.to_val(),
            fields::VALUE_TYPE => Val::string(self.value.type_name()),
            fields::VALUE => self.value.clone(),
            fields::INSERT_TIME => Val::Date(self.insert_time),
            _ => Val::Null,
        }
    }
}

/// Key to value shard.
#[derive(Debug, Clone)]
pub struct StateDb {
    core: DbCore,
    settings: StateSettings,
    keys: KeyCodec,
    values: ValueCodec,
}

impl StateDb {
    /// Opens the shard at `path`.
    pub fn open(path: &Path, settings: StateSettings, options: &EnvOptions) -> Result<Self> {
        let core = DbCore::open(path, StateType::State, Settings::State(settings.clone()), SCHEMA_VERSION, options)?;
        let keys = KeyCodec::open(
            core.env(),
            "key",
            settings.key_schema.key_type,
            settings.key_schema.hash_length,
        )?;
        let values = ValueCodec::open(core.env(), "value", &settings.value_schema)?;
        Ok(Self { core, settings, keys, values })
    }

    /// Stores `value` under `key`. Without `overwrite` an existing row is
    /// kept; returns whether the row was written.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, key: &KeyPrefix, value: &Val) -> Result<bool> {
        self.put_row(txn, key, value, now_millis(), self.settings.overwrite)
    }

    fn put_row(
        &self,
        txn: &mut WriteTxn<'_>,
        key: &KeyPrefix,
        value: &Val,
        insert_time: i64,
        overwrite: bool,
    ) -> Result<bool> {
        let mut encoded = Vec::new();
        self.keys.encode(txn, key, &mut encoded)?;
        let value = self.values.encode(txn, insert_time, value)?;
        if overwrite {
            txn.put(self.core.data(), &encoded, &value)?;
            Ok(true)
        } else {
            txn.put_if_absent(self.core.data(), &encoded, &value)
        }
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &KeyPrefix) -> Result<Option<Val>> {
        let txn = self.core.env().begin_read();
        let mut encoded = Vec::new();
        if !self.keys.encode_existing(&txn, key, &mut encoded)? {
            return Ok(None);
        }
        match txn.get(self.core.data(), &encoded)? {
            Some(value) => Ok(Some(self.values.decode(&txn, &value)?)),
            None => Ok(None),
        }
    }

    fn decode_entry(&self, txn: &dyn Txn, key: &[u8], value: &[u8]) -> Result<StateEntry> {
        Ok(StateEntry {
            key: self.keys.decode(txn, &mut Reader::new(key))?,
            value: self.values.decode(txn, value)?,
            insert_time: ValueCodec::insert_time(value)?,
        })
    }

    /// Every row in key order.
    pub fn entries(&self) -> Result<Vec<StateEntry>> {
        let txn = self.core.env().begin_read();
        txn.iter(self.core.data())
            .map(|entry| {
                let (key, value) = entry?;
                self.decode_entry(&txn, &key, &value)
            })
            .collect()
    }
}

impl PlanBDb for StateDb {
    fn state_type(&self) -> StateType {
        StateType::State
    }

    fn core(&self) -> &DbCore {
        &self.core
    }

    fn merge_part(&self, source: &Path, hash: Option<&str>) -> Result<bool> {
        self.core.merge_from(
            source,
            hash,
            |path, options| StateDb::open(path, self.settings.clone(), options),
            |txn, src| {
                let src_txn = src.core.env().begin_read();
                let mut rows = 0;
                for entry in src_txn.iter(src.core.data()) {
                    let (key, value) = entry?;
                    let row = src.decode_entry(&src_txn, &key, &value)?;
                    self.put_row(txn, &row.key, &row.value, row.insert_time, true)?;
                    rows += 1;
                }
                Ok(rows)
            },
        )
    }

    fn delete_old_data(&self, before: i64, _use_state_time: bool) -> Result<u64> {
        self.core.delete_where(Some(&self.keys), Some(&self.values), |_, value| {
            Ok(ValueCodec::insert_time(value)? < before)
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
