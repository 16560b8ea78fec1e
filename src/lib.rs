//! # PlanB - embedded state storage
//!
//! PlanB stores reference and time-series state in shards: one embedded,
//! memory-mapped environment per map. Each map uses one engine variant,
//! specialised for the shape of its keys and values:
//!
//! - **State**: key to value
//! - **Temporal state**: key and effective time to value
//! - **Range / ranged state**: numeric range to value
//! - **Temporal range / ranged state**: numeric range and time to value
//! - **Session**: key to activity intervals
//! - **Histogram / Metric**: tag set and time bucket to an additive aggregate
//! - **Trace**: distributed trace spans
//!
//! ## Architecture
//!
//! - **Env**: the shard substrate; named sub-databases, one writer, MVCC
//!   readers, a write-ahead log and memory-mapped tables
//! - **Codec**: order-preserving key encoding, with UID and hash lookup
//!   tables for long content
//! - **Variants**: one [`PlanBDb`] implementation per shape, dispatched by
//!   [`ShardDb`]
//! - **ShardManager**: opens, caches, snapshots and maintains shards
//! - **MergeProcessor**: queues part archives and merges them into shards
//!
//! ## Example
//!
//! ```rust,no_run
//! use planb::db::StateDb;
//! use std::path::Path;
//! use planb::{EnvOptions, KeyPrefix, PlanBDb, StateSettings, Val};
//!
//! # fn main() -> planb::Result<()> {
//! let db = StateDb::open(Path::new("./shard"), StateSettings::new(), &EnvOptions::default())?;
//! let key = KeyPrefix::new("TEST_KEY");
//! db.write(|txn| db.insert(txn, &key, &Val::string("value")))?;
//! assert_eq!(db.get(&key)?, Some(Val::string("value")));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod archive;
pub mod codec;
pub mod config;
pub mod context;
pub mod db;
pub mod env;
pub mod error;
pub mod lookup;
pub mod merge_processor;
pub mod query;
pub mod settings;
pub mod shard_manager;
pub mod val;

pub use codec::{KeyPrefix, Tag};
pub use config::{CompressionType, EnvOptions, PlanBConfig};
pub use context::{
    DocStore, MemoryDocStore, NoSecurity, SecurityContext, SimpleTaskContext, SimpleTaskContextFactory, TaskContext,
    TaskContextFactory,
};
pub use db::{PlanBDb, ShardDb};
pub use env::{Env, ReadTxn, Txn, WriteTxn};
pub use error::{Error, Result};
pub use merge_processor::{FileDescriptor, MergeProcessor, MergeSummary};
pub use query::{Expression, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, TimeFilter};
pub use settings::{
    HistogramSettings, MetricSettings, PlanBDoc, RangeStateSettings, SessionSettings, Settings, StateSettings,
    StateType, TemporalRangeStateSettings, TemporalStateSettings, TraceSettings,
};
pub use shard_manager::{ShardManager, StatePaths};
pub use val::Val;
