//! Per-map settings and the schema recorded in every shard.
//!
//! Settings come from the document store ([`PlanBDoc`]) and are immutable for
//! the lifetime of an open shard. Every settings record serializes to JSON;
//! the key and value schema JSON is written into the shard as [`SchemaInfo`]
//! and compared whenever two shards are merged.

use crate::config::DEFAULT_MAX_STORE_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which engine variant a map uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    /// Key to value
    #[default]
    State,
    /// Key and time to value
    TemporalState,
    /// Numeric range to value, inserts overwrite
    RangeState,
    /// Numeric range to value, inserts never overwrite
    RangedState,
    /// Numeric range and time to value, inserts overwrite
    TemporalRangeState,
    /// Numeric range and time to value, inserts never overwrite
    TemporalRangedState,
    /// Key to time intervals
    Session,
    /// Tags and time bucket to count
    Histogram,
    /// Tags and time bucket to aggregate
    Metric,
    /// Trace spans
    Trace,
}

/// Key encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    /// One byte, 0 or 1
    Boolean,
    /// Sortable 8-bit integer
    Byte,
    /// Sortable 16-bit integer
    Short,
    /// Sortable 32-bit integer
    Int,
    /// Sortable 64-bit integer
    Long,
    /// Sortable 32-bit float
    Float,
    /// Sortable 64-bit float
    Double,
    /// Escaped, terminated string
    String,
    /// 4 byte surrogate id
    UidLookup,
    /// Content hash plus collision counter
    HashLookup,
    /// Most compact encoding for each value
    #[default]
    Variable,
    /// Tag set through a surrogate id
    Tags,
}

/// Value encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    /// One byte, 0 or 1
    Boolean,
    /// 8-bit integer
    Byte,
    /// 16-bit integer
    Short,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// UTF-8 string
    String,
    /// 4 byte surrogate id
    UidLookup,
    /// Content hash plus collision counter
    HashLookup,
    /// Typed inline value, spilled to a lookup above `max_value_size`
    #[default]
    Variable,
}

/// Width of the hash used by hash lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HashLength {
    /// Low 32 bits of xxh3-64
    Integer,
    /// Full xxh3-64
    #[default]
    Long,
}

impl HashLength {
    /// Hash width in bytes.
    pub fn len(self) -> usize {
        match self {
            HashLength::Integer => 4,
            HashLength::Long => 8,
        }
    }
}

/// Granularity that times are truncated to before they become part of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemporalResolution {
    /// No truncation
    Millisecond,
    /// Whole seconds
    #[default]
    Second,
    /// Whole minutes
    Minute,
    /// Whole hours
    Hour,
    /// Whole days (UTC)
    Day,
}

impl TemporalResolution {
    /// Length of one bucket in milliseconds.
    pub fn millis(self) -> i64 {
        match self {
            TemporalResolution::Millisecond => 1,
            TemporalResolution::Second => 1_000,
            TemporalResolution::Minute => 60_000,
            TemporalResolution::Hour => 3_600_000,
            TemporalResolution::Day => 86_400_000,
        }
    }

    /// Truncates epoch milliseconds to the start of their bucket.
    pub fn truncate(self, millis: i64) -> i64 {
        millis - millis.rem_euclid(self.millis())
    }
}

/// Width of range bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeType {
    /// 8-bit bounds
    Byte,
    /// 16-bit bounds
    Short,
    /// 32-bit bounds
    Int,
    /// 64-bit bounds
    #[default]
    Long,
}

impl RangeType {
    /// Encoded width of one bound in bytes.
    pub fn width(self) -> usize {
        match self {
            RangeType::Byte => 1,
            RangeType::Short => 2,
            RangeType::Int => 4,
            RangeType::Long => 8,
        }
    }

    /// Whether `v` is representable.
    pub fn fits(self, v: i64) -> bool {
        match self {
            RangeType::Byte => i8::try_from(v).is_ok(),
            RangeType::Short => i16::try_from(v).is_ok(),
            RangeType::Int => i32::try_from(v).is_ok(),
            RangeType::Long => true,
        }
    }
}

/// Default inline limit for values.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 4096;

/// How long data is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Whether old data is deleted at all
    pub enabled: bool,
    /// Age after which data is deleted
    pub duration: Duration,
    /// Age by the data's own time instead of its insert time
    pub use_state_time: bool,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self { enabled: false, duration: Duration::from_secs(365 * 86_400), use_state_time: false }
    }
}

impl RetentionSettings {
    /// Enabled retention of `duration`.
    pub fn enabled(duration: Duration) -> Self {
        Self { enabled: true, duration, use_state_time: false }
    }

    /// Ages data by its own time.
    pub fn use_state_time(mut self, value: bool) -> Self {
        self.use_state_time = value;
        self
    }
}

/// When history is condensed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CondenseSettings {
    /// Whether history is condensed at all
    pub enabled: bool,
    /// Age after which history is condensed
    pub duration: Duration,
}

impl Default for CondenseSettings {
    fn default() -> Self {
        Self { enabled: false, duration: Duration::from_secs(86_400) }
    }
}

impl CondenseSettings {
    /// Enabled condensing of history older than `duration`.
    pub fn enabled(duration: Duration) -> Self {
        Self { enabled: true, duration }
    }
}

/// Key schema for plain keys.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateKeySchema {
    /// Key encoding
    pub key_type: KeyType,
    /// Hash width for hash lookups
    pub hash_length: HashLength,
}

impl StateKeySchema {
    /// Schema for `key_type`.
    pub fn new(key_type: KeyType) -> Self {
        Self { key_type, hash_length: HashLength::default() }
    }

    /// Sets the hash width.
    pub fn hash_length(mut self, hash_length: HashLength) -> Self {
        self.hash_length = hash_length;
        self
    }
}

/// Key schema for keys combined with a time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalKeySchema {
    /// Key encoding
    pub key_type: KeyType,
    /// Hash width for hash lookups
    pub hash_length: HashLength,
    /// Truncation applied to times
    pub temporal_resolution: TemporalResolution,
}

impl TemporalKeySchema {
    /// Schema for `key_type`.
    pub fn new(key_type: KeyType) -> Self {
        Self { key_type, ..Self::default() }
    }

    /// Sets the hash width.
    pub fn hash_length(mut self, hash_length: HashLength) -> Self {
        self.hash_length = hash_length;
        self
    }

    /// Sets the temporal resolution.
    pub fn temporal_resolution(mut self, resolution: TemporalResolution) -> Self {
        self.temporal_resolution = resolution;
        self
    }
}

fn tags_key_schema() -> TemporalKeySchema {
    TemporalKeySchema::new(KeyType::Tags)
}

/// Key schema for numeric ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeKeySchema {
    /// Width of the bounds
    pub range_type: RangeType,
}

/// Key schema for numeric ranges combined with a time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalRangeKeySchema {
    /// Width of the bounds
    pub range_type: RangeType,
    /// Truncation applied to times
    pub temporal_resolution: TemporalResolution,
}

/// Value schema for state-like variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueSchema {
    /// Value encoding
    pub value_type: ValueType,
    /// Hash width for hash lookups
    pub hash_length: HashLength,
    /// Largest value stored inline
    pub max_value_size: usize,
}

impl Default for ValueSchema {
    fn default() -> Self {
        Self {
            value_type: ValueType::default(),
            hash_length: HashLength::default(),
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }
}

impl ValueSchema {
    /// Schema for `value_type`.
    pub fn new(value_type: ValueType) -> Self {
        Self { value_type, ..Self::default() }
    }

    /// Sets the hash width.
    pub fn hash_length(mut self, hash_length: HashLength) -> Self {
        self.hash_length = hash_length;
        self
    }

    /// Sets the inline limit.
    pub fn max_value_size(mut self, size: usize) -> Self {
        self.max_value_size = size;
        self
    }
}

macro_rules! common_setters {
    ($ty:ty) => {
        impl $ty {
            /// Sets the maximum store size.
            pub fn max_store_size(mut self, size: u64) -> Self {
                self.max_store_size = size;
                self
            }

            /// Sets whether inserts replace existing entries.
            pub fn overwrite(mut self, value: bool) -> Self {
                self.overwrite = value;
                self
            }

            /// Sets the retention policy.
            pub fn retention(mut self, retention: RetentionSettings) -> Self {
                self.retention = retention;
                self
            }
        }
    };
}

macro_rules! condense_setter {
    ($ty:ty) => {
        impl $ty {
            /// Sets the condense policy.
            pub fn condense(mut self, condense: CondenseSettings) -> Self {
                self.condense = condense;
                self
            }
        }
    };
}

macro_rules! settings_struct {
    (
        $(#[$meta:meta])*
        $name:ident {
            key_schema: $key:ty = $key_default:expr,
            $( value_schema: $value:ty, )?
            $( condense: $condense:ident, )?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $name {
            /// Upper bound on the shard's size in bytes
            pub max_store_size: u64,
            /// Whether inserts replace existing entries
            pub overwrite: bool,
            /// Retention policy
            pub retention: RetentionSettings,
            $(
                #[doc = concat!("History condensing (", stringify!($condense), ")")]
                pub condense: CondenseSettings,
            )?
            /// Key schema
            pub key_schema: $key,
            $(
                /// Value schema
                pub value_schema: $value,
            )?
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    max_store_size: DEFAULT_MAX_STORE_SIZE,
                    overwrite: true,
                    retention: RetentionSettings::default(),
                    $( condense: { let _ = stringify!($condense); CondenseSettings::default() }, )?
                    key_schema: $key_default,
                    $( value_schema: <$value>::default(), )?
                }
            }
        }

        impl $name {
            /// Settings with default values.
            pub fn new() -> Self {
                Self::default()
            }

            /// Sets the key schema.
            pub fn key_schema(mut self, key_schema: $key) -> Self {
                self.key_schema = key_schema;
                self
            }

            $(
                /// Sets the value schema.
                pub fn value_schema(mut self, value_schema: $value) -> Self {
                    self.value_schema = value_schema;
                    self
                }
            )?
        }

        common_setters!($name);
    };
}

settings_struct! {
    /// Settings for [`StateType::State`].
    StateSettings {
        key_schema: StateKeySchema = StateKeySchema::default(),
        value_schema: ValueSchema,
    }
}

settings_struct! {
    /// Settings for [`StateType::TemporalState`].
    TemporalStateSettings {
        key_schema: TemporalKeySchema = TemporalKeySchema::default(),
        value_schema: ValueSchema,
        condense: temporal,
    }
}

settings_struct! {
    /// Settings for [`StateType::RangeState`] and [`StateType::RangedState`].
    RangeStateSettings {
        key_schema: RangeKeySchema = RangeKeySchema::default(),
        value_schema: ValueSchema,
    }
}

settings_struct! {
    /// Settings for the temporal range variants.
    TemporalRangeStateSettings {
        key_schema: TemporalRangeKeySchema = TemporalRangeKeySchema::default(),
        value_schema: ValueSchema,
        condense: temporal,
    }
}

settings_struct! {
    /// Settings for [`StateType::Session`].
    SessionSettings {
        key_schema: TemporalKeySchema = TemporalKeySchema::default(),
        condense: sessions,
    }
}

settings_struct! {
    /// Settings for [`StateType::Histogram`].
    HistogramSettings {
        key_schema: TemporalKeySchema = tags_key_schema(),
    }
}

settings_struct! {
    /// Settings for [`StateType::Metric`].
    MetricSettings {
        key_schema: TemporalKeySchema = tags_key_schema(),
    }
}

settings_struct! {
    /// Settings for [`StateType::Trace`].
    TraceSettings {
        key_schema: StateKeySchema = StateKeySchema::default(),
    }
}

condense_setter!(TemporalStateSettings);
condense_setter!(TemporalRangeStateSettings);
condense_setter!(SessionSettings);

/// Settings of one map, whichever variant it uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Settings {
    /// Plain state
    State(StateSettings),
    /// Temporal state
    TemporalState(TemporalStateSettings),
    /// Range and ranged state
    RangeState(RangeStateSettings),
    /// Temporal range and temporal ranged state
    TemporalRangeState(TemporalRangeStateSettings),
    /// Sessions
    Session(SessionSettings),
    /// Histograms
    Histogram(HistogramSettings),
    /// Metrics
    Metric(MetricSettings),
    /// Traces
    Trace(TraceSettings),
}

impl Settings {
    /// Default settings for `state_type`.
    pub fn default_for(state_type: StateType) -> Self {
        match state_type {
            StateType::State => Settings::State(StateSettings::default()),
            StateType::TemporalState => Settings::TemporalState(TemporalStateSettings::default()),
            StateType::RangeState | StateType::RangedState => {
                Settings::RangeState(RangeStateSettings::default())
            }
            StateType::TemporalRangeState | StateType::TemporalRangedState => {
                Settings::TemporalRangeState(TemporalRangeStateSettings::default())
            }
            StateType::Session => Settings::Session(SessionSettings::default()),
            StateType::Histogram => Settings::Histogram(HistogramSettings::default()),
            StateType::Metric => Settings::Metric(MetricSettings::default()),
            StateType::Trace => Settings::Trace(TraceSettings::default()),
        }
    }

    /// Whether these settings can drive `state_type`.
    pub fn supports(&self, state_type: StateType) -> bool {
        matches!(
            (self, state_type),
            (Settings::State(_), StateType::State)
                | (Settings::TemporalState(_), StateType::TemporalState)
                | (Settings::RangeState(_), StateType::RangeState | StateType::RangedState)
                | (
                    Settings::TemporalRangeState(_),
                    StateType::TemporalRangeState | StateType::TemporalRangedState
                )
                | (Settings::Session(_), StateType::Session)
                | (Settings::Histogram(_), StateType::Histogram)
                | (Settings::Metric(_), StateType::Metric)
                | (Settings::Trace(_), StateType::Trace)
        )
    }

    /// Upper bound on the shard's size in bytes.
    pub fn max_store_size(&self) -> u64 {
        match self {
            Settings::State(s) => s.max_store_size,
            Settings::TemporalState(s) => s.max_store_size,
            Settings::RangeState(s) => s.max_store_size,
            Settings::TemporalRangeState(s) => s.max_store_size,
            Settings::Session(s) => s.max_store_size,
            Settings::Histogram(s) => s.max_store_size,
            Settings::Metric(s) => s.max_store_size,
            Settings::Trace(s) => s.max_store_size,
        }
    }

    /// Whether inserts replace existing entries.
    pub fn overwrite(&self) -> bool {
        match self {
            Settings::State(s) => s.overwrite,
            Settings::TemporalState(s) => s.overwrite,
            Settings::RangeState(s) => s.overwrite,
            Settings::TemporalRangeState(s) => s.overwrite,
            Settings::Session(s) => s.overwrite,
            Settings::Histogram(s) => s.overwrite,
            Settings::Metric(s) => s.overwrite,
            Settings::Trace(s) => s.overwrite,
        }
    }

    /// Retention policy.
    pub fn retention(&self) -> &RetentionSettings {
        match self {
            Settings::State(s) => &s.retention,
            Settings::TemporalState(s) => &s.retention,
            Settings::RangeState(s) => &s.retention,
            Settings::TemporalRangeState(s) => &s.retention,
            Settings::Session(s) => &s.retention,
            Settings::Histogram(s) => &s.retention,
            Settings::Metric(s) => &s.retention,
            Settings::Trace(s) => &s.retention,
        }
    }

    /// Condense policy, for the variants that condense.
    pub fn condense(&self) -> Option<&CondenseSettings> {
        match self {
            Settings::TemporalState(s) => Some(&s.condense),
            Settings::TemporalRangeState(s) => Some(&s.condense),
            Settings::Session(s) => Some(&s.condense),
            _ => None,
        }
    }

    /// Key schema as JSON.
    pub fn key_schema_json(&self) -> Result<String> {
        Ok(match self {
            Settings::State(s) => serde_json::to_string(&s.key_schema)?,
            Settings::TemporalState(s) => serde_json::to_string(&s.key_schema)?,
            Settings::RangeState(s) => serde_json::to_string(&s.key_schema)?,
            Settings::TemporalRangeState(s) => serde_json::to_string(&s.key_schema)?,
            Settings::Session(s) => serde_json::to_string(&s.key_schema)?,
            Settings::Histogram(s) => serde_json::to_string(&s.key_schema)?,
            Settings::Metric(s) => serde_json::to_string(&s.key_schema)?,
            Settings::Trace(s) => serde_json::to_string(&s.key_schema)?,
        })
    }

    /// Value schema as JSON; variants with a fixed value layout use `{}`.
    pub fn value_schema_json(&self) -> Result<String> {
        Ok(match self {
            Settings::State(s) => serde_json::to_string(&s.value_schema)?,
            Settings::TemporalState(s) => serde_json::to_string(&s.value_schema)?,
            Settings::RangeState(s) => serde_json::to_string(&s.value_schema)?,
            Settings::TemporalRangeState(s) => serde_json::to_string(&s.value_schema)?,
            _ => "{}".to_string(),
        })
    }
}

/// A map's configuration document, as supplied by the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBDoc {
    /// Map UUID; names the shard directory
    pub uuid: String,
    /// Map name
    pub name: String,
    /// Engine variant
    pub state_type: StateType,
    /// Variant settings
    pub settings: Settings,
}

impl PlanBDoc {
    /// Creates a document, checking that `settings` fit `state_type`.
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        state_type: StateType,
        settings: Settings,
    ) -> Result<Self> {
        let doc = Self { uuid: uuid.into(), name: name.into(), state_type, settings };
        doc.validate()?;
        Ok(doc)
    }

    /// Creates a document with default settings for `state_type`.
    pub fn with_defaults(uuid: impl Into<String>, name: impl Into<String>, state_type: StateType) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            state_type,
            settings: Settings::default_for(state_type),
        }
    }

    /// Validates the document.
    pub fn validate(&self) -> Result<()> {
        if self.uuid.is_empty() {
            return Err(Error::invalid_argument("document uuid must not be empty"));
        }
        if !self.settings.supports(self.state_type) {
            return Err(Error::invalid_argument(format!(
                "settings of map {:?} do not fit state type {:?}",
                self.name, self.state_type
            )));
        }
        if self.settings.max_store_size() == 0 {
            return Err(Error::invalid_argument("max_store_size must be > 0"));
        }
        Ok(())
    }
}

/// Schema recorded in each shard's `info` sub-database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    /// Layout version of the variant
    pub schema_version: u32,
    /// Key schema JSON
    pub key_schema: String,
    /// Value schema JSON
    pub value_schema: String,
    /// Hash algorithm behind hash lookups
    pub hash: String,
}

/// Name of the hash algorithm recorded in [`SchemaInfo::hash`].
pub const HASH_ALGORITHM: &str = "xxh3-64";

impl SchemaInfo {
    /// Schema of `settings` at `schema_version`.
    pub fn new(schema_version: u32, settings: &Settings) -> Result<Self> {
        Ok(Self {
            schema_version,
            key_schema: settings.key_schema_json()?,
            value_schema: settings.value_schema_json()?,
            hash: HASH_ALGORITHM.to_string(),
        })
    }

    /// Fails with [`Error::SchemaMismatch`] unless `other` is identical.
    pub fn validate(&self, other: &SchemaInfo) -> Result<()> {
        if self != other {
            return Err(Error::schema_mismatch(format!(
                "expected version {} key {} value {}, found version {} key {} value {}",
                self.schema_version,
                self.key_schema,
                self.value_schema,
                other.schema_version,
                other.key_schema,
                other.value_schema
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(TemporalResolution::Second.truncate(1_999), 1_000);
        assert_eq!(TemporalResolution::Minute.truncate(61_000), 60_000);
        assert_eq!(TemporalResolution::Second.truncate(-1), -1_000);
        assert_eq!(TemporalResolution::Millisecond.truncate(17), 17);
    }

    #[test]
    fn test_settings_json() {
        let settings = Settings::State(
            StateSettings::new()
                .max_store_size(1024)
                .key_schema(StateKeySchema::new(KeyType::Int))
                .retention(RetentionSettings::enabled(Duration::ZERO)),
        );
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"type\":\"State\""));
        assert!(json.contains("\"key_type\":\"INT\""));
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);

        let sparse: Settings = serde_json::from_str(r#"{"type":"Histogram"}"#).unwrap();
        assert_eq!(sparse, Settings::Histogram(HistogramSettings::default()));
        assert!(matches!(&sparse, Settings::Histogram(h) if h.key_schema.key_type == KeyType::Tags));
    }

    #[test]
    fn test_doc_validation() {
        let doc = PlanBDoc::with_defaults("uuid", "map", StateType::RangedState);
        assert!(matches!(doc.settings, Settings::RangeState(_)));
        assert!(doc.validate().is_ok());

        let err = PlanBDoc::new("uuid", "map", StateType::Session, Settings::default_for(StateType::State));
        assert!(err.is_err());
    }

    #[test]
    fn test_schema_mismatch() {
        let a = SchemaInfo::new(1, &Settings::default_for(StateType::State)).unwrap();
        let b = SchemaInfo::new(
            1,
            &Settings::State(StateSettings::new().key_schema(StateKeySchema::new(KeyType::Long))),
        )
        .unwrap();
        assert!(a.validate(&a.clone()).is_ok());
        assert!(matches!(a.validate(&b), Err(Error::SchemaMismatch(_))));
    }
}
