//! Distributed trace spans.
//!
//! Spans are keyed by `trace id (16) ++ span id (8) ++ parent span id (8)`,
//! so one trace is a contiguous key range. Root spans, those without a
//! parent, are also recorded in the `trace-roots` sub-database to page
//! through traces without scanning every span.

use crate::config::EnvOptions;
use crate::db::{now_millis, DbCore, PlanBDb};
use crate::env::{Db, Txn, WriteTxn};
use crate::error::{Error, Result};
use crate::query::{fields, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, Row, Search, TimeFilter};
use crate::settings::{Settings, StateType, TraceSettings};
use crate::val::Val;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::Path;

/// Layout version of trace shards.
pub const SCHEMA_VERSION: u32 = 1;

/// Sub-database of root spans.
pub const TRACE_ROOTS_DB: &str = "trace-roots";

const TRACE_ID_LEN: usize = 16;
const SPAN_ID_LEN: usize = 8;
const KEY_LEN: usize = TRACE_ID_LEN + 2 * SPAN_ID_LEN;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// A span. Ids are lowercase hex; a root span has an empty parent id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// 32 hex digits
    pub trace_id: String,
    /// 16 hex digits
    pub span_id: String,
    /// 16 hex digits, or empty for a root span
    pub parent_span_id: String,
    /// Operation name
    pub name: String,
    /// Span kind, e.g. `SERVER`
    pub kind: String,
    /// Start, epoch nanoseconds
    pub start_nanos: i64,
    /// End, epoch nanoseconds
    pub end_nanos: i64,
    /// Attributes in insertion order
    pub attributes: Vec<(String, Val)>,
}

impl Span {
    /// Whether this span starts a trace.
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct SpanValue {
    name: String,
    kind: String,
    start_nanos: i64,
    end_nanos: i64,
    attributes: Vec<(String, Val)>,
}

/// Summary of a trace kept for its root span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRoot {
    /// Trace id
    pub trace_id: String,
    /// Name of the root span
    pub name: String,
    /// Root start, epoch nanoseconds
    pub start_nanos: i64,
    /// Root end, epoch nanoseconds
    pub end_nanos: i64,
}

/// All spans of one trace.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trace {
    /// Trace id
    pub trace_id: String,
    /// Spans grouped by parent span id (empty for roots), each group sorted
    /// by start
    pub children: BTreeMap<String, Vec<Span>>,
}

impl Trace {
    /// Root spans.
    pub fn roots(&self) -> &[Span] {
        self.children.get("").map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of spans.
    pub fn span_count(&self) -> usize {
        self.children.values().map(Vec::len).sum()
    }
}

/// One page of trace roots.
#[derive(Debug, Clone, PartialEq)]
pub struct TracePage {
    /// Roots on this page
    pub roots: Vec<TraceRoot>,
    /// Offset of the first root
    pub offset: u64,
    /// Total number of roots
    pub total: u64,
}

struct SpanRow {
    span: Span,
    insert_time: i64,
}

impl Row for SpanRow {
    fn field(&self, name: &str) -> Val {
        match name {
            fields::TRACE_ID => Val::string(&self.span.trace_id),
            fields::SPAN_ID => Val::string(&self.span.span_id),
            fields::PARENT_SPAN_ID => Val::string(&self.span.parent_span_id),
            fields::NAME => Val::string(&self.span.name),
            fields::START => Val::Date(self.span.start_nanos / NANOS_PER_MILLI),
            fields::END => Val::Date(self.span.end_nanos / NANOS_PER_MILLI),
            fields::INSERT_TIME => Val::Date(self.insert_time),
            _ => Val::Null,
        }
    }

    fn time(&self) -> Option<i64> {
        Some(self.span.start_nanos / NANOS_PER_MILLI)
    }
}

fn decode_id(id: &str, len: usize, what: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(id).map_err(|e| Error::validation(format!("{} {:?} is not hex: {}", what, id, e)))?;
    if bytes.len() != len {
        return Err(Error::validation(format!("{} {:?} is not {} bytes", what, id, len)));
    }
    Ok(bytes)
}

fn span_key(span: &Span) -> Result<Vec<u8>> {
    let mut key = decode_id(&span.trace_id, TRACE_ID_LEN, "trace id")?;
    key.extend(decode_id(&span.span_id, SPAN_ID_LEN, "span id")?);
    if span.is_root() {
        key.extend([0u8; SPAN_ID_LEN]);
    } else {
        key.extend(decode_id(&span.parent_span_id, SPAN_ID_LEN, "parent span id")?);
    }
    Ok(key)
}

fn decode_span(key: &[u8], value: &[u8]) -> Result<SpanRow> {
    if key.len() != KEY_LEN || value.len() < 8 {
        return Err(Error::corruption("malformed span row"));
    }
    let (time, body) = value.split_at(8);
    let mut insert_time = [0u8; 8];
    insert_time.copy_from_slice(time);
    let value: SpanValue = bincode::deserialize(body)?;
    let parent = &key[TRACE_ID_LEN + SPAN_ID_LEN..];
    Ok(SpanRow {
        span: Span {
            trace_id: hex::encode(&key[..TRACE_ID_LEN]),
            span_id: hex::encode(&key[TRACE_ID_LEN..TRACE_ID_LEN + SPAN_ID_LEN]),
            parent_span_id: if parent.iter().all(|b| *b == 0) { String::new() } else { hex::encode(parent) },
            name: value.name,
            kind: value.kind,
            start_nanos: value.start_nanos,
            end_nanos: value.end_nanos,
            attributes: value.attributes,
        },
        insert_time: i64::from_be_bytes(insert_time),
    })
}

/// Trace shard.
#[derive(Debug, Clone)]
pub struct TraceDb {
    core: DbCore,
    settings: TraceSettings,
    roots: Db,
}

impl TraceDb {
    /// Opens the shard at `path`.
    pub fn open(path: &Path, settings: TraceSettings, options: &EnvOptions) -> Result<Self> {
        let core = DbCore::open(path, StateType::Trace, Settings::Trace(settings.clone()), SCHEMA_VERSION, options)?;
        let roots = core.env().open_db(TRACE_ROOTS_DB)?;
        Ok(Self { core, settings, roots })
    }

    /// Stores `span`; a root span also records its trace.
    pub fn insert_span(&self, txn: &mut WriteTxn<'_>, span: &Span) -> Result<()> {
        self.put_span(txn, span, now_millis())
    }

    fn put_span(&self, txn: &mut WriteTxn<'_>, span: &Span, insert_time: i64) -> Result<()> {
        let key = span_key(span)?;
        let mut value = insert_time.to_be_bytes().to_vec();
        bincode::serialize_into(
            &mut value,
            &SpanValue {
                name: span.name.clone(),
                kind: span.kind.clone(),
                start_nanos: span.start_nanos,
                end_nanos: span.end_nanos,
                attributes: span.attributes.clone(),
            },
        )?;
        txn.put(self.core.data(), &key, &value)?;

        if span.is_root() {
            let root = TraceRoot {
                trace_id: span.trace_id.clone(),
                name: span.name.clone(),
                start_nanos: span.start_nanos,
                end_nanos: span.end_nanos,
            };
            txn.put(self.roots, &key[..TRACE_ID_LEN], &bincode::serialize(&root)?)?;
        }
        Ok(())
    }

    /// Every span of `trace_id`.
    pub fn get_trace(&self, trace_id: &str) -> Result<Trace> {
        let prefix = decode_id(trace_id, TRACE_ID_LEN, "trace id")?;
        let txn = self.core.env().begin_read();
        let mut trace = Trace { trace_id: hex::encode(&prefix), children: BTreeMap::new() };
        for entry in txn.prefix(self.core.data(), &prefix) {
            let (key, value) = entry?;
            let span = decode_span(&key, &value)?.span;
            trace.children.entry(span.parent_span_id.clone()).or_default().push(span);
        }
        for spans in trace.children.values_mut() {
            spans.sort_by_key(|s| s.start_nanos);
        }
        Ok(trace)
    }

    /// Up to `length` trace roots starting at `offset`, in trace id order.
    pub fn find_traces(&self, offset: u64, length: usize) -> Result<TracePage> {
        let txn = self.core.env().begin_read();
        let mut roots = Vec::new();
        let mut total = 0u64;
        for entry in txn.iter(self.roots) {
            let (_, value) = entry?;
            if total >= offset && roots.len() < length {
                roots.push(bincode::deserialize(&value)?);
            }
            total += 1;
        }
        Ok(TracePage { roots, offset, total })
    }
}

impl PlanBDb for TraceDb {
    fn state_type(&self) -> StateType {
        StateType::Trace
    }

    fn core(&self) -> &DbCore {
        &self.core
    }

    /// Unions the source's spans and roots into this shard. Re-inserting an
    /// identical span leaves one copy.
    fn merge_part(&self, source: &Path, hash: Option<&str>) -> Result<bool> {
        self.core.merge_from(
            source,
            hash,
            |path, options| TraceDb::open(path, self.settings.clone(), options),
            |txn, src| {
                let src_txn = src.core.env().begin_read();
                let mut rows = 0;
                for entry in src_txn.iter(src.core.data()) {
                    let (key, value) = entry?;
                    let row = decode_span(&key, &value)?;
                    self.put_span(txn, &row.span, row.insert_time)?;
                    rows += 1;
                }
                for entry in src_txn.iter(src.roots) {
                    let (key, value) = entry?;
                    txn.put(self.roots, &key, &value)?;
                }
                Ok(rows)
            },
        )
    }

    /// Deletes spans inserted before `before` and roots of traces that
    /// started before it.
    fn delete_old_data(&self, before: i64, _use_state_time: bool) -> Result<u64> {
        let (data, roots) = (self.core.data(), self.roots);
        let deleted = self.core.env().write(|txn| {
            let mut deleted = 0;
            for entry in txn.iter(data) {
                let (key, value) = entry?;
                if decode_span(&key, &value)?.insert_time < before {
                    txn.delete(data, &key)?;
                    deleted += 1;
                }
            }
            for entry in txn.iter(roots) {
                let (key, value) = entry?;
                let root: TraceRoot = bincode::deserialize(&value)?;
                if root.start_nanos / NANOS_PER_MILLI < before {
                    txn.delete(roots, &key)?;
                    deleted += 1;
                }
            }
            Ok(deleted)
        })?;
        if deleted > 0 {
            log::info!("Deleted {} old spans and roots from {:?}", deleted, self.core.env().path());
        }
        Ok(deleted)
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
            if search.accept(&decode_span(&key, &value)?).is_break() {
                break;
            }
        }
        Ok(())
    }
}
