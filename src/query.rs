//! Predicate-driven scans.
//!
//! A search walks a shard's primary data in key order, decodes each row,
//! projects the fields named by a [`FieldIndex`] into a `Vec<Val>`, tests it
//! against the predicate compiled from an [`ExpressionCriteria`], and hands
//! matches to a consumer. The consumer returns [`ControlFlow::Break`] to stop
//! the scan early.

use crate::error::{Error, Result};
use crate::val::Val;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::ControlFlow;

/// Field names produced by the engine variants.
pub mod fields {
    /// Key value, or rendered tags
    pub const KEY: &str = "Key";
    /// Type name of the value
    pub const VALUE_TYPE: &str = "ValueType";
    /// Stored value
    pub const VALUE: &str = "Value";
    /// Time the row was written
    pub const INSERT_TIME: &str = "InsertTime";
    /// Effective time of temporal rows
    pub const EFFECTIVE_TIME: &str = "EffectiveTime";
    /// Lower range bound
    pub const KEY_START: &str = "KeyStart";
    /// Upper range bound
    pub const KEY_END: &str = "KeyEnd";
    /// Session or span start
    pub const START: &str = "Start";
    /// Session or span end
    pub const END: &str = "End";
    /// Histogram and metric bucket time
    pub const TIME: &str = "Time";
    /// Histogram count or metric sample count
    pub const COUNT: &str = "Count";
    /// Metric minimum
    pub const MIN: &str = "Min";
    /// Metric maximum
    pub const MAX: &str = "Max";
    /// Metric sum
    pub const SUM: &str = "Sum";
    /// Metric average
    pub const AVERAGE: &str = "Average";
    /// Metric latest sample
    pub const LATEST: &str = "Latest";
    /// Trace id (hex)
    pub const TRACE_ID: &str = "TraceId";
    /// Span id (hex)
    pub const SPAN_ID: &str = "SpanId";
    /// Parent span id (hex)
    pub const PARENT_SPAN_ID: &str = "ParentSpanId";
    /// Span name
    pub const NAME: &str = "Name";
}

/// Maps field names to positions in a result row.
#[derive(Debug, Clone, Default)]
pub struct FieldIndex {
    fields: Vec<String>,
    positions: HashMap<String, usize>,
}

impl FieldIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// An index over `names`, in order.
    pub fn with_fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut index = Self::new();
        for name in names {
            index.create(name);
        }
        index
    }

    /// Position of `name`, adding it at the end if absent.
    pub fn create(&mut self, name: impl Into<String>) -> usize {
        let name = name.into();
        if let Some(pos) = self.positions.get(&name) {
            return *pos;
        }
        let pos = self.fields.len();
        self.positions.insert(name.clone(), pos);
        self.fields.push(name);
        pos
    }

    /// Position of `name`.
    pub fn get(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// Field names in position order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field is indexed.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A test applied to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Field equals the value
    Equals(Val),
    /// Field differs from the value
    NotEquals(Val),
    /// Field is greater than the value
    GreaterThan(Val),
    /// Field is greater than or equal to the value
    GreaterThanOrEqualTo(Val),
    /// Field is less than the value
    LessThan(Val),
    /// Field is less than or equal to the value
    LessThanOrEqualTo(Val),
    /// Field lies within the inclusive bounds
    Between(Val, Val),
    /// Field equals one of the values
    In(Vec<Val>),
    /// Field's string form contains the text
    Contains(String),
    /// Field's string form starts with the text
    StartsWith(String),
    /// Field is null
    IsNull,
    /// Field is not null
    IsNotNull,
}

impl Condition {
    fn test(&self, val: &Val) -> bool {
        let cmp = |other: &Val| val.compare(other);
        match self {
            Condition::Equals(v) => cmp(v) == Some(Ordering::Equal),
            Condition::NotEquals(v) => cmp(v) != Some(Ordering::Equal),
            Condition::GreaterThan(v) => cmp(v) == Some(Ordering::Greater),
            Condition::GreaterThanOrEqualTo(v) => matches!(cmp(v), Some(Ordering::Greater | Ordering::Equal)),
            Condition::LessThan(v) => cmp(v) == Some(Ordering::Less),
            Condition::LessThanOrEqualTo(v) => matches!(cmp(v), Some(Ordering::Less | Ordering::Equal)),
            Condition::Between(low, high) => {
                matches!(cmp(low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(cmp(high), Some(Ordering::Less | Ordering::Equal))
            }
            Condition::In(values) => values.iter().any(|v| cmp(v) == Some(Ordering::Equal)),
            Condition::Contains(text) => !val.is_null() && val.to_string().contains(text.as_str()),
            Condition::StartsWith(text) => !val.is_null() && val.to_string().starts_with(text.as_str()),
            Condition::IsNull => val.is_null(),
            Condition::IsNotNull => !val.is_null(),
        }
    }
}

/// A boolean expression over row fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// Every child holds; empty is true
    And(Vec<Expression>),
    /// Some child holds; empty is false
    Or(Vec<Expression>),
    /// The child does not hold
    Not(Box<Expression>),
    /// A condition on one field
    Term {
        /// Field name
        field: String,
        /// Test applied to the field
        condition: Condition,
    },
}

impl Expression {
    /// A term on `field`.
    pub fn term(field: impl Into<String>, condition: Condition) -> Self {
        Expression::Term { field: field.into(), condition }
    }

    /// `field == value`.
    pub fn equals(field: impl Into<String>, value: impl Into<Val>) -> Self {
        Self::term(field, Condition::Equals(value.into()))
    }
}

/// Search criteria. No expression matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionCriteria {
    /// Filter expression
    pub expression: Option<Expression>,
}

impl ExpressionCriteria {
    /// Criteria matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Criteria matching rows that satisfy `expression`.
    pub fn new(expression: Expression) -> Self {
        Self { expression: Some(expression) }
    }
}

/// Compiled row predicate.
pub type Predicate = Box<dyn Fn(&[Val]) -> bool + Send + Sync>;

/// Compiles criteria into predicates over projected rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionPredicateFactory;

impl ExpressionPredicateFactory {
    /// Creates a factory.
    pub fn new() -> Self {
        Self
    }

    /// Compiles `criteria`, adding every field it names to `fields`.
    pub fn create(&self, criteria: &ExpressionCriteria, fields: &mut FieldIndex) -> Result<Predicate> {
        match &criteria.expression {
            None => Ok(Box::new(|_| true)),
            Some(expression) => self.compile(expression, fields),
        }
    }

    fn compile(&self, expression: &Expression, fields: &mut FieldIndex) -> Result<Predicate> {
        Ok(match expression {
            Expression::And(children) => {
                let children = children
                    .iter()
                    .map(|c| self.compile(c, fields))
                    .collect::<Result<Vec<_>>>()?;
                Box::new(move |row| children.iter().all(|c| c(row)))
            }
            Expression::Or(children) => {
                let children = children
                    .iter()
                    .map(|c| self.compile(c, fields))
                    .collect::<Result<Vec<_>>>()?;
                Box::new(move |row| children.iter().any(|c| c(row)))
            }
            Expression::Not(child) => {
                let child = self.compile(child, fields)?;
                Box::new(move |row| !child(row))
            }
            Expression::Term { field, condition } => {
                if field.is_empty() {
                    return Err(Error::invalid_argument("expression term has no field"));
                }
                let pos = fields.create(field.as_str());
                let condition = condition.clone();
                Box::new(move |row| row.get(pos).is_some_and(|val| condition.test(val)))
            }
        })
    }
}

/// Half-open time window `[from, to)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFilter {
    /// Inclusive start
    pub from: i64,
    /// Exclusive end
    pub to: i64,
}

impl TimeFilter {
    /// Creates a window.
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    /// Whether `time` lies inside the window.
    pub fn contains(&self, time: i64) -> bool {
        time >= self.from && time < self.to
    }
}

/// A decoded row that a search can project.
pub trait Row {
    /// Value of field `name`; [`Val::Null`] for unknown names.
    fn field(&self, name: &str) -> Val;

    /// Effective time checked against a [`TimeFilter`], if the row has one.
    fn time(&self) -> Option<i64> {
        None
    }
}

/// State of one running search.
pub struct Search<'a, 'c> {
    fields: &'a FieldIndex,
    predicate: Predicate,
    time_filter: Option<&'a TimeFilter>,
    consumer: &'a mut (dyn FnMut(Vec<Val>) -> ControlFlow<()> + 'c),
}

impl<'a, 'c> Search<'a, 'c> {
    /// Compiles `criteria` against `fields` and prepares the scan.
    pub fn new(
        criteria: &ExpressionCriteria,
        fields: &'a mut FieldIndex,
        time_filter: Option<&'a TimeFilter>,
        factory: &ExpressionPredicateFactory,
        consumer: &'a mut (dyn FnMut(Vec<Val>) -> ControlFlow<()> + 'c),
    ) -> Result<Self> {
        let predicate = factory.create(criteria, fields)?;
        Ok(Self { fields, predicate, time_filter, consumer })
    }

    /// Projects `row` and passes it on if it matches.
    pub fn accept(&mut self, row: &dyn Row) -> ControlFlow<()> {
        if let (Some(filter), Some(time)) = (self.time_filter, row.time()) {
            if !filter.contains(time) {
                return ControlFlow::Continue(());
            }
        }
        let values: Vec<Val> = self.fields.fields().iter().map(|name| row.field(name)).collect();
        if (self.predicate)(&values) {
            (self.consumer)(values)
        } else {
            ControlFlow::Continue(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestRow {
        key: &'static str,
        value: i64,
        time: i64,
    }

    impl Row for TestRow {
        fn field(&self, name: &str) -> Val {
            match name {
                fields::KEY => Val::string(self.key),
                fields::VALUE => Val::Long(self.value),
                _ => Val::Null,
            }
        }

        fn time(&self) -> Option<i64> {
            Some(self.time)
        }
    }

    fn rows() -> Vec<TestRow> {
        vec![
            TestRow { key: "apple", value: 1, time: 10 },
            TestRow { key: "banana", value: 5, time: 20 },
            TestRow { key: "cherry", value: 9, time: 30 },
        ]
    }

    fn run(criteria: &ExpressionCriteria, fields: &mut FieldIndex, filter: Option<&TimeFilter>) -> Vec<Vec<Val>> {
        let mut out = Vec::new();
        let mut consumer = |row: Vec<Val>| {
            out.push(row);
            ControlFlow::Continue(())
        };
        let factory = ExpressionPredicateFactory::new();
        let mut search = Search::new(criteria, fields, filter, &factory, &mut consumer).unwrap();
        for row in rows() {
            if search.accept(&row).is_break() {
                break;
            }
        }
        drop(search);
        out
    }

    #[test]
    fn test_empty_criteria_matches_everything() {
        let mut fields = FieldIndex::with_fields([fields::KEY]);
        let out = run(&ExpressionCriteria::all(), &mut fields, None);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], vec![Val::string("apple")]);
    }

    #[test]
    fn test_expression_adds_fields_and_filters() {
        let mut fields = FieldIndex::with_fields([fields::KEY]);
        let criteria = ExpressionCriteria::new(Expression::And(vec![
            Expression::term(fields::VALUE, Condition::GreaterThan(Val::Int(2))),
            Expression::Not(Box::new(Expression::term(fields::KEY, Condition::StartsWith("c".into())))),
        ]));
        let out = run(&criteria, &mut fields, None);
        assert_eq!(fields.fields(), &["Key".to_string(), "Value".to_string()]);
        assert_eq!(out, vec![vec![Val::string("banana"), Val::Long(5)]]);

        let unknown = ExpressionCriteria::new(Expression::term("Missing", Condition::IsNull));
        assert_eq!(run(&unknown, &mut FieldIndex::new(), None).len(), 3);
    }

    #[test]
    fn test_time_filter_and_early_stop() {
        let mut fields = FieldIndex::with_fields([fields::KEY]);
        let filter = TimeFilter::new(15, 30);
        let out = run(&ExpressionCriteria::all(), &mut fields, Some(&filter));
        assert_eq!(out, vec![vec![Val::string("banana")]]);

        let mut seen = 0;
        let mut consumer = |_: Vec<Val>| {
            seen += 1;
            ControlFlow::Break(())
        };
        let factory = ExpressionPredicateFactory::new();
        let criteria = ExpressionCriteria::all();
        let mut search = Search::new(&criteria, &mut fields, None, &factory, &mut consumer).unwrap();
        let stopped = rows().iter().any(|row| search.accept(row).is_break());
        drop(search);
        assert!(stopped);
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_criteria_json() {
        let criteria = ExpressionCriteria::new(Expression::equals(fields::KEY, "a"));
        let json = serde_json::to_string(&criteria).unwrap();
        let back: ExpressionCriteria = serde_json::from_str(&json).unwrap();
        assert_eq!(back, criteria);
    }
}
