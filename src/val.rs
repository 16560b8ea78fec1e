//! Typed values stored in keys and values and returned by queries.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Val {
    /// No value (unknown projection, missing field)
    Null,
    /// Boolean
    Boolean(bool),
    /// 8-bit signed integer
    Byte(i8),
    /// 16-bit signed integer
    Short(i16),
    /// 32-bit signed integer
    Int(i32),
    /// 64-bit signed integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Instant as epoch milliseconds
    Date(i64),
}

impl Val {
    /// Name of the value's type, as used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Boolean(_) => "boolean",
            Val::Byte(_) => "byte",
            Val::Short(_) => "short",
            Val::Int(_) => "int",
            Val::Long(_) => "long",
            Val::Float(_) => "float",
            Val::Double(_) => "double",
            Val::String(_) => "string",
            Val::Date(_) => "date",
        }
    }

    /// Creates a string value.
    pub fn string(s: impl Into<String>) -> Self {
        Val::String(s.into())
    }

    /// Whether this is [`Val::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    /// The value as an integer, for integer types and dates.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Val::Byte(v) => Some(*v as i64),
            Val::Short(v) => Some(*v as i64),
            Val::Int(v) => Some(*v as i64),
            Val::Long(v) => Some(*v),
            Val::Date(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a float, for every numeric type.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Val::Float(v) => Some(*v as f64),
            Val::Double(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// The value as a string slice, for strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::String(s) => Some(s),
            _ => None,
        }
    }

    /// Compares two values for query predicates.
    ///
    /// Numbers compare numerically across widths; strings compare against
    /// each other and against the string form of other values. `Null` only
    /// equals `Null`.
    pub fn compare(&self, other: &Val) -> Option<Ordering> {
        match (self, other) {
            (Val::Null, Val::Null) => Some(Ordering::Equal),
            (Val::Null, _) | (_, Val::Null) => None,
            (Val::Boolean(a), Val::Boolean(b)) => Some(a.cmp(b)),
            (Val::String(a), Val::String(b)) => Some(a.as_str().cmp(b.as_str())),
            (Val::String(a), b) => Some(a.as_str().cmp(b.to_string().as_str())),
            (a, Val::String(b)) => Some(a.to_string().as_str().cmp(b.as_str())),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
            },
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => Ok(()),
            Val::Boolean(v) => write!(f, "{}", v),
            Val::Byte(v) => write!(f, "{}", v),
            Val::Short(v) => write!(f, "{}", v),
            Val::Int(v) => write!(f, "{}", v),
            Val::Long(v) => write!(f, "{}", v),
            Val::Float(v) => write!(f, "{}", v),
            Val::Double(v) => write!(f, "{}", v),
            Val::String(v) => f.write_str(v),
            Val::Date(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Val {
    fn from(v: bool) -> Self {
        Val::Boolean(v)
    }
}

impl From<i8> for Val {
    fn from(v: i8) -> Self {
        Val::Byte(v)
    }
}

impl From<i16> for Val {
    fn from(v: i16) -> Self {
        Val::Short(v)
    }
}

impl From<i32> for Val {
    fn from(v: i32) -> Self {
        Val::Int(v)
    }
}

impl From<i64> for Val {
    fn from(v: i64) -> Self {
        Val::Long(v)
    }
}

impl From<f32> for Val {
    fn from(v: f32) -> Self {
        Val::Float(v)
    }
}

impl From<f64> for Val {
    fn from(v: f64) -> Self {
        Val::Double(v)
    }
}

impl From<&str> for Val {
    fn from(v: &str) -> Self {
        Val::String(v.to_string())
    }
}

impl From<String> for Val {
    fn from(v: String) -> Self {
        Val::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_across_widths() {
        assert_eq!(Val::Byte(3).compare(&Val::Long(3)), Some(Ordering::Equal));
        assert_eq!(Val::Int(2).compare(&Val::Double(2.5)), Some(Ordering::Less));
        assert_eq!(Val::string("b").compare(&Val::string("a")), Some(Ordering::Greater));
        assert_eq!(Val::string("10").compare(&Val::Int(10)), Some(Ordering::Equal));
        assert_eq!(Val::Null.compare(&Val::Int(1)), None);
        assert_eq!(Val::Double(f64::NAN).compare(&Val::Double(1.0)), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Val::Long(-5).to_string(), "-5");
        assert_eq!(Val::Boolean(true).to_string(), "true");
        assert_eq!(Val::Null.to_string(), "");
        assert_eq!(Val::from("abc").to_string(), "abc");
    }
}
