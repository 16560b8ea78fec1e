//! Binary codecs for keys and values.
//!
//! - [`sortable`]: order-preserving primitive encodings
//! - [`key`]: key prefixes per [`KeyType`](crate::settings::KeyType)
//! - [`value`]: values per [`ValueType`](crate::settings::ValueType)
//!
//! Every encoded key is self-delimiting, so variants can append times and
//! range bounds after the prefix and still decode the parts back.

pub mod key;
pub mod sortable;
pub mod value;

pub use key::KeyCodec;
pub use value::ValueCodec;

use crate::error::{Error, Result};
use crate::val::Val;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use sortable::Reader;
use std::fmt;

/// One name to value pair of a tag set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name
    pub name: String,
    /// Tag value
    pub value: Val,
}

impl Tag {
    /// Creates a tag.
    pub fn new(name: impl Into<String>, value: impl Into<Val>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// The key part of a row, before any time or range is appended.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPrefix {
    /// A single value
    Single(Val),
    /// Tags sorted by name, names unique
    Tags(Vec<Tag>),
}

impl KeyPrefix {
    /// A single-value prefix.
    pub fn new(val: impl Into<Val>) -> Self {
        KeyPrefix::Single(val.into())
    }

    /// A tag prefix. Tags are sorted by name; duplicate names are rejected.
    pub fn tags(tags: impl IntoIterator<Item = Tag>) -> Result<Self> {
        let mut tags: Vec<Tag> = tags.into_iter().collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(pair) = tags.windows(2).find(|pair| pair[0].name == pair[1].name) {
            return Err(Error::validation(format!("duplicate tag name {:?}", pair[0].name)));
        }
        Ok(KeyPrefix::Tags(tags))
    }

    /// The value of a single-value prefix.
    pub fn val(&self) -> Option<&Val> {
        match self {
            KeyPrefix::Single(val) => Some(val),
            KeyPrefix::Tags(_) => None,
        }
    }

    /// The tags of a tag prefix; empty for single values.
    pub fn tag_list(&self) -> &[Tag] {
        match self {
            KeyPrefix::Single(_) => &[],
            KeyPrefix::Tags(tags) => tags,
        }
    }

    /// Value of tag `name`.
    pub fn tag(&self, name: &str) -> Option<&Val> {
        self.tag_list().iter().find(|t| t.name == name).map(|t| &t.value)
    }

    /// The prefix as a query value: the value itself, or the tags rendered
    /// as `name=value` pairs.
    pub fn to_val(&self) -> Val {
        match self {
            KeyPrefix::Single(val) => val.clone(),
            KeyPrefix::Tags(_) => Val::String(self.to_string()),
        }
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPrefix::Single(val) => write!(f, "{}", val),
            KeyPrefix::Tags(tags) => {
                for (i, tag) in tags.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}={}", tag.name, tag.value)?;
                }
                Ok(())
            }
        }
    }
}

impl From<Val> for KeyPrefix {
    fn from(val: Val) -> Self {
        KeyPrefix::Single(val)
    }
}

const TYPE_NULL: u8 = 0;
const TYPE_BOOLEAN: u8 = 1;
const TYPE_BYTE: u8 = 2;
const TYPE_SHORT: u8 = 3;
const TYPE_INT: u8 = 4;
const TYPE_LONG: u8 = 5;
const TYPE_FLOAT: u8 = 6;
const TYPE_DOUBLE: u8 = 7;
const TYPE_STRING: u8 = 8;
const TYPE_DATE: u8 = 9;

/// Appends `val` as a type byte followed by its payload. Strings run to the
/// end of the buffer, so this must be the last thing written.
pub(crate) fn put_typed(buf: &mut Vec<u8>, val: &Val) {
    match val {
        Val::Null => buf.put_u8(TYPE_NULL),
        Val::Boolean(v) => {
            buf.put_u8(TYPE_BOOLEAN);
            buf.put_u8(*v as u8);
        }
        Val::Byte(v) => {
            buf.put_u8(TYPE_BYTE);
            buf.put_i8(*v);
        }
        Val::Short(v) => {
            buf.put_u8(TYPE_SHORT);
            buf.put_i16(*v);
        }
        Val::Int(v) => {
            buf.put_u8(TYPE_INT);
            buf.put_i32(*v);
        }
        Val::Long(v) => {
            buf.put_u8(TYPE_LONG);
            buf.put_i64(*v);
        }
        Val::Float(v) => {
            buf.put_u8(TYPE_FLOAT);
            buf.put_f32(*v);
        }
        Val::Double(v) => {
            buf.put_u8(TYPE_DOUBLE);
            buf.put_f64(*v);
        }
        Val::String(v) => {
            buf.put_u8(TYPE_STRING);
            buf.put_slice(v.as_bytes());
        }
        Val::Date(v) => {
            buf.put_u8(TYPE_DATE);
            buf.put_i64(*v);
        }
    }
}

/// `val` in its typed form.
pub(crate) fn typed_bytes(val: &Val) -> Vec<u8> {
    let mut buf = Vec::new();
    put_typed(&mut buf, val);
    buf
}

/// Reads a value written by [`put_typed`], consuming the rest of `reader`.
pub(crate) fn read_typed(reader: &mut Reader<'_>) -> Result<Val> {
    let val = match reader.u8()? {
        TYPE_NULL => Val::Null,
        TYPE_BOOLEAN => Val::Boolean(reader.u8()? != 0),
        TYPE_BYTE => Val::Byte(reader.u8()? as i8),
        TYPE_SHORT => Val::Short(reader.u16()? as i16),
        TYPE_INT => Val::Int(reader.u32()? as i32),
        TYPE_LONG => Val::Long(reader.u64()? as i64),
        TYPE_FLOAT => Val::Float(f32::from_bits(reader.u32()?)),
        TYPE_DOUBLE => Val::Double(f64::from_bits(reader.u64()?)),
        TYPE_STRING => Val::String(
            String::from_utf8(reader.take_rest().to_vec())
                .map_err(|e| Error::corruption(format!("Invalid UTF-8 in value: {}", e)))?,
        ),
        TYPE_DATE => Val::Date(reader.u64()? as i64),
        other => return Err(Error::corruption(format!("Unknown value type {}", other))),
    };
    if !reader.is_empty() {
        return Err(Error::corruption(format!("{} trailing bytes after value", reader.remaining().len())));
    }
    Ok(val)
}

/// Decodes a whole buffer written by [`put_typed`].
pub(crate) fn from_typed_bytes(bytes: &[u8]) -> Result<Val> {
    read_typed(&mut Reader::new(bytes))
}

/// Canonical serialization of a tag list, the content behind a TAGS key.
pub(crate) fn tags_bytes(tags: &[Tag]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(tags)?)
}

/// Reads tags written by [`tags_bytes`].
pub(crate) fn tags_from_bytes(bytes: &[u8]) -> Result<Vec<Tag>> {
    Ok(bincode::deserialize(bytes)?)
}
