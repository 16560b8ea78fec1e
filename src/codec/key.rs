//! Key prefix encodings.
//!
//! Fixed types use the sortable encodings directly, so their keys sort in
//! value order. Lookup types store a fixed-width surrogate instead of the
//! value. VARIABLE keys start with a tag byte naming the value's type and the
//! width it was stored in:
//!
//! | tag            | payload                              |
//! |----------------|--------------------------------------|
//! | `0x10`         | boolean byte                         |
//! | `0xT0..=0xT3`  | integer of type T in 1, 2, 4, 8 bytes|
//! | `0x60`, `0x70` | sortable float, double               |
//! | `0x80`         | escaped inline string                |
//! | `0x81`         | `u32` uid of the string              |
//! | `0x82`         | hash id of the string                |
//!
//! VARIABLE keys of one type and width sort in value order; across types and
//! widths they only group.

use crate::codec::sortable::{self, Reader};
use crate::codec::{from_typed_bytes, tags_bytes, tags_from_bytes, typed_bytes, KeyPrefix};
use crate::env::{Env, Txn, WriteTxn, MAX_KEY_LENGTH};
use crate::error::{Error, Result};
use crate::lookup::{HashLookup, LookupRef, UidLookup};
use crate::settings::{HashLength, KeyType};
use crate::val::Val;
use bytes::BufMut;

/// Longest string a VARIABLE key stores inline.
pub const VARIABLE_INLINE_LIMIT: usize = 64;

const VAR_BOOLEAN: u8 = 0x10;
const VAR_BYTE: u8 = 0x20;
const VAR_SHORT: u8 = 0x30;
const VAR_INT: u8 = 0x40;
const VAR_LONG: u8 = 0x50;
const VAR_FLOAT: u8 = 0x60;
const VAR_DOUBLE: u8 = 0x70;
const VAR_STRING: u8 = 0x80;
const VAR_STRING_UID: u8 = 0x81;
const VAR_STRING_HASH: u8 = 0x82;

enum Encoded {
    Inline(Vec<u8>),
    Uid { tag: Option<u8>, content: Vec<u8> },
    Hash { tag: Option<u8>, content: Vec<u8> },
}

enum RawKey {
    Inline(KeyPrefix),
    Uid(u32),
    Hash(Vec<u8>),
}

/// Encodes and decodes key prefixes of one key schema.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    key_type: KeyType,
    uid: Option<UidLookup>,
    hash: Option<HashLookup>,
}

impl KeyCodec {
    /// Creates a codec, opening the lookup tables `key_type` needs under
    /// `name`.
    pub fn open(env: &Env, name: &str, key_type: KeyType, hash_length: HashLength) -> Result<Self> {
        let uid = match key_type {
            KeyType::UidLookup | KeyType::Variable | KeyType::Tags => Some(UidLookup::open(env, name)?),
            _ => None,
        };
        let hash = match key_type {
            KeyType::HashLookup | KeyType::Variable => Some(HashLookup::open(env, name, hash_length)?),
            _ => None,
        };
        Ok(Self { key_type, uid, hash })
    }

    /// The configured key type.
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn uid(&self) -> Result<&UidLookup> {
        self.uid.as_ref().ok_or_else(|| Error::internal("key codec has no uid lookup"))
    }

    fn hash(&self) -> Result<&HashLookup> {
        self.hash.as_ref().ok_or_else(|| Error::internal("key codec has no hash lookup"))
    }

    /// Appends the encoding of `prefix`, creating lookup entries as needed.
    pub fn encode(&self, txn: &mut WriteTxn<'_>, prefix: &KeyPrefix, buf: &mut Vec<u8>) -> Result<()> {
        match self.plan(prefix)? {
            Encoded::Inline(bytes) => buf.extend_from_slice(&bytes),
            Encoded::Uid { tag, content } => {
                let id = self.uid()?.get_or_create(txn, &content)?;
                buf.extend(tag);
                buf.put_u32(id);
            }
            Encoded::Hash { tag, content } => {
                let id = self.hash()?.get_or_create(txn, &content)?;
                buf.extend(tag);
                buf.extend_from_slice(&id);
            }
        }
        Ok(())
    }

    /// Appends the encoding of `prefix` without creating lookup entries.
    /// Returns `false` when a lookup entry is missing, in which case nothing
    /// can be stored under the prefix.
    pub fn encode_existing(&self, txn: &dyn Txn, prefix: &KeyPrefix, buf: &mut Vec<u8>) -> Result<bool> {
        match self.plan(prefix)? {
            Encoded::Inline(bytes) => buf.extend_from_slice(&bytes),
            Encoded::Uid { tag, content } => match self.uid()?.get_id(txn, &content)? {
                Some(id) => {
                    buf.extend(tag);
                    buf.put_u32(id);
                }
                None => return Ok(false),
            },
            Encoded::Hash { tag, content } => match self.hash()?.get_id(txn, &content)? {
                Some(id) => {
                    buf.extend(tag);
                    buf.extend_from_slice(&id);
                }
                None => return Ok(false),
            },
        }
        Ok(true)
    }

    /// Reads a prefix, resolving lookup ids.
    pub fn decode(&self, txn: &dyn Txn, reader: &mut Reader<'_>) -> Result<KeyPrefix> {
        match self.decode_raw(reader)? {
            RawKey::Inline(prefix) => Ok(prefix),
            RawKey::Uid(id) => {
                let content = self.uid()?.get(txn, id)?;
                if self.key_type == KeyType::Tags {
                    Ok(KeyPrefix::Tags(tags_from_bytes(&content)?))
                } else {
                    Ok(KeyPrefix::Single(from_typed_bytes(&content)?))
                }
            }
            RawKey::Hash(id) => Ok(KeyPrefix::Single(from_typed_bytes(&self.hash()?.get(txn, &id)?)?)),
        }
    }

    /// Skips a prefix, returning the lookup entry it references.
    pub fn lookup_ref(&self, reader: &mut Reader<'_>) -> Result<Option<LookupRef>> {
        Ok(match self.decode_raw(reader)? {
            RawKey::Inline(_) => None,
            RawKey::Uid(id) => Some(LookupRef::Uid(id)),
            RawKey::Hash(id) => Some(LookupRef::Hash(id)),
        })
    }

    /// Deletes lookup entries that no key references.
    pub fn delete_unused(&self, txn: &mut WriteTxn<'_>, used: &crate::lookup::UsedLookups) -> Result<usize> {
        let mut removed = 0;
        if let Some(uid) = &self.uid {
            removed += uid.delete_unused(txn, &used.uids)?;
        }
        if let Some(hash) = &self.hash {
            removed += hash.delete_unused(txn, &used.hashes)?;
        }
        Ok(removed)
    }

    fn plan(&self, prefix: &KeyPrefix) -> Result<Encoded> {
        let val = match (self.key_type, prefix) {
            (KeyType::Tags, KeyPrefix::Tags(tags)) => {
                return Ok(Encoded::Uid { tag: None, content: tags_bytes(tags)? });
            }
            (KeyType::Tags, KeyPrefix::Single(val)) => {
                return Err(Error::validation(format!("TAGS key expects tags, found {}", val.type_name())));
            }
            (key_type, KeyPrefix::Tags(_)) => {
                return Err(Error::validation(format!("{:?} key expects a single value, found tags", key_type)));
            }
            (_, KeyPrefix::Single(val)) => val,
        };
        if val.is_null() {
            return Err(Error::validation("key value must not be null"));
        }

        let mut buf = Vec::new();
        match self.key_type {
            KeyType::Boolean => match val {
                Val::Boolean(v) => buf.put_u8(*v as u8),
                other => return Err(mismatch(self.key_type, other)),
            },
            KeyType::Byte => sortable::put_i8(&mut buf, narrow(self.key_type, val)?),
            KeyType::Short => sortable::put_i16(&mut buf, narrow(self.key_type, val)?),
            KeyType::Int => sortable::put_i32(&mut buf, narrow(self.key_type, val)?),
            KeyType::Long => sortable::put_i64(&mut buf, narrow(self.key_type, val)?),
            KeyType::Float => sortable::put_f32(&mut buf, as_f32(self.key_type, val)?),
            KeyType::Double => match val.as_f64() {
                Some(v) if !matches!(val, Val::Date(_)) => sortable::put_f64(&mut buf, v),
                _ => return Err(mismatch(self.key_type, val)),
            },
            KeyType::String => match val {
                Val::String(s) => sortable::put_escaped(&mut buf, s.as_bytes()),
                other => return Err(mismatch(self.key_type, other)),
            },
            KeyType::UidLookup => return Ok(Encoded::Uid { tag: None, content: typed_bytes(val) }),
            KeyType::HashLookup => return Ok(Encoded::Hash { tag: None, content: typed_bytes(val) }),
            KeyType::Variable => return self.plan_variable(val),
            KeyType::Tags => return Err(mismatch(self.key_type, val)),
        }
        Ok(Encoded::Inline(buf))
    }

    fn plan_variable(&self, val: &Val) -> Result<Encoded> {
        let mut buf = Vec::new();
        match val {
            Val::Boolean(v) => {
                buf.put_u8(VAR_BOOLEAN);
                buf.put_u8(*v as u8);
            }
            Val::Byte(v) => put_compact(&mut buf, VAR_BYTE, *v as i64),
            Val::Short(v) => put_compact(&mut buf, VAR_SHORT, *v as i64),
            Val::Int(v) => put_compact(&mut buf, VAR_INT, *v as i64),
            Val::Long(v) | Val::Date(v) => put_compact(&mut buf, VAR_LONG, *v),
            Val::Float(v) => {
                buf.put_u8(VAR_FLOAT);
                sortable::put_f32(&mut buf, *v);
            }
            Val::Double(v) => {
                buf.put_u8(VAR_DOUBLE);
                sortable::put_f64(&mut buf, *v);
            }
            Val::String(s) => {
                if s.len() <= VARIABLE_INLINE_LIMIT {
                    buf.put_u8(VAR_STRING);
                    sortable::put_escaped(&mut buf, s.as_bytes());
                } else {
                    let content = typed_bytes(val);
                    if content.len() <= MAX_KEY_LENGTH {
                        return Ok(Encoded::Uid { tag: Some(VAR_STRING_UID), content });
                    }
                    return Ok(Encoded::Hash { tag: Some(VAR_STRING_HASH), content });
                }
            }
            Val::Null => return Err(Error::validation("key value must not be null")),
        }
        Ok(Encoded::Inline(buf))
    }

    fn decode_raw(&self, reader: &mut Reader<'_>) -> Result<RawKey> {
        let val = match self.key_type {
            KeyType::Boolean => Val::Boolean(reader.u8()? != 0),
            KeyType::Byte => Val::Byte(reader.i8()?),
            KeyType::Short => Val::Short(reader.i16()?),
            KeyType::Int => Val::Int(reader.i32()?),
            KeyType::Long => Val::Long(reader.i64()?),
            KeyType::Float => Val::Float(reader.f32()?),
            KeyType::Double => Val::Double(reader.f64()?),
            KeyType::String => Val::String(reader.escaped_string()?),
            KeyType::UidLookup | KeyType::Tags => return Ok(RawKey::Uid(reader.u32()?)),
            KeyType::HashLookup => return Ok(RawKey::Hash(reader.take(self.hash()?.id_len())?.to_vec())),
            KeyType::Variable => return self.decode_variable(reader),
        };
        Ok(RawKey::Inline(KeyPrefix::Single(val)))
    }

    fn decode_variable(&self, reader: &mut Reader<'_>) -> Result<RawKey> {
        let tag = reader.u8()?;
        let val = match tag {
            VAR_BOOLEAN => Val::Boolean(reader.u8()? != 0),
            VAR_FLOAT => Val::Float(reader.f32()?),
            VAR_DOUBLE => Val::Double(reader.f64()?),
            VAR_STRING => Val::String(reader.escaped_string()?),
            VAR_STRING_UID => return Ok(RawKey::Uid(reader.u32()?)),
            VAR_STRING_HASH => return Ok(RawKey::Hash(reader.take(self.hash()?.id_len())?.to_vec())),
            _ => {
                let v = match tag & 0x0F {
                    0 => reader.i8()? as i64,
                    1 => reader.i16()? as i64,
                    2 => reader.i32()? as i64,
                    3 => reader.i64()?,
                    _ => return Err(Error::corruption(format!("Unknown variable key tag {:#04x}", tag))),
                };
                let out_of_range = || Error::corruption(format!("Variable key value {} out of range", v));
                match tag & 0xF0 {
                    VAR_BYTE => Val::Byte(i8::try_from(v).map_err(|_| out_of_range())?),
                    VAR_SHORT => Val::Short(i16::try_from(v).map_err(|_| out_of_range())?),
                    VAR_INT => Val::Int(i32::try_from(v).map_err(|_| out_of_range())?),
                    VAR_LONG => Val::Long(v),
                    _ => return Err(Error::corruption(format!("Unknown variable key tag {:#04x}", tag))),
                }
            }
        };
        Ok(RawKey::Inline(KeyPrefix::Single(val)))
    }
}

fn mismatch(key_type: KeyType, val: &Val) -> Error {
    Error::validation(format!("{} value {} does not fit a {:?} key", val.type_name(), val, key_type))
}

fn narrow<T: TryFrom<i64>>(key_type: KeyType, val: &Val) -> Result<T> {
    let v = val.as_i64().ok_or_else(|| mismatch(key_type, val))?;
    T::try_from(v).map_err(|_| mismatch(key_type, val))
}

fn as_f32(key_type: KeyType, val: &Val) -> Result<f32> {
    match val {
        Val::Float(v) => Ok(*v),
        Val::Double(v) if (*v as f32) as f64 == *v => Ok(*v as f32),
        other => Err(mismatch(key_type, other)),
    }
}

fn put_compact(buf: &mut Vec<u8>, type_tag: u8, v: i64) {
    if let Ok(v) = i8::try_from(v) {
        buf.put_u8(type_tag);
        sortable::put_i8(buf, v);
    } else if let Ok(v) = i16::try_from(v) {
        buf.put_u8(type_tag | 1);
        sortable::put_i16(buf, v);
    } else if let Ok(v) = i32::try_from(v) {
        buf.put_u8(type_tag | 2);
        sortable::put_i32(buf, v);
    } else {
        buf.put_u8(type_tag | 3);
        sortable::put_i64(buf, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Tag;
    use crate::config::EnvOptions;
    use tempfile::TempDir;

    fn round_trip(env: &Env, codec: &KeyCodec, prefix: &KeyPrefix) -> (Vec<u8>, KeyPrefix) {
        let encoded = env
            .write(|txn| {
                let mut buf = Vec::new();
                codec.encode(txn, prefix, &mut buf)?;
                Ok(buf)
            })
            .unwrap();
        let txn = env.begin_read();
        let mut reader = Reader::new(&encoded);
        let decoded = codec.decode(&txn, &mut reader).unwrap();
        assert!(reader.is_empty());
        (encoded, decoded)
    }

    #[test]
    fn test_fixed_key_bounds() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let cases = [
            (KeyType::Boolean, vec![Val::Boolean(false), Val::Boolean(true)]),
            (KeyType::Byte, vec![Val::Byte(i8::MIN), Val::Byte(0), Val::Byte(i8::MAX)]),
            (KeyType::Short, vec![Val::Short(i16::MIN), Val::Short(0), Val::Short(i16::MAX)]),
            (KeyType::Int, vec![Val::Int(i32::MIN), Val::Int(0), Val::Int(i32::MAX)]),
            (KeyType::Long, vec![Val::Long(i64::MIN), Val::Long(0), Val::Long(i64::MAX)]),
            (KeyType::Float, vec![Val::Float(f32::MIN), Val::Float(0.0), Val::Float(f32::MAX)]),
            (KeyType::Double, vec![Val::Double(f64::MIN), Val::Double(0.0), Val::Double(f64::MAX)]),
            (KeyType::String, vec![Val::string(""), Val::string("a"), Val::string("b")]),
        ];
        for (key_type, values) in cases {
            let codec = KeyCodec::open(&env, "key", key_type, HashLength::Long).unwrap();
            let mut encoded = Vec::new();
            for val in values {
                let prefix = KeyPrefix::Single(val);
                let (bytes, decoded) = round_trip(&env, &codec, &prefix);
                assert_eq!(decoded, prefix, "{:?}", key_type);
                encoded.push(bytes);
            }
            assert!(encoded.windows(2).all(|w| w[0] < w[1]), "{:?} keys not ordered", key_type);
        }
    }

    #[test]
    fn test_variable_keys_keep_type_and_pick_storage() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let codec = KeyCodec::open(&env, "key", KeyType::Variable, HashLength::Long).unwrap();

        let (bytes, decoded) = round_trip(&env, &codec, &KeyPrefix::new(5i64));
        assert_eq!(decoded, KeyPrefix::new(5i64));
        assert_eq!(bytes.len(), 2);

        for val in [Val::Int(i32::MIN), Val::Short(300), Val::Double(-0.5), Val::Boolean(true)] {
            assert_eq!(round_trip(&env, &codec, &KeyPrefix::new(val.clone())).1, KeyPrefix::new(val));
        }

        let short = "a".repeat(VARIABLE_INLINE_LIMIT);
        let (bytes, _) = round_trip(&env, &codec, &KeyPrefix::new(short.as_str()));
        assert_eq!(bytes[0], VAR_STRING);

        let mid = "b".repeat(400);
        let (bytes, decoded) = round_trip(&env, &codec, &KeyPrefix::new(mid.as_str()));
        assert_eq!(bytes[0], VAR_STRING_UID);
        assert_eq!(decoded, KeyPrefix::new(mid.as_str()));

        let long = "c".repeat(1000);
        let (bytes, decoded) = round_trip(&env, &codec, &KeyPrefix::new(long.as_str()));
        assert_eq!(bytes[0], VAR_STRING_HASH);
        assert_eq!(decoded, KeyPrefix::new(long.as_str()));
    }

    #[test]
    fn test_lookup_and_tag_keys() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();

        let uid = KeyCodec::open(&env, "uid", KeyType::UidLookup, HashLength::Long).unwrap();
        let (bytes, decoded) = round_trip(&env, &uid, &KeyPrefix::new("host-1"));
        assert_eq!(bytes.len(), 4);
        assert_eq!(decoded, KeyPrefix::new("host-1"));

        let hash = KeyCodec::open(&env, "hash", KeyType::HashLookup, HashLength::Integer).unwrap();
        let (bytes, _) = round_trip(&env, &hash, &KeyPrefix::new(42i64));
        assert_eq!(bytes.len(), 6);

        let tags = KeyCodec::open(&env, "tags", KeyType::Tags, HashLength::Long).unwrap();
        let prefix = KeyPrefix::tags(vec![Tag::new("b", 2i32), Tag::new("a", "x")]).unwrap();
        let (first, decoded) = round_trip(&env, &tags, &prefix);
        assert_eq!(decoded, prefix);
        let reordered = KeyPrefix::tags(vec![Tag::new("a", "x"), Tag::new("b", 2i32)]).unwrap();
        assert_eq!(round_trip(&env, &tags, &reordered).0, first);

        let txn = env.begin_read();
        let mut buf = Vec::new();
        assert!(!uid.encode_existing(&txn, &KeyPrefix::new("unknown"), &mut buf).unwrap());
    }

    #[test]
    fn test_incompatible_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let byte = KeyCodec::open(&env, "key", KeyType::Byte, HashLength::Long).unwrap();
        let txn = env.begin_read();
        let mut buf = Vec::new();
        assert!(matches!(
            byte.encode_existing(&txn, &KeyPrefix::new(300i32), &mut buf),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            byte.encode_existing(&txn, &KeyPrefix::new("x"), &mut buf),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            byte.encode_existing(&txn, &KeyPrefix::Single(Val::Null), &mut buf),
            Err(Error::Validation(_))
        ));
        assert!(buf.is_empty());
    }
}
