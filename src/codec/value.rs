//! Value encodings.
//!
//! Every stored value starts with the insert time as a big-endian `i64`,
//! which retention uses unless it ages rows by their own time.

use crate::codec::sortable::Reader;
use crate::codec::{from_typed_bytes, put_typed, read_typed, typed_bytes};
use crate::env::{Env, Txn, WriteTxn, MAX_KEY_LENGTH};
use crate::error::{Error, Result};
use crate::lookup::{HashLookup, LookupRef, UidLookup, UsedLookups};
use crate::settings::{ValueSchema, ValueType};
use crate::val::Val;
use bytes::BufMut;

const VARIABLE_INLINE: u8 = 0;
const VARIABLE_UID: u8 = 1;
const VARIABLE_HASH: u8 = 2;

/// Encodes and decodes values of one value schema.
#[derive(Debug, Clone)]
pub struct ValueCodec {
    value_type: ValueType,
    max_value_size: usize,
    uid: Option<UidLookup>,
    hash: Option<HashLookup>,
}

impl ValueCodec {
    /// Creates a codec, opening the lookup tables the schema needs under
    /// `name`.
    pub fn open(env: &Env, name: &str, schema: &ValueSchema) -> Result<Self> {
        let uid = match schema.value_type {
            ValueType::UidLookup | ValueType::Variable => Some(UidLookup::open(env, name)?),
            _ => None,
        };
        let hash = match schema.value_type {
            ValueType::HashLookup | ValueType::Variable => {
                Some(HashLookup::open(env, name, schema.hash_length)?)
            }
            _ => None,
        };
        Ok(Self { value_type: schema.value_type, max_value_size: schema.max_value_size, uid, hash })
    }

    fn uid(&self) -> Result<&UidLookup> {
        self.uid.as_ref().ok_or_else(|| Error::internal("value codec has no uid lookup"))
    }

    fn hash(&self) -> Result<&HashLookup> {
        self.hash.as_ref().ok_or_else(|| Error::internal("value codec has no hash lookup"))
    }

    /// Encodes `val` written at `insert_time`.
    pub fn encode(&self, txn: &mut WriteTxn<'_>, insert_time: i64, val: &Val) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16);
        buf.put_i64(insert_time);
        let mismatch = || {
            Error::validation(format!(
                "{} value {} does not fit a {:?} value",
                val.type_name(),
                val,
                self.value_type
            ))
        };

        match self.value_type {
            ValueType::Boolean => match val {
                Val::Boolean(v) => buf.put_u8(*v as u8),
                _ => return Err(mismatch()),
            },
            ValueType::Byte => buf.put_i8(val.as_i64().and_then(|v| i8::try_from(v).ok()).ok_or_else(mismatch)?),
            ValueType::Short => {
                buf.put_i16(val.as_i64().and_then(|v| i16::try_from(v).ok()).ok_or_else(mismatch)?)
            }
            ValueType::Int => buf.put_i32(val.as_i64().and_then(|v| i32::try_from(v).ok()).ok_or_else(mismatch)?),
            ValueType::Long => buf.put_i64(val.as_i64().ok_or_else(mismatch)?),
            ValueType::Float => match val {
                Val::Float(v) => buf.put_f32(*v),
                Val::Double(v) if (*v as f32) as f64 == *v => buf.put_f32(*v as f32),
                _ => return Err(mismatch()),
            },
            ValueType::Double => match val {
                Val::Float(v) => buf.put_f64(*v as f64),
                Val::Double(v) => buf.put_f64(*v),
                _ => return Err(mismatch()),
            },
            ValueType::String => match val {
                Val::String(s) => {
                    if s.len() > self.max_value_size {
                        return Err(Error::SizeLimit { size: s.len(), limit: self.max_value_size });
                    }
                    buf.put_slice(s.as_bytes());
                }
                _ => return Err(mismatch()),
            },
            ValueType::UidLookup => {
                if val.is_null() {
                    return Err(mismatch());
                }
                let id = self.uid()?.get_or_create(txn, &typed_bytes(val))?;
                buf.put_u32(id);
            }
            ValueType::HashLookup => {
                if val.is_null() {
                    return Err(mismatch());
                }
                let id = self.hash()?.get_or_create(txn, &typed_bytes(val))?;
                buf.put_slice(&id);
            }
            ValueType::Variable => {
                let content = typed_bytes(val);
                if content.len() <= self.max_value_size {
                    buf.put_u8(VARIABLE_INLINE);
                    put_typed(&mut buf, val);
                } else if content.len() <= MAX_KEY_LENGTH {
                    buf.put_u8(VARIABLE_UID);
                    buf.put_u32(self.uid()?.get_or_create(txn, &content)?);
                } else {
                    buf.put_u8(VARIABLE_HASH);
                    buf.put_slice(&self.hash()?.get_or_create(txn, &content)?);
                }
            }
        }
        Ok(buf)
    }

    /// Insert time of an encoded value.
    pub fn insert_time(bytes: &[u8]) -> Result<i64> {
        Ok(Reader::new(bytes).u64()? as i64)
    }

    /// Decodes a value, resolving lookup ids.
    pub fn decode(&self, txn: &dyn Txn, bytes: &[u8]) -> Result<Val> {
        let mut reader = Reader::new(bytes);
        reader.u64()?;
        let val = match self.value_type {
            ValueType::Boolean => Val::Boolean(reader.u8()? != 0),
            ValueType::Byte => Val::Byte(reader.u8()? as i8),
            ValueType::Short => Val::Short(reader.u16()? as i16),
            ValueType::Int => Val::Int(reader.u32()? as i32),
            ValueType::Long => Val::Long(reader.u64()? as i64),
            ValueType::Float => Val::Float(f32::from_bits(reader.u32()?)),
            ValueType::Double => Val::Double(f64::from_bits(reader.u64()?)),
            ValueType::String => Val::String(
                String::from_utf8(reader.take_rest().to_vec())
                    .map_err(|e| Error::corruption(format!("Invalid UTF-8 in value: {}", e)))?,
            ),
            ValueType::UidLookup => from_typed_bytes(&self.uid()?.get(txn, reader.u32()?)?)?,
            ValueType::HashLookup => {
                let id = reader.take(self.hash()?.id_len())?;
                from_typed_bytes(&self.hash()?.get(txn, id)?)?
            }
            ValueType::Variable => match reader.u8()? {
                VARIABLE_INLINE => return read_typed(&mut reader),
                VARIABLE_UID => from_typed_bytes(&self.uid()?.get(txn, reader.u32()?)?)?,
                VARIABLE_HASH => {
                    let id = reader.take(self.hash()?.id_len())?;
                    from_typed_bytes(&self.hash()?.get(txn, id)?)?
                }
                other => return Err(Error::corruption(format!("Unknown variable value marker {}", other))),
            },
        };
        Ok(val)
    }

    /// The lookup entry an encoded value references.
    pub fn lookup_ref(&self, bytes: &[u8]) -> Result<Option<LookupRef>> {
        let mut reader = Reader::new(bytes);
        reader.u64()?;
        let marker = match self.value_type {
            ValueType::UidLookup => VARIABLE_UID,
            ValueType::HashLookup => VARIABLE_HASH,
            ValueType::Variable => reader.u8()?,
            _ => return Ok(None),
        };
        Ok(match marker {
            VARIABLE_UID => Some(LookupRef::Uid(reader.u32()?)),
            VARIABLE_HASH => Some(LookupRef::Hash(reader.take(self.hash()?.id_len())?.to_vec())),
            _ => None,
        })
    }

    /// Deletes lookup entries that no value references.
    pub fn delete_unused(&self, txn: &mut WriteTxn<'_>, used: &UsedLookups) -> Result<usize> {
        let mut removed = 0;
        if let Some(uid) = &self.uid {
            removed += uid.delete_unused(txn, &used.uids)?;
        }
        if let Some(hash) = &self.hash {
            removed += hash.delete_unused(txn, &used.hashes)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvOptions;
    use tempfile::TempDir;

    fn round_trip(env: &Env, codec: &ValueCodec, val: &Val) -> Result<(Vec<u8>, Val)> {
        let bytes = env.write(|txn| codec.encode(txn, 1234, val))?;
        let decoded = codec.decode(&env.begin_read(), &bytes)?;
        Ok((bytes, decoded))
    }

    #[test]
    fn test_fixed_values() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let cases = [
            (ValueType::Boolean, Val::Boolean(true)),
            (ValueType::Byte, Val::Byte(i8::MIN)),
            (ValueType::Short, Val::Short(i16::MAX)),
            (ValueType::Int, Val::Int(i32::MIN)),
            (ValueType::Long, Val::Long(i64::MAX)),
            (ValueType::Float, Val::Float(f32::MIN)),
            (ValueType::Double, Val::Double(f64::MAX)),
            (ValueType::String, Val::string("value")),
            (ValueType::UidLookup, Val::string("shared")),
            (ValueType::HashLookup, Val::Long(-9)),
        ];
        for (value_type, val) in cases {
            let codec = ValueCodec::open(&env, "value", &ValueSchema::new(value_type)).unwrap();
            let (bytes, decoded) = round_trip(&env, &codec, &val).unwrap();
            assert_eq!(decoded, val, "{:?}", value_type);
            assert_eq!(ValueCodec::insert_time(&bytes).unwrap(), 1234);
        }
    }

    #[test]
    fn test_variable_values_spill_into_lookups() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let codec =
            ValueCodec::open(&env, "value", &ValueSchema::new(ValueType::Variable).max_value_size(16)).unwrap();

        let (bytes, decoded) = round_trip(&env, &codec, &Val::Int(7)).unwrap();
        assert_eq!(decoded, Val::Int(7));
        assert_eq!(codec.lookup_ref(&bytes).unwrap(), None);

        let mid = Val::String("m".repeat(100));
        let (bytes, decoded) = round_trip(&env, &codec, &mid).unwrap();
        assert_eq!(decoded, mid);
        assert!(matches!(codec.lookup_ref(&bytes).unwrap(), Some(LookupRef::Uid(_))));

        let long = Val::String("l".repeat(2000));
        let (bytes, decoded) = round_trip(&env, &codec, &long).unwrap();
        assert_eq!(decoded, long);
        assert!(matches!(codec.lookup_ref(&bytes).unwrap(), Some(LookupRef::Hash(_))));
    }

    #[test]
    fn test_size_and_type_limits() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let strings =
            ValueCodec::open(&env, "value", &ValueSchema::new(ValueType::String).max_value_size(4)).unwrap();
        assert!(matches!(
            round_trip(&env, &strings, &Val::string("too long")),
            Err(Error::SizeLimit { size: 8, limit: 4 })
        ));

        let ints = ValueCodec::open(&env, "value", &ValueSchema::new(ValueType::Int)).unwrap();
        assert!(matches!(round_trip(&env, &ints, &Val::Long(i64::MAX)), Err(Error::Validation(_))));
        assert!(matches!(round_trip(&env, &ints, &Val::string("1")), Err(Error::Validation(_))));
    }
}
