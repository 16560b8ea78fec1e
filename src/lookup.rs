//! Surrogate-key lookup tables.
//!
//! A [`UidLookup`] hands out monotonically increasing `u32` ids and keeps a
//! forward (`id -> bytes`) and a reverse (`bytes -> id`) sub-database. The id
//! counter lives in the shard's `info` sub-database, so an id is never handed
//! out twice even after the entry it named was deleted.
//!
//! A [`HashLookup`] keys content by its xxh3 hash followed by a big-endian
//! `u16` occurrence counter. Different content with an equal hash gets the
//! next counter value; resolving content to its id scans the hash prefix.

use crate::db::INFO_DB;
use crate::env::{Db, Env, Txn, WriteTxn, MAX_KEY_LENGTH};
use crate::error::{Error, Result};
use crate::settings::HashLength;
use std::collections::HashSet;
use xxhash_rust::xxh3::xxh3_64;

/// Lookup entries referenced by live rows, collected before unused ones are
/// deleted.
#[derive(Debug, Default, Clone)]
pub struct UsedLookups {
    /// Referenced UID ids
    pub uids: HashSet<u32>,
    /// Referenced hash ids
    pub hashes: HashSet<Vec<u8>>,
}

impl UsedLookups {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }
}

/// A reference to a lookup entry found inside an encoded key or value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupRef {
    /// UID lookup id
    Uid(u32),
    /// Hash lookup id
    Hash(Vec<u8>),
}

impl LookupRef {
    /// Adds the reference to `used`.
    pub fn record(self, used: &mut UsedLookups) {
        match self {
            LookupRef::Uid(id) => {
                used.uids.insert(id);
            }
            LookupRef::Hash(id) => {
                used.hashes.insert(id);
            }
        }
    }
}

/// Monotonic id lookup.
#[derive(Debug, Clone)]
pub struct UidLookup {
    name: String,
    forward: Db,
    reverse: Db,
    info: Db,
}

impl UidLookup {
    /// Opens (registering if needed) the sub-databases of lookup `name`.
    pub fn open(env: &Env, name: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            forward: env.open_db(&format!("{}-uid", name))?,
            reverse: env.open_db(&format!("{}-uid-rev", name))?,
            info: env.open_db(INFO_DB)?,
        })
    }

    fn counter_key(&self) -> Vec<u8> {
        format!("uid-counter:{}", self.name).into_bytes()
    }

    /// Id of `bytes`, allocating one if the content is new.
    pub fn get_or_create(&self, txn: &mut WriteTxn<'_>, bytes: &[u8]) -> Result<u32> {
        if let Some(id) = self.get_id(&*txn, bytes)? {
            return Ok(id);
        }
        if bytes.len() > MAX_KEY_LENGTH {
            return Err(Error::validation(format!(
                "{} bytes is too long for uid lookup {} (limit {})",
                bytes.len(),
                self.name,
                MAX_KEY_LENGTH
            )));
        }

        let counter_key = self.counter_key();
        let last = match txn.get(self.info, &counter_key)? {
            Some(raw) => decode_u32(&raw)?,
            None => 0,
        };
        let id = last
            .checked_add(1)
            .ok_or_else(|| Error::internal(format!("uid lookup {} has run out of ids", self.name)))?;

        txn.put(self.info, &counter_key, &id.to_be_bytes())?;
        txn.put(self.forward, &id.to_be_bytes(), bytes)?;
        txn.put(self.reverse, bytes, &id.to_be_bytes())?;
        Ok(id)
    }

    /// Id of `bytes`, if it has one.
    pub fn get_id(&self, txn: &dyn Txn, bytes: &[u8]) -> Result<Option<u32>> {
        if bytes.len() > MAX_KEY_LENGTH {
            return Ok(None);
        }
        txn.get(self.reverse, bytes)?.map(|raw| decode_u32(&raw)).transpose()
    }

    /// Content stored under `id`.
    pub fn get(&self, txn: &dyn Txn, id: u32) -> Result<Vec<u8>> {
        txn.get(self.forward, &id.to_be_bytes())?
            .ok_or_else(|| Error::corruption(format!("uid {} missing from lookup {}", id, self.name)))
    }

    /// Number of entries.
    pub fn len(&self, txn: &dyn Txn) -> Result<u64> {
        txn.count(self.forward)
    }

    /// Deletes entries not in `used`. Returns how many were removed.
    pub fn delete_unused(&self, txn: &mut WriteTxn<'_>, used: &HashSet<u32>) -> Result<usize> {
        let mut removed = 0;
        for entry in txn.iter(self.forward) {
            let (key, bytes) = entry?;
            let id = decode_u32(&key)?;
            if used.contains(&id) {
                continue;
            }
            txn.delete(self.forward, &key)?;
            txn.delete(self.reverse, &bytes)?;
            removed += 1;
        }
        if removed > 0 {
            log::debug!("Removed {} unused entries from uid lookup {}", removed, self.name);
        }
        Ok(removed)
    }
}

/// Content-hash lookup.
#[derive(Debug, Clone)]
pub struct HashLookup {
    name: String,
    db: Db,
    hash_length: HashLength,
}

impl HashLookup {
    /// Opens (registering if needed) the sub-database of lookup `name`.
    pub fn open(env: &Env, name: &str, hash_length: HashLength) -> Result<Self> {
        Ok(Self { name: name.to_string(), db: env.open_db(&format!("{}-hash", name))?, hash_length })
    }

    /// Width of an id: the hash plus the counter.
    pub fn id_len(&self) -> usize {
        self.hash_length.len() + 2
    }

    fn hash(&self, bytes: &[u8]) -> Vec<u8> {
        let hash = xxh3_64(bytes);
        match self.hash_length {
            HashLength::Integer => (hash as u32).to_be_bytes().to_vec(),
            HashLength::Long => hash.to_be_bytes().to_vec(),
        }
    }

    /// Id of `bytes`, allocating one if the content is new.
    pub fn get_or_create(&self, txn: &mut WriteTxn<'_>, bytes: &[u8]) -> Result<Vec<u8>> {
        let hash = self.hash(bytes);
        let mut next: u32 = 0;
        for entry in txn.prefix(self.db, &hash) {
            let (key, existing) = entry?;
            if existing == bytes {
                return Ok(key);
            }
            let counter = u16::from_be_bytes([key[key.len() - 2], key[key.len() - 1]]);
            next = next.max(counter as u32 + 1);
        }
        let counter = u16::try_from(next)
            .map_err(|_| Error::internal(format!("too many collisions in hash lookup {}", self.name)))?;
        if counter > 0 {
            log::debug!("Hash collision in lookup {}, using counter {}", self.name, counter);
        }

        let mut id = hash;
        id.extend_from_slice(&counter.to_be_bytes());
        txn.put(self.db, &id, bytes)?;
        Ok(id)
    }

    /// Id of `bytes`, if it has one.
    pub fn get_id(&self, txn: &dyn Txn, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        for entry in txn.prefix(self.db, &self.hash(bytes)) {
            let (key, existing) = entry?;
            if existing == bytes {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Content stored under `id`.
    pub fn get(&self, txn: &dyn Txn, id: &[u8]) -> Result<Vec<u8>> {
        txn.get(self.db, id)?.ok_or_else(|| {
            Error::corruption(format!("hash id {} missing from lookup {}", hex::encode(id), self.name))
        })
    }

    /// Number of entries.
    pub fn len(&self, txn: &dyn Txn) -> Result<u64> {
        txn.count(self.db)
    }

    /// Deletes entries not in `used`. Returns how many were removed.
    pub fn delete_unused(&self, txn: &mut WriteTxn<'_>, used: &HashSet<Vec<u8>>) -> Result<usize> {
        let mut removed = 0;
        for entry in txn.iter(self.db) {
            let (key, _) = entry?;
            if !used.contains(&key) {
                txn.delete(self.db, &key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("Removed {} unused entries from hash lookup {}", removed, self.name);
        }
        Ok(removed)
    }
}

fn decode_u32(raw: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| Error::corruption(format!("expected a 4 byte id, found {} bytes", raw.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvOptions;
    use tempfile::TempDir;

    #[test]
    fn test_uid_ids_are_stable_and_never_reused() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let lookup = UidLookup::open(&env, "key").unwrap();

        let (a, b, a_again) = env
            .write(|txn| {
                let a = lookup.get_or_create(txn, b"alpha")?;
                let b = lookup.get_or_create(txn, b"beta")?;
                Ok((a, b, lookup.get_or_create(txn, b"alpha")?))
            })
            .unwrap();
        assert_eq!(a, a_again);
        assert_ne!(a, b);

        let txn = env.begin_read();
        assert_eq!(lookup.get(&txn, b).unwrap(), b"beta".to_vec());
        assert_eq!(lookup.get_id(&txn, b"gamma").unwrap(), None);

        let used: HashSet<u32> = [a].into_iter().collect();
        let removed = env.write(|txn| lookup.delete_unused(txn, &used)).unwrap();
        assert_eq!(removed, 1);

        let c = env.write(|txn| lookup.get_or_create(txn, b"beta")).unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_uid_rejects_oversized_content() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let lookup = UidLookup::open(&env, "key").unwrap();
        let long = vec![b'x'; MAX_KEY_LENGTH + 1];
        let result = env.write(|txn| lookup.get_or_create(txn, &long));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_hash_lookup_disambiguates_collisions() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let lookup = HashLookup::open(&env, "value", HashLength::Integer).unwrap();

        // Plant a colliding entry under the hash of "second".
        let mut planted = lookup.hash(b"second");
        planted.extend_from_slice(&0u16.to_be_bytes());
        env.write(|txn| txn.put(lookup.db, &planted, b"impostor")).unwrap();

        let id = env.write(|txn| lookup.get_or_create(txn, b"second")).unwrap();
        assert_eq!(id.len(), lookup.id_len());
        assert_eq!(&id[..4], &planted[..4]);
        assert_eq!(&id[4..], &1u16.to_be_bytes());

        let txn = env.begin_read();
        assert_eq!(lookup.get(&txn, &id).unwrap(), b"second".to_vec());
        assert_eq!(lookup.get(&txn, &planted).unwrap(), b"impostor".to_vec());
        assert_eq!(lookup.get_id(&txn, b"second").unwrap(), Some(id));
    }
}
