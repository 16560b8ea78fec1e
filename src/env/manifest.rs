//! The `MANIFEST` file: which tables and WAL make up an environment.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Name of the manifest file inside an environment directory.
pub const MANIFEST_FILE: &str = "MANIFEST";

const MANIFEST_VERSION: u32 = 1;

/// A table referenced by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    /// File number (`{number:06}.sst`)
    pub number: u64,
    /// File size in bytes
    pub size: u64,
    /// Entry count, tombstones included
    pub entries: u64,
}

/// Persistent environment metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version
    pub version: u32,
    /// Next file number to hand out for tables and logs
    pub next_file_number: u64,
    /// Number of the live WAL
    pub log_number: u64,
    /// Highest sequence contained in the tables
    pub last_sequence: u64,
    /// Tables, newest first
    pub tables: Vec<TableMeta>,
    /// Named sub-database registry
    pub dbs: BTreeMap<String, u32>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            next_file_number: 2,
            log_number: 1,
            last_sequence: 0,
            tables: Vec::new(),
            dbs: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Reads the manifest of the environment at `dir`.
    ///
    /// Garbled content is reported as a corrupt shard.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let data = fs::read(&path)?;
        let manifest: Manifest = serde_json::from_slice(&data)
            .map_err(|e| Error::corrupt_shard(dir, format!("unreadable manifest: {}", e)))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::corrupt_shard(
                dir,
                format!("unsupported manifest version {}", manifest.version),
            ));
        }
        Ok(manifest)
    }

    /// Atomically replaces the manifest: write a temp file, sync, rename.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    /// Hands out a new file number.
    pub fn allocate_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Next free sub-database id.
    pub fn next_db_id(&self) -> u32 {
        self.dbs.values().max().map_or(1, |max| max + 1)
    }

    /// Total size of the referenced tables.
    pub fn table_bytes(&self) -> u64 {
        self.tables.iter().map(|t| t.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_store_load() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::default();
        manifest.dbs.insert("data".to_string(), manifest.next_db_id());
        manifest.tables.push(TableMeta { number: 3, size: 100, entries: 4 });
        let number = manifest.allocate_file_number();
        assert_eq!(number, 2);

        manifest.store(dir.path()).unwrap();
        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.next_db_id(), 2);
        assert_eq!(loaded.table_bytes(), 100);
    }

    #[test]
    fn test_garbled_manifest_is_corrupt_shard() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{ not json").unwrap();
        assert!(matches!(Manifest::load(dir.path()), Err(Error::CorruptShard { .. })));
    }
}
