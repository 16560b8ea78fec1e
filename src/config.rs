//! Configuration options for PlanB environments and the shard root.

use std::path::{Path, PathBuf};

/// Default cap on the size of a single shard (10 GiB).
pub const DEFAULT_MAX_STORE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Configuration options for opening a shard environment.
#[derive(Debug, Clone)]
pub struct EnvOptions {
    /// Create the environment if it doesn't exist.
    /// Ignored when `read_only` is set.
    /// Default: true
    pub create_if_missing: bool,

    /// Open the environment without write access.
    /// Default: false
    pub read_only: bool,

    /// Size threshold for flushing the MemTable to a table file (in bytes).
    /// Default: 4MB
    pub memtable_size: usize,

    /// Block size for table files (in bytes).
    /// Default: 4KB
    pub block_size: usize,

    /// Compression algorithm for table blocks.
    /// Default: CompressionType::Snappy
    pub compression: CompressionType,

    /// Sync the WAL to disk on every commit.
    /// Default: true
    pub sync_wal: bool,

    /// Upper bound on tables plus in-memory data, in bytes.
    /// Default: 10GiB
    pub max_store_size: u64,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            read_only: false,
            memtable_size: 4 * 1024 * 1024, // 4MB
            block_size: 4 * 1024,           // 4KB
            compression: CompressionType::default(),
            sync_wal: true,
            max_store_size: DEFAULT_MAX_STORE_SIZE,
        }
    }
}

/// Compression algorithms supported for table blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,

    /// Snappy compression (fast, moderate compression ratio).
    #[cfg(feature = "snappy")]
    Snappy = 1,
}

impl CompressionType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            #[cfg(feature = "snappy")]
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy")]
        return CompressionType::Snappy;

        #[cfg(not(feature = "snappy"))]
        CompressionType::None
    }
}

impl EnvOptions {
    /// Creates a new EnvOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the environment if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Opens the environment read only.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the MemTable size threshold.
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    /// Sets the block size for table files.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Enables or disables syncing the WAL on commit.
    pub fn sync_wal(mut self, value: bool) -> Self {
        self.sync_wal = value;
        self
    }

    /// Sets the maximum store size.
    pub fn max_store_size(mut self, size: u64) -> Self {
        self.max_store_size = size;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.memtable_size == 0 {
            return Err(crate::Error::invalid_argument("memtable_size must be > 0"));
        }
        if self.block_size == 0 {
            return Err(crate::Error::invalid_argument("block_size must be > 0"));
        }
        if self.max_store_size == 0 {
            return Err(crate::Error::invalid_argument("max_store_size must be > 0"));
        }
        Ok(())
    }
}

/// Node-level configuration: where shards live and how merging runs.
#[derive(Debug, Clone)]
pub struct PlanBConfig {
    /// Root directory holding `shards/`, `merging/` and `scratch/`.
    pub path: PathBuf,

    /// Worker threads used to merge independent maps in parallel.
    /// Default: 4
    pub merge_threads: usize,

    /// Bound of the merge work queue.
    /// Default: 64
    pub merge_queue_size: usize,

    /// Attempts made for a part that fails with a transient error.
    /// Default: 3
    pub merge_retries: u32,

    /// Environment options used when opening shards.
    pub env: EnvOptions,
}

impl PlanBConfig {
    /// Creates a config rooted at `path` with default values.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            merge_threads: 4,
            merge_queue_size: 64,
            merge_retries: 3,
            env: EnvOptions::default(),
        }
    }

    /// Sets the number of merge worker threads.
    pub fn merge_threads(mut self, threads: usize) -> Self {
        self.merge_threads = threads;
        self
    }

    /// Sets the bound of the merge work queue.
    pub fn merge_queue_size(mut self, size: usize) -> Self {
        self.merge_queue_size = size;
        self
    }

    /// Sets how often a transient merge failure is retried.
    pub fn merge_retries(mut self, retries: u32) -> Self {
        self.merge_retries = retries;
        self
    }

    /// Sets the environment options.
    pub fn env(mut self, env: EnvOptions) -> Self {
        self.env = env;
        self
    }

    /// Validates the config and returns an error if anything is invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.merge_threads == 0 {
            return Err(crate::Error::invalid_argument("merge_threads must be > 0"));
        }
        if self.merge_queue_size == 0 {
            return Err(crate::Error::invalid_argument("merge_queue_size must be > 0"));
        }
        self.env.validate()
    }
}
