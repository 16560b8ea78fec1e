//! Error types for the PlanB state-storage engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The result type used throughout PlanB.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for PlanB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption was detected while reading a record or block.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// A shard environment could not be opened because its files are damaged.
    #[error("Corrupt shard at {path:?}: {message}")]
    CorruptShard {
        /// Directory of the shard.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },

    /// The requested shard, document or file does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A value does not fit the configured key or value schema.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A value exceeds the configured maximum size.
    #[error("Size limit exceeded: {size} bytes > {limit} bytes")]
    SizeLimit {
        /// Size of the rejected value.
        size: usize,
        /// The configured limit.
        limit: usize,
    },

    /// Two shards with incompatible settings were merged.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A commit would grow the shard past its `max_store_size`.
    #[error("Store full: {used} bytes used, limit {limit} bytes")]
    StoreFull {
        /// Bytes the store would occupy after the commit.
        used: u64,
        /// The configured limit.
        limit: u64,
    },

    /// The environment is already open for writing elsewhere.
    #[error("Environment is locked by another writer: {0:?}")]
    Locked(PathBuf),

    /// A write was attempted on a read-only environment.
    #[error("Environment is read only: {0:?}")]
    ReadOnly(PathBuf),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A checksum mismatch was detected.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The expected checksum value.
        expected: u32,
        /// The actual checksum value.
        actual: u32,
    },

    /// Merging a part into a shard failed.
    #[error("Failed to merge part {part}: {message}")]
    PartMerge {
        /// File name of the part.
        part: String,
        /// Why it failed.
        message: String,
    },

    /// The operation was cancelled by its task context.
    #[error("Cancelled")]
    Cancelled,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new corrupt shard error.
    pub fn corrupt_shard(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Error::CorruptShard { path: path.into(), message: msg.into() }
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Creates a new schema mismatch error.
    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        Error::SchemaMismatch(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Returns true for failures that are worth retrying in place.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Error::Io(e),
            other => Error::Corruption(format!("zip archive: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corruption("test corruption");
        assert_eq!(err.to_string(), "Data corruption: test corruption");

        let err = Error::ChecksumMismatch { expected: 0x12345678, actual: 0x87654321 };
        assert!(err.to_string().contains("0x12345678"));
        assert!(err.to_string().contains("0x87654321"));

        let err = Error::SizeLimit { size: 10, limit: 4 };
        assert_eq!(err.to_string(), "Size limit exceeded: 10 bytes > 4 bytes");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_transient());

        let err: Error = io::Error::new(io::ErrorKind::Interrupted, "again").into();
        assert!(err.is_transient());
    }
}
