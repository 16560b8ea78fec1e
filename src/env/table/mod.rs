//! Immutable sorted tables.
//!
//! A table is written once when the memtable is flushed (or when compaction
//! rewrites the store) and never modified afterwards. Tables are read through
//! a memory mapping.
//!
//! ## File Format
//!
//! ```text
//! [Data Block 1][trailer]
//! [Data Block 2][trailer]
//! ...
//! [Index Block][trailer]
//! [Footer]
//! ```
//!
//! Each block is followed by a 5 byte trailer: the compression type (u8) and a
//! CRC32 of the stored block bytes (u32). The index block maps the last key of
//! every data block to that block's handle.
//!
//! Stored values carry a one byte tag ([`TAG_VALUE`] or [`TAG_TOMBSTONE`]) so
//! deletions flushed from the memtable keep shadowing older tables.

mod block;
mod builder;
mod reader;

pub use block::{BlockBuilder, BLOCK_TRAILER_SIZE};
pub use builder::TableBuilder;
pub use reader::{Table, TableIter, TableRevIter};

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

/// Magic number at the end of every table file ("PLANBTBL").
pub const MAGIC_NUMBER: u64 = 0x504C_414E_4254_424C;

/// Footer size: index handle (16) + entry count (8) + magic (8).
pub const FOOTER_SIZE: usize = 32;

/// Default block size (4KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Value tag for a live entry.
pub const TAG_VALUE: u8 = 1;

/// Value tag for a deletion marker.
pub const TAG_TOMBSTONE: u8 = 0;

/// File name of table `number`.
pub fn table_filename(number: u64) -> String {
    format!("{:06}.sst", number)
}

/// Location of a block within a table file, trailer included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    /// Offset of the block in the file
    pub offset: u64,
    /// Size of the block in bytes, trailer included
    pub size: u64,
}

impl BlockHandle {
    /// Create a new BlockHandle
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Encode to 16 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
        buf
    }

    /// Decode from 16 bytes.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::corruption("BlockHandle too short"));
        }
        let offset = data.get_u64_le();
        let size = data.get_u64_le();
        Ok(Self { offset, size })
    }
}

/// Fixed-size structure at the end of a table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    /// Handle to the index block
    pub index_handle: BlockHandle,
    /// Number of entries in the table
    pub num_entries: u64,
}

impl Footer {
    /// Encode the footer to [`FOOTER_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        buf.extend_from_slice(&self.index_handle.encode());
        buf.put_u64_le(self.num_entries);
        buf.put_u64_le(MAGIC_NUMBER);
        buf
    }

    /// Decode a footer, verifying the magic number.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(Error::corruption(format!(
                "Footer size mismatch: expected {}, got {}",
                FOOTER_SIZE,
                data.len()
            )));
        }
        let index_handle = BlockHandle::decode(&data[..16])?;
        let mut rest = &data[16..];
        let num_entries = rest.get_u64_le();
        let magic = rest.get_u64_le();
        if magic != MAGIC_NUMBER {
            return Err(Error::corruption(format!(
                "Invalid table magic number: expected {:#x}, got {:#x}",
                MAGIC_NUMBER, magic
            )));
        }
        Ok(Self { index_handle, num_entries })
    }
}

/// Prefixes a value with its tag.
pub fn tag_value(value: Option<&[u8]>) -> Vec<u8> {
    match value {
        Some(v) => {
            let mut buf = Vec::with_capacity(v.len() + 1);
            buf.push(TAG_VALUE);
            buf.extend_from_slice(v);
            buf
        }
        None => vec![TAG_TOMBSTONE],
    }
}

/// Splits a stored value into `Some(value)` or `None` for a tombstone.
pub fn untag_value(stored: &[u8]) -> Result<Option<Vec<u8>>> {
    match stored.split_first() {
        Some((&TAG_VALUE, value)) => Ok(Some(value.to_vec())),
        Some((&TAG_TOMBSTONE, _)) => Ok(None),
        Some((tag, _)) => Err(Error::corruption(format!("Invalid value tag: {}", tag))),
        None => Err(Error::corruption("Empty stored value")),
    }
}
