//! Block format for tables.
//!
//! ```text
//! [Entry 1]
//! ...
//! [Entry N]
//! [Num Entries: u32]
//! ```
//!
//! Each entry:
//! ```text
//! [shared_key_len: u32]     // Length of shared prefix with previous key
//! [unshared_key_len: u32]   // Length of unshared key suffix
//! [value_len: u32]          // Length of value
//! [unshared_key: bytes]     // Key suffix
//! [value: bytes]            // Value data
//! ```
//!
//! On disk a block is followed by `[compression: u8][crc32: u32]`.

use crate::config::CompressionType;
use crate::env::table::BlockHandle;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Size of the per-block trailer (compression type + checksum).
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Builds a block with prefix compression.
pub struct BlockBuilder {
    buffer: BytesMut,
    last_key: Vec<u8>,
    count: u32,
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBuilder {
    /// Create a new BlockBuilder
    pub fn new() -> Self {
        Self { buffer: BytesMut::new(), last_key: Vec::new(), count: 0 }
    }

    /// Add a key-value pair. Keys must arrive in ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(self.count == 0 || key > self.last_key.as_slice());

        let shared = shared_prefix_len(&self.last_key, key);
        self.buffer.put_u32_le(shared as u32);
        self.buffer.put_u32_le((key.len() - shared) as u32);
        self.buffer.put_u32_le(value.len() as u32);
        self.buffer.put_slice(&key[shared..]);
        self.buffer.put_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.count += 1;
    }

    /// Finish building and return the block data.
    pub fn finish(mut self) -> Vec<u8> {
        self.buffer.put_u32_le(self.count);
        self.buffer.to_vec()
    }

    /// Current encoded size.
    pub fn current_size(&self) -> usize {
        self.buffer.len() + 4
    }

    /// Check if the block is empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Last key added.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Decodes every entry of a block.
pub fn decode_block(data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if data.len() < 4 {
        return Err(Error::corruption("Block too small"));
    }
    let (mut body, mut trailer) = data.split_at(data.len() - 4);
    let count = trailer.get_u32_le() as usize;

    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(count);
    for _ in 0..count {
        if body.remaining() < 12 {
            return Err(Error::corruption("Truncated block entry header"));
        }
        let shared = body.get_u32_le() as usize;
        let unshared = body.get_u32_le() as usize;
        let value_len = body.get_u32_le() as usize;
        if body.remaining() < unshared + value_len {
            return Err(Error::corruption("Truncated block entry"));
        }

        let mut key = match entries.last() {
            Some((prev, _)) if shared <= prev.len() => prev[..shared].to_vec(),
            None if shared == 0 => Vec::new(),
            _ => return Err(Error::corruption("Invalid shared key length")),
        };
        key.extend_from_slice(&body[..unshared]);
        body.advance(unshared);
        let value = body[..value_len].to_vec();
        body.advance(value_len);
        entries.push((key, value));
    }
    Ok(entries)
}

/// Compresses a block and appends its trailer, returning the bytes to write.
pub fn seal_block(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    let mut stored = match compression {
        CompressionType::None => data.to_vec(),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::internal(format!("Compression failed: {}", e)))?,
    };
    let checksum = crc32fast::hash(&stored);
    stored.push(compression as u8);
    stored.extend_from_slice(&checksum.to_le_bytes());
    Ok(stored)
}

/// Reads the block at `handle` from a mapped table, verifying its checksum.
pub fn read_block(file: &[u8], handle: &BlockHandle) -> Result<Vec<u8>> {
    let start = handle.offset as usize;
    let end = start + handle.size as usize;
    if handle.size < BLOCK_TRAILER_SIZE as u64 || end > file.len() {
        return Err(Error::corruption(format!(
            "Block handle out of range: offset {}, size {}",
            handle.offset, handle.size
        )));
    }

    let raw = &file[start..end];
    let data_size = raw.len() - BLOCK_TRAILER_SIZE;
    let data = &raw[..data_size];
    let compression = raw[data_size];
    let mut checksum_bytes = &raw[data_size + 1..];
    let stored = checksum_bytes.get_u32_le();

    let actual = crc32fast::hash(data);
    if actual != stored {
        return Err(Error::ChecksumMismatch { expected: stored, actual });
    }

    match CompressionType::from_u8(compression) {
        Some(CompressionType::None) => Ok(data.to_vec()),
        #[cfg(feature = "snappy")]
        Some(CompressionType::Snappy) => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::corruption(format!("Decompression failed: {}", e))),
        None => Err(Error::corruption(format!("Unknown compression type: {}", compression))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_prefix_compression() {
        let mut builder = BlockBuilder::new();
        builder.add(b"apple", b"1");
        builder.add(b"application", b"2");
        builder.add(b"banana", b"");
        assert_eq!(builder.last_key(), b"banana");

        let entries = decode_block(&builder.finish()).unwrap();
        assert_eq!(
            entries,
            vec![
                (b"apple".to_vec(), b"1".to_vec()),
                (b"application".to_vec(), b"2".to_vec()),
                (b"banana".to_vec(), Vec::new()),
            ]
        );
    }

    #[test]
    fn test_sealed_block_checksum() {
        let mut builder = BlockBuilder::new();
        builder.add(b"k", b"v");
        let data = builder.finish();

        let mut sealed = seal_block(&data, CompressionType::default()).unwrap();
        let handle = BlockHandle::new(0, sealed.len() as u64);
        assert_eq!(read_block(&sealed, &handle).unwrap(), data);

        sealed[0] ^= 0xFF;
        assert!(matches!(read_block(&sealed, &handle), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_block() {
        assert!(decode_block(&[1, 0]).is_err());
        assert!(decode_block(&[0, 0, 0, 0, 0, 1, 0, 0]).is_err());
    }
}
