//! Writes a table file from entries in ascending key order.

use crate::config::CompressionType;
use crate::env::table::block::{seal_block, BlockBuilder};
use crate::env::table::{BlockHandle, Footer, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// TableBuilder builds a table file.
pub struct TableBuilder {
    path: PathBuf,
    writer: BufWriter<File>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    offset: u64,
    num_entries: u64,
    block_size: usize,
    compression: CompressionType,
}

impl TableBuilder {
    /// Creates the file at `path`, truncating anything already there.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            data_block: BlockBuilder::new(),
            index_block: BlockBuilder::new(),
            last_key: Vec::new(),
            offset: 0,
            num_entries: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            compression: CompressionType::default(),
        })
    }

    /// Set the block size (default: 4KB)
    pub fn set_block_size(&mut self, size: usize) {
        self.block_size = size;
    }

    /// Set the compression type
    pub fn set_compression(&mut self, compression: CompressionType) {
        self.compression = compression;
    }

    /// Adds an entry. Keys must be strictly ascending.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.num_entries > 0 && key <= self.last_key.as_slice() {
            return Err(Error::invalid_argument("Keys must be added in sorted order"));
        }

        self.data_block.add(key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;

        if self.data_block.current_size() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn write_block(&mut self, data: &[u8]) -> Result<BlockHandle> {
        let sealed = seal_block(data, self.compression)?;
        self.writer.write_all(&sealed)?;
        let handle = BlockHandle::new(self.offset, sealed.len() as u64);
        self.offset += sealed.len() as u64;
        Ok(handle)
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(&mut self.data_block);
        let last_key = block.last_key().to_vec();
        let handle = self.write_block(&block.finish())?;
        self.index_block.add(&last_key, &handle.encode());
        Ok(())
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Writes the index block and footer, syncs, and returns the file size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_data_block()?;

        let index = std::mem::take(&mut self.index_block).finish();
        let index_handle = self.write_block(&index)?;
        let footer = Footer { index_handle, num_entries: self.num_entries };
        let encoded = footer.encode();
        self.writer.write_all(&encoded)?;
        self.offset += encoded.len() as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        log::debug!("Finished table {:?}: {} entries, {} bytes", self.path, self.num_entries, self.offset);
        Ok(self.offset)
    }
}
