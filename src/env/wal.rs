//! Write-ahead log for shard commits.
//!
//! Every committed write transaction is appended as one logical entry: a
//! bincode-encoded [`WalBatch`]. Entries are framed into records carrying a
//! CRC32 checksum; entries larger than [`MAX_RECORD_SIZE`] are fragmented.
//!
//! ```text
//! record := [checksum: u32][length: u16][type: u8][data: length bytes]
//! ```
//!
//! On open the log is replayed into the memtable. A torn tail (crash during
//! append) ends recovery at the last complete entry.

use crate::env::batch::WalBatch;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Maximum size of a single record's data portion
pub const MAX_RECORD_SIZE: usize = 32 * 1024;

/// Size of the record header (checksum + length + type)
pub const HEADER_SIZE: usize = 7;

/// Record types for entries that span multiple records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Complete entry in a single record
    Full = 1,
    /// First fragment of a multi-record entry
    First = 2,
    /// Middle fragment of a multi-record entry
    Middle = 3,
    /// Last fragment of a multi-record entry
    Last = 4,
}

impl RecordType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            _ => Err(Error::corruption(format!("Invalid record type: {}", value))),
        }
    }
}

fn checksum(record_type: RecordType, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[record_type as u8]);
    hasher.update(data);
    hasher.finalize()
}

fn encode_record(record_type: RecordType, data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    buf.put_u32_le(checksum(record_type, data));
    buf.put_u16_le(data.len() as u16);
    buf.put_u8(record_type as u8);
    buf.put_slice(data);
    buf
}

/// Generate a WAL filename for a given file number
pub fn wal_filename(number: u64) -> String {
    format!("{:06}.log", number)
}

/// Appends commit batches to a log file.
pub struct WalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    file_size: u64,
}

impl WalWriter {
    /// Opens the WAL file in append mode, creating it if it doesn't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file_size = file.metadata()?.len();
        Ok(Self { path, writer: BufWriter::new(file), file_size })
    }

    /// Appends one committed batch.
    pub fn append(&mut self, batch: &WalBatch) -> Result<()> {
        let data = bincode::serialize(batch)?;
        self.append_entry(&data)
    }

    fn append_entry(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut offset = 0;
        while offset < data.len() {
            let chunk_size = (data.len() - offset).min(MAX_RECORD_SIZE);
            let record_type = if data.len() <= MAX_RECORD_SIZE {
                RecordType::Full
            } else if offset == 0 {
                RecordType::First
            } else if offset + chunk_size >= data.len() {
                RecordType::Last
            } else {
                RecordType::Middle
            };

            let encoded = encode_record(record_type, &data[offset..offset + chunk_size]);
            self.writer.write_all(&encoded)?;
            self.file_size += encoded.len() as u64;
            offset += chunk_size;
        }
        Ok(())
    }

    /// Pushes buffered records to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the log.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Current file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Reads commit batches back from a log file.
pub struct WalReader {
    reader: BufReader<File>,
    position: u64,
}

impl WalReader {
    /// Opens a WAL file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self { reader: BufReader::new(file), position: 0 })
    }

    fn read_record(&mut self) -> Result<Option<(RecordType, Vec<u8>)>> {
        let mut header = [0u8; HEADER_SIZE];
        match self.reader.read_exact(&mut header) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        }

        let mut cursor = &header[..];
        let stored = cursor.get_u32_le();
        let length = cursor.get_u16_le() as usize;
        let record_type = RecordType::from_u8(cursor.get_u8())?;

        let mut data = vec![0u8; length];
        self.reader.read_exact(&mut data).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::corruption("Truncated record"),
            _ => Error::Io(e),
        })?;
        self.position += (HEADER_SIZE + length) as u64;

        let actual = checksum(record_type, &data);
        if actual != stored {
            return Err(Error::ChecksumMismatch { expected: stored, actual });
        }
        Ok(Some((record_type, data)))
    }

    /// Reads the next complete entry, reassembling fragments.
    pub fn read_entry(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembled: Option<Vec<u8>> = None;
        loop {
            let (record_type, data) = match self.read_record()? {
                Some(r) => r,
                None if assembled.is_some() => {
                    return Err(Error::corruption("EOF while expecting continuation record"))
                }
                None => return Ok(None),
            };

            match (record_type, assembled.as_mut()) {
                (RecordType::Full, None) => return Ok(Some(data)),
                (RecordType::First, None) => assembled = Some(data),
                (RecordType::Middle, Some(buf)) => buf.extend_from_slice(&data),
                (RecordType::Last, Some(buf)) => {
                    buf.extend_from_slice(&data);
                    return Ok(assembled);
                }
                (record_type, _) => {
                    return Err(Error::corruption(format!(
                        "Unexpected {:?} record at position {}",
                        record_type, self.position
                    )))
                }
            }
        }
    }

    /// Replays every intact batch. Stops at the first damaged record.
    pub fn recover(&mut self) -> Result<Vec<WalBatch>> {
        let mut batches = Vec::new();
        loop {
            match self.read_entry() {
                Ok(Some(data)) => match bincode::deserialize::<WalBatch>(&data) {
                    Ok(batch) => batches.push(batch),
                    Err(e) => {
                        log::warn!("Undecodable WAL entry at position {}: {}", self.position, e);
                        break;
                    }
                },
                Ok(None) => break,
                Err(Error::Corruption(msg)) => {
                    log::warn!("WAL corruption at position {}: {}", self.position, msg);
                    break;
                }
                Err(Error::ChecksumMismatch { expected, actual }) => {
                    log::warn!(
                        "WAL checksum mismatch at position {}: expected {:#x}, got {:#x}",
                        self.position,
                        expected,
                        actual
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::batch::WriteOp;
    use tempfile::TempDir;

    fn batch(sequence: u64, key: &[u8], value: Vec<u8>) -> WalBatch {
        WalBatch { sequence, ops: vec![WriteOp::Put { key: key.to_vec(), value }] }
    }

    #[test]
    fn test_wal_write_and_recover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_filename(1));

        {
            let mut writer = WalWriter::open(&path).unwrap();
            writer.append(&batch(1, b"a", b"1".to_vec())).unwrap();
            writer.append(&batch(2, b"b", b"2".to_vec())).unwrap();
            writer.sync().unwrap();
        }

        let batches = WalReader::open(&path).unwrap().recover().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].sequence, 2);
    }

    #[test]
    fn test_wal_fragmented_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_filename(1));
        let big = vec![7u8; MAX_RECORD_SIZE * 3 + 11];

        {
            let mut writer = WalWriter::open(&path).unwrap();
            writer.append(&batch(1, b"big", big.clone())).unwrap();
            writer.sync().unwrap();
        }

        let batches = WalReader::open(&path).unwrap().recover().unwrap();
        assert_eq!(batches.len(), 1);
        match &batches[0].ops[0] {
            WriteOp::Put { value, .. } => assert_eq!(value, &big),
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_wal_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_filename(1));

        {
            let mut writer = WalWriter::open(&path).unwrap();
            writer.append(&batch(1, b"a", b"1".to_vec())).unwrap();
            writer.append(&batch(2, b"b", b"2".to_vec())).unwrap();
            writer.sync().unwrap();
        }

        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let batches = WalReader::open(&path).unwrap().recover().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].sequence, 1);
    }
}
