//! Zip archives of shard directories and their content hashes.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| Error::internal(format!("{:?} is outside {:?}: {}", path, root, e)))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(name);
        }
    }
    Ok(())
}

/// Writes every file under `dir` into a new zip at `zip_path`, with names
/// relative to `dir`. Returns the number of files written.
pub fn zip_dir(dir: &Path, zip_path: &Path) -> Result<usize> {
    let mut names = Vec::new();
    collect_files(dir, dir, &mut names)?;

    let mut writer = ZipWriter::new(BufWriter::new(File::create(zip_path)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for name in &names {
        writer.start_file(name.as_str(), options)?;
        let mut file = File::open(dir.join(name))?;
        io::copy(&mut file, &mut writer)?;
    }
    let mut out = writer.finish()?;
    out.flush()?;
    log::debug!("Zipped {} files from {:?} into {:?}", names.len(), dir, zip_path);
    Ok(names.len())
}

/// Extracts `zip_path` into `dest`, creating it if needed.
pub fn unzip(zip_path: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = ZipArchive::new(BufReader::new(File::open(zip_path)?))?;
    archive.extract(dest)?;
    Ok(())
}

/// SHA-256 of the file at `path`, as lowercase hex.
pub fn file_hash(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
