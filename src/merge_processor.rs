//! Background merging of part archives into shards.
//!
//! A part is a zip whose top-level directories are shard directories named by
//! map uuid. Parts wait in `merging/` under a name derived from their
//! [`FileDescriptor`], so the queue survives a restart. Each pass unzips the
//! queued parts into `scratch/`, groups their sub-shards by target map and
//! hands the groups to a bounded pool of workers: different maps merge in
//! parallel, the parts of one map merge in queue order.
//!
//! The content hash of a part is recorded in every target shard in the same
//! transaction as the merged rows, so delivering a part twice changes nothing.
//! A part that fails for any map stays queued for the next pass; maps it
//! already reached skip it then.

use crate::archive;
use crate::config::PlanBConfig;
use crate::context::SecurityContext;
use crate::db::now_millis;
use crate::error::{Error, Result};
use crate::shard_manager::{ShardManager, StatePaths};
use crossbeam::channel;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PART_EXTENSION: &str = "zip";
const BASE_BACKOFF: Duration = Duration::from_millis(10);

/// Identity of a queued part.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileDescriptor {
    /// When the part was created, epoch millis
    pub create_time_ms: u64,
    /// Producer's sequence number for the part
    pub meta_id: u64,
    /// SHA-256 of the archive, lowercase hex
    pub hash: String,
}

impl FileDescriptor {
    /// A descriptor with explicit fields.
    pub fn new(create_time_ms: u64, meta_id: u64, hash: impl Into<String>) -> Self {
        Self { create_time_ms, meta_id, hash: hash.into() }
    }

    /// Describes the archive at `path`, created now.
    pub fn for_file(path: &Path, meta_id: u64) -> Result<Self> {
        let create_time_ms = u64::try_from(now_millis()).unwrap_or(0);
        Ok(Self::new(create_time_ms, meta_id, archive::file_hash(path)?))
    }

    /// Queue file name. Names sort in creation order.
    pub fn file_name(&self) -> String {
        format!("{:020}_{:020}_{}.{}", self.create_time_ms, self.meta_id, self.hash, PART_EXTENSION)
    }

    /// Parses a name produced by [`file_name`](Self::file_name).
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || Error::invalid_argument(format!("{:?} is not a part file name", name));
        let stem = name
            .strip_suffix(PART_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;
        let mut fields = stem.splitn(3, '_');
        let create_time_ms = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let meta_id = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let hash = fields.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        Ok(Self::new(create_time_ms, meta_id, hash))
    }
}

/// Outcome of one [`MergeProcessor::merge_current`] pass.
#[derive(Debug, Default)]
pub struct MergeSummary {
    /// Parts fully merged and removed from the queue
    pub parts_merged: usize,
    /// Parts left queued after a failure
    pub parts_failed: usize,
    /// Sub-shards merged into their map
    pub maps_merged: usize,
    /// Sub-shards skipped because their map had merged the part before
    pub maps_skipped: usize,
    /// One [`Error::PartMerge`] per failure
    pub failures: Vec<Error>,
}

#[derive(Debug, Clone)]
struct PartDir {
    name: String,
    hash: String,
    dir: PathBuf,
}

struct MapJob {
    uuid: String,
    parts: Vec<PartDir>,
}

struct MapResult {
    part: String,
    uuid: String,
    outcome: Result<bool>,
}

/// Queues part archives and merges them into shards.
pub struct MergeProcessor {
    manager: Arc<ShardManager>,
    security: Arc<dyn SecurityContext>,
    paths: StatePaths,
    threads: usize,
    queue_size: usize,
    retries: u32,
    queue: Mutex<BTreeMap<String, FileDescriptor>>,
    pass: Mutex<()>,
}

impl std::fmt::Debug for MergeProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeProcessor")
            .field("paths", &self.paths)
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl MergeProcessor {
    /// Creates a processor and rebuilds its queue from `merging/`.
    pub fn new(config: &PlanBConfig, manager: Arc<ShardManager>, security: Arc<dyn SecurityContext>) -> Result<Self> {
        config.validate()?;
        let paths = manager.paths().clone();
        paths.create_dirs()?;

        let mut queue = BTreeMap::new();
        for entry in fs::read_dir(paths.merging_dir())? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            match FileDescriptor::parse(&name) {
                Ok(fd) => {
                    queue.insert(name, fd);
                }
                Err(e) => log::warn!("Ignoring {:?} in merge queue: {}", name, e),
            }
        }
        if !queue.is_empty() {
            log::info!("Recovered {} queued parts", queue.len());
        }

        Ok(Self {
            manager,
            security,
            paths,
            threads: config.merge_threads,
            queue_size: config.merge_queue_size,
            retries: config.merge_retries.max(1),
            queue: Mutex::new(queue),
            pass: Mutex::new(()),
        })
    }

    /// Number of queued parts.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Queues the part archive at `path`. A final part is moved into the
    /// queue; otherwise it is copied and the caller keeps the original.
    pub fn add(&self, fd: &FileDescriptor, path: &Path, is_final: bool) -> Result<()> {
        let name = fd.file_name();
        let dest = self.paths.merging_dir().join(&name);
        if is_final {
            if let Err(e) = fs::rename(path, &dest) {
                log::debug!("Rename of {:?} failed ({}), copying instead", path, e);
                fs::copy(path, &dest)?;
                fs::remove_file(path)?;
            }
        } else {
            fs::copy(path, &dest)?;
        }
        log::debug!("Queued part {}", name);
        self.queue.lock().insert(name, fd.clone());
        Ok(())
    }

    /// Merges every queued part.
    pub fn merge_current(&self) -> Result<MergeSummary> {
        let _pass = self.pass.lock();
        let queued: Vec<(String, FileDescriptor)> =
            self.queue.lock().iter().map(|(name, fd)| (name.clone(), fd.clone())).collect();
        let mut summary = MergeSummary::default();
        if queued.is_empty() {
            return Ok(summary);
        }

        let mut failed: HashSet<String> = HashSet::new();
        let mut unpacked = Vec::new();
        let mut jobs: BTreeMap<String, Vec<PartDir>> = BTreeMap::new();
        for (name, fd) in queued {
            match self.unpack(&name) {
                Ok((scratch, maps)) => {
                    for (uuid, dir) in maps {
                        jobs.entry(uuid).or_default().push(PartDir { name: name.clone(), hash: fd.hash.clone(), dir });
                    }
                    unpacked.push((name, scratch));
                }
                Err(e) => {
                    log::warn!("Unable to unpack part {}: {}", name, e);
                    summary.failures.push(Error::PartMerge { part: name.clone(), message: e.to_string() });
                    failed.insert(name);
                }
            }
        }

        let jobs = jobs.into_iter().map(|(uuid, parts)| MapJob { uuid, parts }).collect();
        for result in self.run_jobs(jobs) {
            match result.outcome {
                Ok(true) => summary.maps_merged += 1,
                Ok(false) => summary.maps_skipped += 1,
                Err(e) => {
                    log::warn!("Merging part {} into map {} failed: {}", result.part, result.uuid, e);
                    summary.failures.push(Error::PartMerge {
                        part: result.part.clone(),
                        message: format!("map {}: {}", result.uuid, e),
                    });
                    failed.insert(result.part);
                }
            }
        }

        for (name, scratch) in unpacked {
            if let Err(e) = fs::remove_dir_all(&scratch) {
                log::warn!("Unable to remove scratch directory {:?}: {}", scratch, e);
            }
            if failed.contains(&name) {
                continue;
            }
            // The rows are committed; a leftover archive is skipped by hash
            // if a restart queues it again.
            let archive = self.paths.merging_dir().join(&name);
            if let Err(e) = fs::remove_file(&archive) {
                log::warn!("Unable to remove merged part {:?}: {}", archive, e);
            }
            self.queue.lock().remove(&name);
            summary.parts_merged += 1;
        }
        summary.parts_failed = failed.len();
        log::info!(
            "Merge pass: {} parts merged, {} failed, {} maps merged, {} skipped",
            summary.parts_merged,
            summary.parts_failed,
            summary.maps_merged,
            summary.maps_skipped
        );
        Ok(summary)
    }

    /// Unzips a queued part into scratch space. Returns the scratch directory
    /// and the part's sub-shards by map uuid.
    fn unpack(&self, name: &str) -> Result<(PathBuf, Vec<(String, PathBuf)>)> {
        let stem = name.strip_suffix(".zip").unwrap_or(name);
        let scratch = self.paths.scratch_dir().join(stem);
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        archive::unzip(&self.paths.merging_dir().join(name), &scratch)?;

        let mut maps = Vec::new();
        for entry in fs::read_dir(&scratch)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                maps.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
            }
        }
        maps.sort();
        Ok((scratch, maps))
    }

    fn run_jobs(&self, jobs: Vec<MapJob>) -> Vec<MapResult> {
        let (job_tx, job_rx) = channel::bounded::<MapJob>(self.queue_size);
        let (result_tx, result_rx) = channel::unbounded::<MapResult>();
        let workers = self.threads.min(jobs.len()).max(1);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for job in job_rx.iter() {
                        self.merge_map(job, &result_tx);
                    }
                });
            }
            drop(result_tx);
            for job in jobs {
                if job_tx.send(job).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });
        result_rx.iter().collect()
    }

    /// Merges the parts of one map in order. After a failure the map's later
    /// parts wait for the next pass.
    fn merge_map(&self, job: MapJob, results: &channel::Sender<MapResult>) {
        let mut blocked: Option<String> = None;
        for part in job.parts {
            let outcome = match &blocked {
                Some(earlier) => Err(Error::internal(format!("waiting for earlier part {}", earlier))),
                None => {
                    let mut merged = Ok(false);
                    let run = self.security.as_processing_user(&mut || {
                        merged = self.merge_with_retry(&job.uuid, &part);
                        Ok(())
                    });
                    run.and(merged)
                }
            };
            if outcome.is_err() && blocked.is_none() {
                blocked = Some(part.name.clone());
            }
            let result = MapResult { part: part.name, uuid: job.uuid.clone(), outcome };
            if results.send(result).is_err() {
                return;
            }
        }
    }

    fn merge_with_retry(&self, uuid: &str, part: &PartDir) -> Result<bool> {
        let mut attempt = 0;
        loop {
            match self.manager.merge_part(uuid, &part.dir, Some(&part.hash)) {
                Err(e) if e.is_transient() && attempt + 1 < self.retries => {
                    let delay = BASE_BACKOFF * 2u32.pow(attempt);
                    log::debug!("Retrying part {} for map {} in {:?}: {}", part.name, uuid, delay, e);
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
