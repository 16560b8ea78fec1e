// Merge Pipeline Tests for PlanB
// Parts flow from the merge queue into shards owned by the shard manager

use planb::archive;
use planb::codec::{KeyPrefix, Tag};
use planb::db::{HistogramDb, ShardDb, StateDb};
use planb::{
    EnvOptions, Error, FileDescriptor, HistogramSettings, MemoryDocStore, MergeProcessor, NoSecurity, PlanBConfig,
    PlanBDb, PlanBDoc, Result, SecurityContext, ShardManager, StateSettings, StateType, Val,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const STATE_MAP: &str = "0b8a1f3c-state";
const HISTOGRAM_MAP: &str = "7d2e4b90-histogram";

struct Node {
    dir: TempDir,
    manager: Arc<ShardManager>,
    processor: MergeProcessor,
}

fn config(root: &Path) -> PlanBConfig {
    PlanBConfig::new(root).merge_threads(2).merge_queue_size(4)
}

fn node() -> Node {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let docs = MemoryDocStore::new();
    docs.insert(PlanBDoc::with_defaults(STATE_MAP, "states", StateType::State)).unwrap();
    docs.insert(PlanBDoc::with_defaults(HISTOGRAM_MAP, "counts", StateType::Histogram)).unwrap();
    let root = dir.path().join("node");
    let manager = Arc::new(ShardManager::new(&config(&root), Arc::new(docs), Arc::new(NoSecurity)).unwrap());
    let processor = MergeProcessor::new(&config(&root), Arc::clone(&manager), Arc::new(NoSecurity)).unwrap();
    Node { dir, manager, processor }
}

/// Writes a part holding `rows` state rows and one histogram count, and
/// returns the zip path.
fn build_part(base: &Path, name: &str, rows: i32, extra_map: Option<&str>) -> PathBuf {
    let build = base.join(format!("build-{}", name));
    {
        let db = StateDb::open(&build.join(STATE_MAP), StateSettings::new(), &EnvOptions::default()).unwrap();
        db.write(|txn| {
            for i in 0..rows {
                db.insert(txn, &KeyPrefix::new(format!("{}-{}", name, i)), &Val::Int(i))?;
            }
            Ok(())
        })
        .unwrap();

        let histogram =
            HistogramDb::open(&build.join(HISTOGRAM_MAP), HistogramSettings::new(), &EnvOptions::default()).unwrap();
        let key = KeyPrefix::tags([Tag::new("part", "any")]).unwrap();
        histogram.write(|txn| histogram.insert(txn, &key, 0, 1)).unwrap();

        if let Some(map) = extra_map {
            StateDb::open(&build.join(map), StateSettings::new(), &EnvOptions::default()).unwrap();
        }
    }
    let zip = base.join(format!("{}.zip", name));
    archive::zip_dir(&build, &zip).unwrap();
    zip
}

fn histogram_count(node: &Node) -> Option<i64> {
    let shard = node.manager.get_shard(HISTOGRAM_MAP).unwrap();
    match shard.variant() {
        ShardDb::Histogram(db) => db.get(&KeyPrefix::tags([Tag::new("part", "any")]).unwrap(), 0).unwrap(),
        other => panic!("unexpected variant {:?}", other),
    }
}

fn state_count(node: &Node) -> u64 {
    node.manager.with_db("states", |db| db.count()).unwrap()
}

/// Parts merge into every map they contain
#[test]
fn test_merge_current_merges_all_maps() {
    let node = node();
    for (i, name) in ["p1", "p2"].iter().enumerate() {
        let zip = build_part(node.dir.path(), name, 5, None);
        let fd = FileDescriptor::for_file(&zip, i as u64).unwrap();
        node.processor.add(&fd, &zip, true).unwrap();
        assert!(!zip.exists());
    }
    assert_eq!(node.processor.queued(), 2);

    let summary = node.processor.merge_current().unwrap();
    assert_eq!(summary.parts_merged, 2);
    assert_eq!(summary.maps_merged, 4);
    assert!(summary.failures.is_empty());
    assert_eq!(node.processor.queued(), 0);

    assert_eq!(state_count(&node), 10);
    assert_eq!(histogram_count(&node), Some(2));
}

/// Delivering the same archive twice merges it once
#[test]
fn test_redelivered_part_is_skipped() {
    let node = node();
    let zip = build_part(node.dir.path(), "p1", 3, None);
    let first = FileDescriptor::for_file(&zip, 1).unwrap();
    node.processor.add(&first, &zip, false).unwrap();
    node.processor.merge_current().unwrap();

    let again = FileDescriptor::new(first.create_time_ms + 1, 2, first.hash.clone());
    node.processor.add(&again, &zip, false).unwrap();
    let summary = node.processor.merge_current().unwrap();
    assert_eq!(summary.parts_merged, 1);
    assert_eq!(summary.maps_skipped, 2);
    assert_eq!(summary.maps_merged, 0);

    assert_eq!(state_count(&node), 3);
    assert_eq!(histogram_count(&node), Some(1));
}

/// A failing part stays queued without holding back its siblings
#[test]
fn test_failed_part_is_isolated_and_requeued() {
    let node = node();
    let bad = build_part(node.dir.path(), "bad", 2, Some("unknown-map"));
    let good = build_part(node.dir.path(), "good", 4, None);
    node.processor.add(&FileDescriptor::for_file(&bad, 1).unwrap(), &bad, true).unwrap();
    node.processor.add(&FileDescriptor::for_file(&good, 2).unwrap(), &good, true).unwrap();

    let summary = node.processor.merge_current().unwrap();
    assert_eq!(summary.parts_merged, 1);
    assert_eq!(summary.parts_failed, 1);
    assert!(matches!(summary.failures[0], Error::PartMerge { .. }));
    assert_eq!(state_count(&node), 6);

    // The queue survives a restart.
    let root = node.manager.paths().root().to_path_buf();
    let restarted = MergeProcessor::new(&config(&root), Arc::clone(&node.manager), Arc::new(NoSecurity)).unwrap();
    assert_eq!(restarted.queued(), 1);

    // Maps the failed part already reached skip it on the retry.
    let retry = restarted.merge_current().unwrap();
    assert_eq!(retry.parts_failed, 1);
    assert_eq!(retry.maps_skipped, 2);
    assert_eq!(state_count(&node), 6);
}

/// Deletes the queued archives out from under the processor as soon as
/// merging starts.
struct ArchiveSweeper {
    merging: PathBuf,
}

impl SecurityContext for ArchiveSweeper {
    fn as_processing_user(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        for entry in fs::read_dir(&self.merging).unwrap() {
            let _ = fs::remove_file(entry.unwrap().path());
        }
        f()
    }
}

/// A merged part whose archive cannot be removed still leaves the queue
#[test]
fn test_archive_removal_failure_does_not_fail_pass() {
    let node = node();
    let root = node.manager.paths().root().to_path_buf();
    let sweeper = Arc::new(ArchiveSweeper { merging: node.manager.paths().merging_dir() });
    let processor = MergeProcessor::new(&config(&root), Arc::clone(&node.manager), sweeper).unwrap();

    for (i, name) in ["p1", "p2"].iter().enumerate() {
        let zip = build_part(node.dir.path(), name, 5, None);
        processor.add(&FileDescriptor::for_file(&zip, i as u64).unwrap(), &zip, true).unwrap();
    }

    let summary = processor.merge_current().unwrap();
    assert_eq!(summary.parts_merged, 2);
    assert!(summary.failures.is_empty());
    assert_eq!(processor.queued(), 0);
    assert_eq!(state_count(&node), 10);
    assert_eq!(histogram_count(&node), Some(2));
}

/// Shard snapshots restore into an equivalent shard
#[test]
fn test_snapshot_round_trip() {
    let node = node();
    let zip = build_part(node.dir.path(), "p1", 7, None);
    node.processor.add(&FileDescriptor::for_file(&zip, 1).unwrap(), &zip, true).unwrap();
    node.processor.merge_current().unwrap();

    let snapshot = node.dir.path().join("snapshot.zip");
    node.manager.snapshot("states", &snapshot).unwrap();
    let restored = node.dir.path().join("restored");
    archive::unzip(&snapshot, &restored).unwrap();

    let copy = StateDb::open(&restored, StateSettings::new(), &EnvOptions::default().read_only(true)).unwrap();
    assert_eq!(copy.count().unwrap(), 7);
    assert_eq!(copy.get(&KeyPrefix::new("p1-3")).unwrap(), Some(Val::Int(3)));
}
