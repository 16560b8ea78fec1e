// Environment Tests for PlanB
// Durability across simulated crashes and isolation under concurrent access

use planb::codec::KeyPrefix;
use planb::db::StateDb;
use planb::env::LOCK_FILE;
use planb::{Env, EnvOptions, Error, PlanBDb, StateSettings, Txn, Val};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

/// Copies the files on disk while `value` is still open, then leaks `value`
/// without running any destructor, like an abrupt exit. The lock file is left
/// behind since the OS releases it with the process.
fn simulate_crash<T>(value: T, dir: &Path) -> TempDir {
    let image = TempDir::new().unwrap();
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        if entry.file_name() != LOCK_FILE {
            fs::copy(entry.path(), image.path().join(entry.file_name())).unwrap();
        }
    }
    std::mem::forget(value);
    image
}

fn files_with_extension(dir: &Path, extension: &str) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect();
    files.sort();
    files
}

/// Committed rows survive a crash
#[test]
fn test_recovery_after_crash() {
    let dir = TempDir::new().unwrap();
    let image = {
        let db = StateDb::open(dir.path(), StateSettings::new(), &EnvOptions::default()).unwrap();
        for i in 0..100 {
            db.write(|txn| db.insert(txn, &KeyPrefix::new(format!("key_{}", i)), &Val::Int(i))).unwrap();
        }
        simulate_crash(db, dir.path())
    };

    let db = StateDb::open(image.path(), StateSettings::new(), &EnvOptions::default()).unwrap();
    assert_eq!(db.count().unwrap(), 100);
    for i in 0..100 {
        assert_eq!(db.get(&KeyPrefix::new(format!("key_{}", i))).unwrap(), Some(Val::Int(i)), "key_{}", i);
    }
}

/// Rows flushed to tables and rows only in the log both recover
#[test]
fn test_recovery_after_partial_flush() {
    let dir = TempDir::new().unwrap();
    let image = {
        let db = StateDb::open(dir.path(), StateSettings::new(), &EnvOptions::default()).unwrap();
        db.write(|txn| {
            for i in 0..50 {
                db.insert(txn, &KeyPrefix::new(format!("stable_{}", i)), &Val::string("stable"))?;
            }
            Ok(())
        })
        .unwrap();
        db.env().flush().unwrap();

        db.write(|txn| {
            for i in 0..50 {
                db.insert(txn, &KeyPrefix::new(format!("partial_{}", i)), &Val::string("partial"))?;
            }
            Ok(())
        })
        .unwrap();
        simulate_crash(db, dir.path())
    };

    let db = StateDb::open(image.path(), StateSettings::new(), &EnvOptions::default()).unwrap();
    assert_eq!(db.count().unwrap(), 100);
    assert_eq!(db.get(&KeyPrefix::new("stable_7")).unwrap(), Some(Val::string("stable")));
    assert_eq!(db.get(&KeyPrefix::new("partial_7")).unwrap(), Some(Val::string("partial")));
}

/// A torn record at the end of the log is discarded, earlier commits are kept
#[test]
fn test_torn_log_tail_is_discarded() {
    let dir = TempDir::new().unwrap();
    let image = {
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let db = env.open_db("data").unwrap();
        for i in 0..10u32 {
            env.write(|txn| txn.put(db, &i.to_be_bytes(), b"value")).unwrap();
        }
        simulate_crash(env, dir.path())
    };

    let logs = files_with_extension(image.path(), "log");
    assert_eq!(logs.len(), 1);
    let mut log = OpenOptions::new().append(true).open(&logs[0]).unwrap();
    log.write_all(&[0xAB; 11]).unwrap();
    drop(log);

    let env = Env::open(image.path(), EnvOptions::default()).unwrap();
    let db = env.open_db("data").unwrap();
    let read = env.begin_read();
    assert_eq!(read.count(db).unwrap(), 10);
    assert_eq!(read.get(db, &9u32.to_be_bytes()).unwrap(), Some(b"value".to_vec()));
}

/// A damaged table makes the shard unopenable rather than silently empty
#[test]
fn test_damaged_table_is_corrupt_shard() {
    let dir = TempDir::new().unwrap();
    {
        let env = Env::open(dir.path(), EnvOptions::default()).unwrap();
        let db = env.open_db("data").unwrap();
        env.write(|txn| txn.put(db, b"k", b"v")).unwrap();
        env.flush().unwrap();
    }

    let tables = files_with_extension(dir.path(), "sst");
    assert!(!tables.is_empty());
    fs::write(&tables[0], b"junk").unwrap();

    let err = Env::open(dir.path(), EnvOptions::default()).unwrap_err();
    assert!(matches!(err, Error::CorruptShard { .. }), "{:?}", err);
}

/// Readers running beside a writer always see whole transactions
#[test]
fn test_concurrent_readers_see_whole_commits() {
    let dir = TempDir::new().unwrap();
    let env = Env::open(dir.path(), EnvOptions::default().memtable_size(16 * 1024)).unwrap();
    let db = env.open_db("pairs").unwrap();
    env.write(|txn| {
        txn.put(db, b"a", &0u64.to_be_bytes())?;
        txn.put(db, b"b", &0u64.to_be_bytes())
    })
    .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let env = env.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last = 0u64;
                let mut checks = 0usize;
                while !done.load(Ordering::Acquire) || checks == 0 {
                    let read = env.begin_read();
                    let a = u64::from_be_bytes(read.get(db, b"a").unwrap().unwrap().try_into().unwrap());
                    let b = u64::from_be_bytes(read.get(db, b"b").unwrap().unwrap().try_into().unwrap());
                    assert_eq!(a, b, "reader saw half a commit");
                    assert!(a >= last, "reader went back in time");
                    last = a;
                    checks += 1;
                }
                checks
            })
        })
        .collect();

    let writer = {
        let env = env.clone();
        thread::spawn(move || {
            for round in 1..=500u64 {
                env.write(|txn| {
                    txn.put(db, b"a", &round.to_be_bytes())?;
                    txn.put(db, format!("filler-{}", round).as_bytes(), &[0u8; 64])?;
                    txn.put(db, b"b", &round.to_be_bytes())
                })
                .unwrap();
            }
        })
    };

    writer.join().unwrap();
    done.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    let read = env.begin_read();
    assert_eq!(read.get(db, b"a").unwrap(), Some(500u64.to_be_bytes().to_vec()));
    assert_eq!(read.count(db).unwrap(), 502);
}

/// Concurrent read-modify-write transactions serialise without losing updates
#[test]
fn test_concurrent_writers_serialise() {
    let dir = TempDir::new().unwrap();
    let env = Env::open(dir.path(), EnvOptions::default().sync_wal(false)).unwrap();
    let db = env.open_db("counters").unwrap();
    env.write(|txn| txn.put(db, b"counter", &0u64.to_be_bytes())).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let env = env.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    env.write(|txn| {
                        let current = txn.get(db, b"counter")?.unwrap();
                        let next = u64::from_be_bytes(current.try_into().unwrap()) + 1;
                        txn.put(db, b"counter", &next.to_be_bytes())
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let value = env.begin_read().get(db, b"counter").unwrap().unwrap();
    assert_eq!(u64::from_be_bytes(value.try_into().unwrap()), 400);
}
