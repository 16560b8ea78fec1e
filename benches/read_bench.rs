// Read performance benchmarks for PlanB

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use planb::codec::KeyPrefix;
use planb::db::{StateDb, TemporalStateDb};
use planb::query::fields;
use planb::{
    EnvOptions, ExpressionCriteria, ExpressionPredicateFactory, FieldIndex, PlanBDb, StateSettings,
    TemporalStateSettings, Val,
};
use rand::Rng;
use std::hint::black_box;
use std::ops::ControlFlow;
use tempfile::TempDir;

fn populated_state(dir: &TempDir, size: usize) -> StateDb {
    let _ = env_logger::try_init();
    let db = StateDb::open(dir.path(), StateSettings::new(), &EnvOptions::default()).unwrap();
    db.write(|txn| {
        for i in 0..size {
            db.insert(txn, &KeyPrefix::new(format!("key{:08}", i)), &Val::string(format!("value{:08}", i)))?;
        }
        Ok(())
    })
    .unwrap();
    db.env().flush().unwrap();
    db
}

fn benchmark_sequential_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_get");

    for size in [100usize, 1000, 10000].iter() {
        let temp_dir = TempDir::new().unwrap();
        let db = populated_state(&temp_dir, *size);

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    let value = db.get(&KeyPrefix::new(format!("key{:08}", i))).unwrap();
                    black_box(value);
                }
            });
        });
    }

    group.finish();
}

fn benchmark_random_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_get");
    let size = 10000usize;
    let temp_dir = TempDir::new().unwrap();
    let db = populated_state(&temp_dir, size);

    group.throughput(Throughput::Elements(1000));
    group.bench_function("10000_keys", |b| {
        let mut rng = rand::rng();
        b.iter(|| {
            for _ in 0..1000 {
                let i = rng.random_range(0..size);
                black_box(db.get(&KeyPrefix::new(format!("key{:08}", i))).unwrap());
            }
        });
    });

    group.finish();
}

fn benchmark_temporal_get_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("temporal_get_state");
    let temp_dir = TempDir::new().unwrap();
    let db = TemporalStateDb::open(temp_dir.path(), TemporalStateSettings::new(), &EnvOptions::default()).unwrap();
    let keys: Vec<KeyPrefix> = (0..100).map(|k| KeyPrefix::new(format!("key{:03}", k))).collect();
    db.write(|txn| {
        for key in &keys {
            for version in 0..50i64 {
                db.insert(txn, key, version * 60_000, &Val::Long(version))?;
            }
        }
        Ok(())
    })
    .unwrap();
    db.env().flush().unwrap();

    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("100_keys_50_versions", |b| {
        let mut rng = rand::rng();
        b.iter(|| {
            for key in &keys {
                let time = rng.random_range(0..50 * 60_000i64);
                black_box(db.get_state(key, time).unwrap());
            }
        });
    });

    group.finish();
}

fn benchmark_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    for size in [1000usize, 10000].iter() {
        let temp_dir = TempDir::new().unwrap();
        let db = populated_state(&temp_dir, *size);
        let criteria = ExpressionCriteria::all();
        let factory = ExpressionPredicateFactory::new();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut projection = FieldIndex::with_fields([fields::KEY, fields::VALUE]);
                let mut rows = 0usize;
                db.search(&criteria, &mut projection, None, &factory, &mut |row| {
                    rows += 1;
                    black_box(row);
                    ControlFlow::Continue(())
                })
                .unwrap();
                black_box(rows);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_sequential_get,
    benchmark_random_get,
    benchmark_temporal_get_state,
    benchmark_search
);
criterion_main!(benches);
