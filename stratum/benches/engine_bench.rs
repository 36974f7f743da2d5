use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stratum::btree::{ColType, Value};
use stratum::engine::{Engine, IndexCol, IndexDef};
use tempfile::TempDir;

const RECORD_SIZE: usize = 16;

fn record(id: i32) -> Vec<u8> {
    let mut buf = id.to_le_bytes().to_vec();
    buf.resize(RECORD_SIZE, 0);
    buf
}

fn setup_engine() -> (TempDir, Engine) {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    engine.create_table("bench", RECORD_SIZE).unwrap();
    engine
        .create_index(
            "bench",
            IndexDef {
                name: "by_id".into(),
                cols: vec![IndexCol {
                    col_type: ColType::Int,
                    len: 4,
                    offset: 0,
                }],
                order: None,
            },
        )
        .unwrap();

    let txn = engine.begin().unwrap();
    for i in 0..1000 {
        engine.insert(&txn, "bench", &record(i)).unwrap();
    }
    engine.commit(&txn).unwrap();
    (dir, engine)
}

fn benchmark_insert_commit(c: &mut Criterion) {
    let (_dir, engine) = setup_engine();
    let mut next = 1_000_000;

    c.bench_function("insert_commit", |b| {
        b.iter(|| {
            let txn = engine.begin().unwrap();
            engine.insert(&txn, "bench", black_box(&record(next))).unwrap();
            engine.commit(&txn).unwrap();
            next += 1;
        })
    });
}

fn benchmark_seq_scan(c: &mut Criterion) {
    let (_dir, engine) = setup_engine();

    c.bench_function("seq_scan_1k", |b| {
        b.iter(|| {
            let txn = engine.begin().unwrap();
            let rows = engine.scan_all(&txn, "bench").unwrap();
            engine.commit(&txn).unwrap();
            black_box(rows.len())
        })
    });
}

fn benchmark_index_probe(c: &mut Criterion) {
    let (_dir, engine) = setup_engine();
    let mut key = 0;

    c.bench_function("index_probe", |b| {
        b.iter(|| {
            let txn = engine.begin().unwrap();
            let hits = engine
                .index_lookup(&txn, "bench", "by_id", black_box(&[Value::Int(key % 1000)]))
                .unwrap();
            engine.commit(&txn).unwrap();
            key += 1;
            black_box(hits.len())
        })
    });
}

criterion_group!(
    benches,
    benchmark_insert_commit,
    benchmark_seq_scan,
    benchmark_index_probe
);
criterion_main!(benches);
