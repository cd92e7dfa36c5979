//! Benchmarks for sqlkv write and read paths

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use sqlkv::{BatchOp, Engine, Options, SqliteBackend, WriteMode};

fn open(options: Options) -> Engine {
    Engine::open(SqliteBackend::open_in_memory().unwrap(), options).unwrap()
}

fn write_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_1000");

    for (name, options) in [
        ("unbuffered", Options::default()),
        (
            "buffered_100",
            Options::builder()
                .write_buffer_size(100)
                .max_delay(Duration::ZERO)
                .build(),
        ),
        ("upsert", Options::builder().write_mode(WriteMode::Upsert).build()),
    ] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || open(options.clone()),
                |engine| {
                    for i in 0..1000 {
                        engine.put(format!("key{}", i % 100), "value").unwrap();
                    }
                    engine.flush().unwrap();
                },
                BatchSize::PerIteration,
            )
        });
    }

    group.bench_function("batch", |b| {
        b.iter_batched(
            || open(Options::default()),
            |engine| {
                let ops = (0..1000)
                    .map(|i| BatchOp::put(format!("key{}", i % 100), "value"))
                    .collect();
                engine.batch(ops).unwrap();
            },
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

fn read_benchmarks(c: &mut Criterion) {
    let engine = open(Options::default());
    for i in 0..1000 {
        engine.put(format!("key{}", i), format!("value{}", i)).unwrap();
    }

    c.bench_function("get", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = (i + 1) % 1000;
            black_box(engine.get(format!("key{}", i)).unwrap());
        })
    });

    c.bench_function("iter_all", |b| {
        b.iter(|| black_box(engine.iter(Default::default()).unwrap().count()))
    });
}

criterion_group!(benches, write_benchmarks, read_benchmarks);
criterion_main!(benches);
