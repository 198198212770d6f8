use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sqlbridge_rs::{params, Arity, Database, OpenConfig, Target, Value};
use tempfile::TempDir;

fn populate(db: &Database, count: usize) {
    db.execute("CREATE TABLE test (id INTEGER PRIMARY KEY, data TEXT)", &[])
        .unwrap();
    let mut insert = db.prepare("INSERT INTO test (data) VALUES (?)").unwrap();
    db.execute("BEGIN", &[]).unwrap();
    for i in 0..count {
        insert.execute(params![format!("Test data {}", i)]).unwrap();
    }
    db.execute("COMMIT", &[]).unwrap();
}

/// Benchmark INSERT throughput on each backend
fn bench_vfs_inserts(c: &mut Criterion) {
    let row_counts = vec![100, 1_000, 10_000];

    let mut group = c.benchmark_group("vfs_inserts");

    for count in row_counts {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("memory", count), &count, |b, &count| {
            b.iter_with_setup(
                || Database::open_in_memory().unwrap(),
                |db| {
                    populate(&db, count);
                    black_box(&db);
                },
            );
        });

        group.bench_with_input(BenchmarkId::new("native", count), &count, |b, &count| {
            b.iter_with_setup(
                || {
                    let dir = TempDir::new().unwrap();
                    let path = dir.path().join("bench.db");
                    let db = Database::open(path.to_str().unwrap()).unwrap();
                    (db, dir)
                },
                |(db, _dir)| {
                    populate(&db, count);
                    black_box(&db);
                },
            );
        });

        group.bench_with_input(BenchmarkId::new("sandboxed", count), &count, |b, &count| {
            let config = OpenConfig {
                target: Target::Sandboxed,
                ..Default::default()
            };
            let mut round = 0u64;
            b.iter_with_setup(
                || {
                    round += 1;
                    let name = format!("bench-{}-{}.db", count, round);
                    Database::open_with_config(&name, &config).unwrap()
                },
                |db| {
                    populate(&db, count);
                    black_box(&db);
                },
            );
        });
    }

    group.finish();
}

/// Benchmark materializing SELECT results
fn bench_vfs_selects(c: &mut Criterion) {
    let row_counts = vec![100, 1_000, 10_000];

    let mut group = c.benchmark_group("vfs_selects");

    for count in row_counts {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let db = Database::open_in_memory().unwrap();
            populate(&db, count);

            b.iter(|| {
                let rows = db.select("SELECT * FROM test", &[]).unwrap();
                black_box(rows);
            });
        });

        group.bench_with_input(BenchmarkId::new("cursor", count), &count, |b, &count| {
            let db = Database::open_in_memory().unwrap();
            populate(&db, count);
            let mut stmt = db.prepare("SELECT id, data FROM test").unwrap();

            b.iter(|| {
                let mut total = 0i64;
                let mut rows = stmt.query(&[]).unwrap();
                while let Some(row) = rows.next().unwrap() {
                    total += row.get::<i64>(0).unwrap();
                }
                black_box(total);
            });
        });
    }

    group.finish();
}

/// Benchmark scalar function dispatch
fn bench_function_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("function_calls");
    let count = 10_000;
    group.throughput(Throughput::Elements(count as u64));

    group.bench_function("scalar", |b| {
        let db = Database::open_in_memory().unwrap();
        populate(&db, count);
        db.create_scalar_function("len_plus", Arity::Fixed(1), true, |args| {
            let text: String = args[0].get()?;
            Ok(Value::Integer(text.len() as i64 + 1))
        })
        .unwrap();

        b.iter(|| {
            let rows = db.select("SELECT sum(len_plus(data)) FROM test", &[]).unwrap();
            black_box(rows);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_vfs_inserts,
    bench_vfs_selects,
    bench_function_calls
);
criterion_main!(benches);
