//! Quota accounting throughput

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use upperfs::quota::{total_size, SpaceAccountant};

fn charge_uncontended(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let accountant = SpaceAccountant::new(dir.path(), Some(u64::MAX / 4)).unwrap();

    c.bench_function("charge_uncontended", |b| {
        b.iter(|| {
            accountant.charge(black_box(4096)).unwrap();
            accountant.charge(black_box(-4096)).unwrap();
        })
    });
}

fn charge_contended(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let accountant = Arc::new(SpaceAccountant::new(dir.path(), Some(u64::MAX / 4)).unwrap());

    c.bench_function("charge_contended_8_threads", |b| {
        b.iter(|| {
            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let accountant = Arc::clone(&accountant);
                    std::thread::spawn(move || {
                        for _ in 0..1000 {
                            accountant.charge(512).unwrap();
                            accountant.charge(-512).unwrap();
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }
        })
    });
}

fn scan_tree(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    for d in 0..10 {
        let sub = dir.path().join(format!("d{}", d));
        std::fs::create_dir(&sub).unwrap();
        for f in 0..100 {
            std::fs::write(sub.join(format!("f{}", f)), vec![0u8; 256]).unwrap();
        }
    }

    c.bench_function("total_size_1000_files", |b| {
        b.iter(|| black_box(total_size(dir.path()).unwrap()))
    });
}

criterion_group!(benches, charge_uncontended, charge_contended, scan_tree);
criterion_main!(benches);
