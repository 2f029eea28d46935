//! Round-trip throughput of the request/wait_get/release cycle against a
//! live dispatch loop. Files come from a scratch directory; run with
//! `cargo bench` on a kernel with io_uring.

use std::fs;
use std::hint::black_box;
use std::path::PathBuf;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use sluice::{LoadStatus, Loader, LoaderConfig};
use tempfile::TempDir;

const N_FILES: usize = 256;
const FILE_SIZE: usize = 4096;
const QUEUE_DEPTH: u32 = 128;

fn bench_round_trip(c: &mut Criterion) {
    let _ = tracing_subscriber::fmt().try_init();

    let dir = TempDir::new().unwrap();
    let paths: Vec<PathBuf> = (0..N_FILES)
        .map(|i| {
            let path = dir.path().join(format!("bench-{i:04}.bin"));
            fs::write(&path, vec![(i & 0xff) as u8; FILE_SIZE]).unwrap();
            path
        })
        .collect();

    let mut loader = Loader::new(
        LoaderConfig::new(1, QUEUE_DEPTH)
            .unwrap()
            .with_max_file_size(FILE_SIZE as u64)
            .unwrap()
            .with_min_dispatch(32)
            .with_region_name(format!("/sluice-bench-{}", std::process::id())),
    )
    .unwrap();
    let worker = loader.worker_context(0).unwrap();
    let control = loader.control();
    let dispatcher = std::thread::spawn(move || loader.become_loader());

    let mut group = c.benchmark_group("loader");
    group.throughput(Throughput::Elements(N_FILES as u64));
    group.bench_function("round_trip_256x4k", |b| {
        b.iter(|| {
            let mut submitted = 0usize;
            let mut received = 0usize;
            while received < N_FILES {
                while submitted < N_FILES && worker.request(&paths[submitted]).unwrap() {
                    submitted += 1;
                }
                let entry = worker.wait_get().unwrap();
                assert_eq!(entry.status(), LoadStatus::Ok);
                black_box(entry.data());
                entry.release();
                received += 1;
            }
        })
    });
    group.finish();

    control.shutdown();
    dispatcher.join().unwrap().unwrap();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
