//! Voxel and slice throughput for memory and mapped chunk stores
//!
//! Run with: cargo bench --bench chunk_store

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use ctvault::format::{load_volume, save_volume, Backing, LoadOptions};
use ctvault::{ChunkLayout, ChunkStore, HeaderFormat, MapMode, RetryPolicy};
use std::hint::black_box;
use tempfile::TempDir;

const EDGE: usize = 256;
const CHUNK_DIM: usize = 64;

fn memory_store() -> ChunkStore {
    ChunkStore::new(ChunkLayout::new(EDGE, EDGE, EDGE, CHUNK_DIM).unwrap())
}

fn mapped_store(dir: &TempDir) -> ChunkStore {
    let path = dir.path().join("volume.bin");
    save_volume(&memory_store(), 1e-6, &path, HeaderFormat::Extended, &RetryPolicy::default()).unwrap();
    let options = LoadOptions::default()
        .with_backing(Backing::Mapped)
        .with_map_mode(MapMode::ReadWrite);
    load_volume(&path, &options).unwrap().0
}

fn bench_voxels(c: &mut Criterion, name: &str, store: &mut ChunkStore) {
    let mut group = c.benchmark_group(format!("voxels_{}", name));
    group.throughput(Throughput::Elements(EDGE as u64));

    group.bench_function("set_diagonal", |b| {
        b.iter(|| {
            for i in 0..EDGE {
                store.set(i, EDGE - 1 - i, i, i as u8).unwrap();
            }
        });
    });
    group.bench_function("get_diagonal", |b| {
        b.iter(|| {
            let mut sum = 0u32;
            for i in 0..EDGE {
                sum += store.get(i, EDGE - 1 - i, i).unwrap() as u32;
            }
            black_box(sum)
        });
    });
    group.finish();
}

fn bench_slices(c: &mut Criterion, name: &str, store: &mut ChunkStore) {
    let mut group = c.benchmark_group(format!("slices_{}", name));
    group.throughput(Throughput::Bytes((EDGE * EDGE) as u64));
    let data: Vec<u8> = (0..EDGE * EDGE).map(|i| (i % 256) as u8).collect();
    let mut out = vec![0u8; EDGE * EDGE];

    group.bench_function("write_slice", |b| {
        let mut z = 0;
        b.iter(|| {
            z = (z + 1) % EDGE;
            store.write_slice(z, black_box(&data)).unwrap();
        });
    });
    group.bench_function("read_slice", |b| {
        let mut z = 0;
        b.iter(|| {
            z = (z + 1) % EDGE;
            store.read_slice(z, &mut out).unwrap();
            black_box(out[EDGE + 1])
        });
    });
    group.finish();
}

fn bench_memory(c: &mut Criterion) {
    let mut store = memory_store();
    bench_voxels(c, "memory", &mut store);
    bench_slices(c, "memory", &mut store);
}

fn bench_mapped(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut store = mapped_store(&dir);
    bench_voxels(c, "mapped", &mut store);
    bench_slices(c, "mapped", &mut store);
}

fn bench_chunk_index(c: &mut Criterion) {
    let layout = ChunkLayout::new(EDGE, EDGE, EDGE, CHUNK_DIM).unwrap();
    c.bench_function("chunk_index_round_trip", |b| {
        b.iter(|| {
            let mut acc = 0usize;
            for index in 0..layout.total_chunks() {
                acc += layout.chunk_index(layout.chunk_coord(black_box(index)));
            }
            black_box(acc)
        });
    });
}

criterion_group!(benches, bench_chunk_index, bench_memory, bench_mapped);
criterion_main!(benches);
