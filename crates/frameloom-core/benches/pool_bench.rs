//! Benchmarks for buffer pool allocation and frame creation.
//!
//! Run with: cargo bench -p frameloom-core

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use frameloom_core::{ColorFamily, Core, CoreOptions, MemoryPool, SampleType};

fn bench_pool_recycling(c: &mut Criterion) {
    let pool = MemoryPool::new();

    c.bench_function("pool_alloc_free_1mib_warm", |bencher| {
        bencher.iter(|| {
            let buf = pool.alloc_buffer(black_box(1 << 20));
            unsafe { pool.free_buffer(buf) };
        });
    });

    c.bench_function("pool_alloc_free_mixed_sizes", |bencher| {
        let sizes = [64 * 1024, 256 * 1024, 1 << 20];
        bencher.iter(|| {
            for &size in &sizes {
                let buf = pool.alloc_buffer(black_box(size));
                unsafe { pool.free_buffer(buf) };
            }
        });
    });
}

fn bench_frame_creation(c: &mut Criterion) {
    let core = Core::with_options(CoreOptions {
        threads: Some(1),
        ..Default::default()
    });
    let format = core
        .query_video_format(ColorFamily::Yuv, SampleType::Integer, 8, 1, 1)
        .expect("valid format");

    c.bench_function("new_video_frame_1080p", |bencher| {
        bencher.iter(|| {
            black_box(core.new_video_frame(&format, 1920, 1080, None));
        });
    });

    c.bench_function("copy_frame_and_cow_write", |bencher| {
        let frame = core.new_video_frame(&format, 1920, 1080, None);
        bencher.iter(|| {
            let mut copy = core.copy_frame(&frame);
            black_box(copy.write_ptr(0));
        });
    });
}

criterion_group!(benches, bench_pool_recycling, bench_frame_creation);
criterion_main!(benches);
