//! Buffer pool accounting, recycling and budget behavior.

use crate::filters::{test_core, yuv420p8};
use frameloom_core::MemoryPool;

// ── Recycling ──────────────────────────────────────────────────

#[test]
fn repeated_alloc_free_reuses_buffers() {
    let pool = MemoryPool::new();
    let size = 1 << 20;

    // Warm up one buffer, then churn.
    for _ in 0..1000 {
        let buf = pool.alloc_buffer(size);
        pool.add(size);
        unsafe { pool.free_buffer(buf) };
        pool.subtract(size);
    }

    // Everything after the first allocation came from the freed-block
    // map; the OS was asked exactly once.
    assert_eq!(pool.os_allocation_count(), 1);
    assert!(pool.in_use() + pool.unused() <= pool.limit());
}

#[test]
fn distinct_sizes_get_distinct_buckets() {
    let pool = MemoryPool::new();
    let small = pool.alloc_buffer(64 * 1024);
    let large = pool.alloc_buffer(8 << 20);
    unsafe {
        pool.free_buffer(small);
        pool.free_buffer(large);
    }

    // A mid-sized request fits neither bucket well and allocates fresh.
    let mid = pool.alloc_buffer(1 << 20);
    assert_eq!(pool.os_allocation_count(), 3);
    unsafe { pool.free_buffer(mid) };
}

// ── Budget ─────────────────────────────────────────────────────

#[test]
fn freed_blocks_beyond_the_budget_go_back_to_the_os() {
    let pool = MemoryPool::new();
    pool.set_limit(2 << 20);

    let buffers: Vec<_> = (0..4).map(|_| pool.alloc_buffer(1 << 20)).collect();
    pool.add(4 << 20);
    // Live usage alone exceeds the budget: freed blocks cannot be kept.
    for buf in buffers {
        unsafe { pool.free_buffer(buf) };
    }
    assert_eq!(pool.unused(), 0);
    pool.subtract(4 << 20);

    // Below budget again, freed blocks are retained for reuse.
    let buf = pool.alloc_buffer(1 << 20);
    unsafe { pool.free_buffer(buf) };
    assert_eq!(pool.unused(), 1 << 20);
}

// ── Frame-level accounting ─────────────────────────────────────

#[test]
fn in_use_matches_live_plane_bytes() {
    use frameloom_core::GUARD_SPACE;

    let core = test_core(1);
    assert_eq!(core.memory_in_use(), 0);

    let format = yuv420p8();
    let frame = core.new_video_frame(&format, 64, 64, None);
    let expected: usize = (0..3)
        .map(|p| frame.stride(p) * frame.plane_height(p) as usize + 2 * GUARD_SPACE)
        .sum();
    assert_eq!(core.memory_in_use(), expected);

    // Sharing planes does not allocate; the copy adds nothing.
    let copy = core.copy_frame(&frame);
    assert_eq!(core.memory_in_use(), expected);

    // A COW write adds exactly one plane.
    let mut copy = copy;
    copy.write_ptr(0);
    let plane0 = frame.stride(0) * frame.plane_height(0) as usize + 2 * GUARD_SPACE;
    assert_eq!(core.memory_in_use(), expected + plane0);

    drop(copy);
    assert_eq!(core.memory_in_use(), expected);
    drop(frame);
    assert_eq!(core.memory_in_use(), 0);
    core.free();
}

#[test]
fn memory_limit_is_sticky_and_clamped() {
    let core = test_core(1);
    assert_eq!(core.set_memory_limit(512 * 1024 * 1024), 512 * 1024 * 1024);
    assert_eq!(core.memory_limit(), 512 * 1024 * 1024);
    // Non-positive limits leave the previous value in place.
    assert_eq!(core.set_memory_limit(-1), 512 * 1024 * 1024);
    core.free();
}

#[test]
fn pool_outlives_frames_created_from_it() {
    let core = test_core(1);
    let frame = core.new_video_frame(&yuv420p8(), 64, 64, None);
    // Dropping the core handle first must leave the frame usable; the
    // plane keeps the pool alive.
    core.free();
    assert!(frame.plane_slice(0).len() >= 64);
    drop(frame);
}
