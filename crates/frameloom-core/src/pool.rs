//! Budgeted buffer pool for frame memory.
//!
//! Supplies aligned byte buffers and recycles freed ones in size buckets.
//! Freed blocks are kept until the pool goes over its byte budget, at
//! which point uniformly-random freed blocks are returned to the OS.
//! Random eviction avoids repeatedly throwing away the most recently
//! freed block that is about to be reused.

use parking_lot::Mutex;
use std::alloc::{alloc, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::warn;

use crate::log::fatal;

/// Buffer alignment in bytes: 64 when AVX-512 is available, 32 otherwise.
pub fn alignment() -> usize {
    static ALIGNMENT: OnceLock<usize> = OnceLock::new();
    *ALIGNMENT.get_or_init(detect_alignment)
}

#[cfg(target_arch = "x86_64")]
fn detect_alignment() -> usize {
    if std::arch::is_x86_feature_detected!("avx512f") {
        64
    } else {
        32
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_alignment() -> usize {
    32
}

/// Header written at the start of every OS-level block, one alignment
/// unit before the pointer handed to callers. Records the true bucket
/// size and whether the block came from a large-page mapping.
#[derive(Clone, Copy)]
struct BlockHeader {
    size: usize,
    large: bool,
}

fn default_limit() -> usize {
    if std::mem::size_of::<usize>() >= 8 {
        4 * 1024 * 1024 * 1024
    } else {
        1024 * 1024 * 1024
    }
}

/// Aligned, size-bucketed buffer allocator with a global byte budget.
///
/// Shared via `Arc`: every buffer drawn from the pool keeps its own
/// reference, so the pool outlives all of its allocations no matter how
/// teardown is ordered.
pub struct MemoryPool {
    used: AtomicUsize,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Freed blocks bucketed by size, smallest first.
    buffers: BTreeMap<usize, Vec<NonNull<u8>>>,
    unused_size: usize,
    limit: usize,
    warned: bool,
    large_page_enabled: bool,
    os_allocations: u64,
    rng: u64,
}

// Raw block pointers are only ever touched under the state lock.
unsafe impl Send for PoolState {}

impl MemoryPool {
    pub fn new() -> Arc<Self> {
        assert!(alignment() >= std::mem::size_of::<BlockHeader>());
        Arc::new(Self {
            used: AtomicUsize::new(0),
            state: Mutex::new(PoolState {
                buffers: BTreeMap::new(),
                unused_size: 0,
                limit: default_limit(),
                warned: false,
                // Kept off: large-page mappings interact badly with the
                // recycling buckets and OS-level zeroing guarantees.
                large_page_enabled: false,
                os_allocations: 0,
                rng: 0x9E37_79B9_7F4A_7C15,
            }),
        })
    }

    /// A reused buffer is a good fit when its capacity exceeds the
    /// request by at most one eighth.
    fn is_good_fit(requested: usize, actual: usize) -> bool {
        actual <= requested + requested / 8
    }

    /// Minimum size of a large-page mapping on this system.
    pub fn large_page_size() -> usize {
        2 * (1 << 20)
    }

    /// Allocate a buffer of at least `bytes`, aligned to [`alignment`].
    /// Reuses a freed block when one is a good fit; never fails (running
    /// out of memory is fatal).
    pub fn alloc_buffer(&self, bytes: usize) -> NonNull<u8> {
        let mut state = self.state.lock();

        let reuse = state
            .buffers
            .range(bytes..)
            .next()
            .map(|(&size, _)| size)
            .filter(|&size| Self::is_good_fit(bytes, size));

        if let Some(size) = reuse {
            state.unused_size -= size;
            let bucket = match state.buffers.get_mut(&size) {
                Some(bucket) => bucket,
                None => fatal("buffer bucket vanished while the pool lock was held"),
            };
            let block = match bucket.pop() {
                Some(block) => block,
                None => fatal("empty buffer bucket in the freed-block map"),
            };
            if bucket.is_empty() {
                state.buffers.remove(&size);
            }
            // Callers see the address past the header.
            return unsafe { NonNull::new_unchecked(block.as_ptr().add(alignment())) };
        }

        let block = state.allocate_memory(bytes);
        unsafe { NonNull::new_unchecked(block.as_ptr().add(alignment())) }
    }

    /// Return a buffer obtained from [`alloc_buffer`] to the pool.
    ///
    /// # Safety
    ///
    /// `buf` must have come from `alloc_buffer` on this pool and must not
    /// be used afterwards.
    pub unsafe fn free_buffer(&self, buf: NonNull<u8>) {
        let mut state = self.state.lock();

        let block = NonNull::new_unchecked(buf.as_ptr().sub(alignment()));
        let header = *(block.as_ptr() as *const BlockHeader);
        if header.size == 0 || (header.large && header.size < Self::large_page_size() - alignment())
        {
            fatal("memory corruption detected in freed buffer header");
        }

        state.buffers.entry(header.size).or_default().push(block);
        state.unused_size += header.size;

        let used = self.used.load(Ordering::Relaxed);
        while used + state.unused_size > state.limit && !state.buffers.is_empty() {
            if !state.warned {
                warn!("memory budget exceeded, releasing freed buffers to the OS");
                state.warned = true;
            }
            state.evict_random();
        }
    }

    /// Record `bytes` of live allocation.
    pub fn add(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record that `bytes` of live allocation were released.
    pub fn subtract(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Bytes currently handed out to live buffers.
    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Bytes held in freed blocks awaiting reuse.
    pub fn unused(&self) -> usize {
        self.state.lock().unused_size
    }

    /// Current byte budget.
    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Whether live allocations alone exceed the budget.
    pub fn is_over_limit(&self) -> bool {
        self.in_use() > self.limit()
    }

    /// Set the byte budget. Non-positive values are ignored; values wider
    /// than the address space are clamped. Returns the budget in effect.
    pub fn set_limit(&self, bytes: i64) -> usize {
        let mut state = self.state.lock();
        if bytes > 0 {
            state.limit = usize::try_from(bytes).unwrap_or(usize::MAX);
        }
        state.limit
    }

    /// Number of blocks requested from the OS so far. Stays flat while
    /// the recycling buckets satisfy demand.
    pub fn os_allocation_count(&self) -> u64 {
        self.state.lock().os_allocations
    }
}

impl PoolState {
    /// Allocate a fresh OS block of `alignment() + bytes`, header first.
    fn allocate_memory(&mut self, bytes: usize) -> NonNull<u8> {
        if let Some(block) = self.allocate_large_page(bytes) {
            self.os_allocations += 1;
            return block;
        }

        let layout = match Layout::from_size_align(alignment() + bytes, alignment()) {
            Ok(layout) => layout,
            Err(_) => fatal("invalid buffer allocation layout"),
        };
        let ptr = unsafe { alloc(layout) };
        let Some(block) = NonNull::new(ptr) else {
            fatal("out of memory");
        };
        unsafe {
            *(block.as_ptr() as *mut BlockHeader) = BlockHeader { size: bytes, large: false };
        }
        self.os_allocations += 1;
        block
    }

    /// Attempt a large-page mapping. Only taken when large pages are
    /// enabled, the rounded size stays a good fit for the request, and
    /// the request is at least the large-page minimum.
    fn allocate_large_page(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if !self.large_page_enabled {
            return None;
        }

        let granularity = MemoryPool::large_page_size();
        if bytes < granularity {
            return None;
        }
        let alloc_bytes = (alignment() + bytes + granularity - 1) & !(granularity - 1);

        // A rounded-up mapping that is not a good fit would defeat the
        // recycling buckets.
        if !MemoryPool::is_good_fit(bytes, alloc_bytes - alignment()) {
            return None;
        }

        let layout = Layout::from_size_align(alloc_bytes, alignment()).ok()?;
        let block = NonNull::new(unsafe { alloc(layout) })?;
        unsafe {
            *(block.as_ptr() as *mut BlockHeader) = BlockHeader {
                size: alloc_bytes - alignment(),
                large: true,
            };
        }
        Some(block)
    }

    /// Return one uniformly-random freed block to the OS.
    fn evict_random(&mut self) {
        let total: usize = self.buffers.values().map(Vec::len).sum();
        if total == 0 {
            return;
        }
        let target = self.next_random() as usize % total;

        let mut seen = 0;
        let mut found: Option<(usize, usize)> = None;
        for (&size, bucket) in &self.buffers {
            if target < seen + bucket.len() {
                found = Some((size, target - seen));
                break;
            }
            seen += bucket.len();
        }

        if let Some((size, index)) = found {
            let Some(bucket) = self.buffers.get_mut(&size) else {
                return;
            };
            let block = bucket.swap_remove(index);
            if bucket.is_empty() {
                self.buffers.remove(&size);
            }
            self.unused_size -= size;
            free_block(block);
        }
    }

    fn next_random(&mut self) -> u64 {
        // xorshift64*, plenty for eviction choice.
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

/// Hand a block (header pointer) back to the OS.
fn free_block(block: NonNull<u8>) {
    unsafe {
        let header = *(block.as_ptr() as *const BlockHeader);
        let layout = match Layout::from_size_align(alignment() + header.size, alignment()) {
            Ok(layout) => layout,
            Err(_) => fatal("invalid buffer layout on free"),
        };
        dealloc(block.as_ptr(), layout);
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, bucket) in std::mem::take(&mut state.buffers) {
            for block in bucket {
                free_block(block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_aligned() {
        let pool = MemoryPool::new();
        let buf = pool.alloc_buffer(4096);
        assert_eq!(buf.as_ptr() as usize % alignment(), 0);
        unsafe { pool.free_buffer(buf) };
    }

    #[test]
    fn freed_buffer_is_reused_on_good_fit() {
        let pool = MemoryPool::new();
        let buf = pool.alloc_buffer(1 << 20);
        let addr = buf.as_ptr() as usize;
        unsafe { pool.free_buffer(buf) };

        let again = pool.alloc_buffer(1 << 20);
        assert_eq!(again.as_ptr() as usize, addr);
        assert_eq!(pool.os_allocation_count(), 1);
        unsafe { pool.free_buffer(again) };
    }

    #[test]
    fn oversized_block_is_not_a_good_fit() {
        let pool = MemoryPool::new();
        let big = pool.alloc_buffer(1 << 20);
        unsafe { pool.free_buffer(big) };

        // A 64 KiB request must not be served from the 1 MiB block.
        let small = pool.alloc_buffer(64 * 1024);
        assert_eq!(pool.os_allocation_count(), 2);
        assert_eq!(pool.unused(), 1 << 20);
        unsafe { pool.free_buffer(small) };
    }

    #[test]
    fn limit_set_and_clamp() {
        let pool = MemoryPool::new();
        assert_eq!(pool.set_limit(1024), 1024);
        assert_eq!(pool.limit(), 1024);
        // Non-positive values leave the budget untouched.
        assert_eq!(pool.set_limit(0), 1024);
        assert_eq!(pool.set_limit(-5), 1024);
    }

    #[test]
    fn over_budget_freed_blocks_are_evicted() {
        let pool = MemoryPool::new();
        pool.set_limit(256 * 1024);

        let a = pool.alloc_buffer(128 * 1024);
        let b = pool.alloc_buffer(128 * 1024);
        let c = pool.alloc_buffer(128 * 1024);
        pool.add(3 * 128 * 1024);

        unsafe {
            pool.free_buffer(a);
            pool.free_buffer(b);
            pool.free_buffer(c);
        }
        // 384 KiB still counted as in use, so nothing freed may be kept.
        assert_eq!(pool.unused(), 0);
        pool.subtract(3 * 128 * 1024);
    }

    #[test]
    fn usage_counters_track_add_subtract() {
        let pool = MemoryPool::new();
        assert_eq!(pool.in_use(), 0);
        pool.add(4096);
        assert_eq!(pool.in_use(), 4096);
        pool.subtract(4096);
        assert_eq!(pool.in_use(), 0);
    }
}
