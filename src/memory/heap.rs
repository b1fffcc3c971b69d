use super::free_list::Pool;
use super::header::{header_of, HEADER_SIZE, INITIAL_BLOCKS, MAX_POOL_BLOCK};
use super::large::LargeList;
use super::stats::{HeapStats, StatsSnapshot};
use super::vm::MemError;
use std::ptr::NonNull;
use std::sync::Mutex;

/// Upper bound on a single request's user bytes. Anything larger is
/// rejected with a null result before any dispatch happens.
pub const MAX_REQUEST: usize = 100_000_000;

/// Configuration for [`BuddyHeap`]. Set at construction via
/// [`BuddyHeap::with_config`].
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Number of maximum-order blocks carved from the pool reservation.
    /// Default: [`INITIAL_BLOCKS`].
    pub initial_blocks: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_blocks: INITIAL_BLOCKS,
        }
    }
}

/// A complete allocator instance: the buddy pool, the large-block list,
/// and the four counters the probes report.
///
/// Requests dispatch on a single size threshold: anything whose total
/// footprint (user bytes plus header) still fits the largest pooled block
/// goes to the pool; everything bigger gets a private page mapping.
///
/// The engine is single-threaded by contract; callers serialize access.
/// Process-wide use goes through [`GlobalHeap`], which wraps the one
/// shared instance in a mutex.
pub struct BuddyHeap {
    pool: Pool,
    large: LargeList,
    stats: HeapStats,
}

impl BuddyHeap {
    /// Build a heap with the default configuration, reserving and carving
    /// its pool immediately.
    ///
    /// # Errors
    ///
    /// Returns `MemError` if the data segment cannot be extended or the
    /// reservation comes back misaligned.
    pub fn new() -> Result<Self, MemError> {
        Self::with_config(HeapConfig::default())
    }

    /// Build a heap with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `MemError` on an invalid configuration or a failed pool
    /// reservation.
    pub fn with_config(config: HeapConfig) -> Result<Self, MemError> {
        let mut stats = HeapStats::new();
        let pool = Pool::init(&config, &mut stats)?;
        Ok(Self {
            pool,
            large: LargeList::new(),
            stats,
        })
    }

    /// Allocate at least `size` bytes. Returns null on `size == 0`,
    /// `size > MAX_REQUEST`, or exhaustion of the chosen path.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 || size > MAX_REQUEST {
            return std::ptr::null_mut();
        }
        let required = size + HEADER_SIZE;
        if required > MAX_POOL_BLOCK {
            match self.large.alloc(required, &mut self.stats) {
                Ok(p) => p.as_ptr(),
                Err(_) => std::ptr::null_mut(),
            }
        } else {
            self.pool
                .alloc(required, &mut self.stats)
                .map_or(std::ptr::null_mut(), NonNull::as_ptr)
        }
    }

    /// Allocate `count * size` bytes and zero them. Returns null on any
    /// zero argument, multiplication overflow, over-limit products, or
    /// allocation failure.
    pub fn zeroed_alloc(&mut self, count: usize, size: usize) -> *mut u8 {
        if count == 0 || size == 0 {
            return std::ptr::null_mut();
        }
        let Some(total) = count.checked_mul(size) else {
            return std::ptr::null_mut();
        };
        if total > MAX_REQUEST {
            return std::ptr::null_mut();
        }

        let p = self.alloc(total);
        if p.is_null() {
            return p;
        }
        // Pooled blocks may be dirty reuse and must be wiped. Large blocks
        // are always freshly mapped pages, which the kernel zero-fills.
        // Safety: p was just handed out by this heap with `total` usable bytes.
        unsafe {
            let h = header_of(NonNull::new_unchecked(p));
            if h.as_ref().size() <= MAX_POOL_BLOCK {
                std::ptr::write_bytes(p, 0, total);
            }
        }
        p
    }

    /// Resize the allocation at `ptr` to at least `size` bytes.
    ///
    /// Null `ptr` behaves as [`alloc`](Self::alloc). `size == 0` or an
    /// over-limit `size` returns null and leaves `ptr` untouched. A block
    /// already big enough is returned as-is; a pooled block tries to grow
    /// in place by merging free buddies first. Otherwise the contents move
    /// to a fresh allocation and the old block is released. If the fresh
    /// allocation fails, null is returned and the old block stays valid
    /// and owned by the caller.
    ///
    /// # Safety
    /// `ptr` must be null or a live payload pointer from this heap.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(size);
        }
        if size == 0 || size > MAX_REQUEST {
            return std::ptr::null_mut();
        }

        // Safety: upheld by caller.
        unsafe {
            let h = header_of(NonNull::new_unchecked(ptr));
            h.as_ref().check_canary();
            let current = h.as_ref().size();
            let required = size + HEADER_SIZE;

            // Shrink and same-size keep the whole block; it is not split.
            if required <= current {
                return ptr;
            }

            if current <= MAX_POOL_BLOCK {
                if let Some(grown) = self.pool.try_grow(h, required, &mut self.stats) {
                    return grown.as_ptr();
                }
            }

            let fresh = self.alloc(size);
            if fresh.is_null() {
                return std::ptr::null_mut();
            }
            let copy_len = (current - HEADER_SIZE).min(size);
            std::ptr::copy_nonoverlapping(ptr, fresh, copy_len);
            self.release(ptr);
            fresh
        }
    }

    /// Release the allocation at `ptr`. Null, addresses below one header
    /// width, and already-free pooled blocks are ignored silently.
    ///
    /// # Safety
    /// `ptr` must be null, clearly invalid (below one header width), or a
    /// payload pointer from this heap that is not a released large block.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if (ptr as usize) < HEADER_SIZE {
            return;
        }
        // Safety: upheld by caller.
        unsafe {
            let h = header_of(NonNull::new_unchecked(ptr));
            h.as_ref().check_canary();
            if h.as_ref().size() > MAX_POOL_BLOCK {
                self.large.release(h, &mut self.stats);
            } else {
                self.pool.release(h, &mut self.stats);
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Header bytes per managed block; compile-time constant.
    #[must_use]
    pub const fn size_meta_data() -> usize {
        HEADER_SIZE
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    #[cfg(test)]
    pub(crate) fn large(&self) -> &LargeList {
        &self.large
    }
}

// ---------------------------------------------------------------------------
// Process-wide heap
// ---------------------------------------------------------------------------

enum GlobalState {
    /// No allocation request seen yet.
    Unborn,
    /// Initialization failed once; it is not retried. Every call nulls.
    Failed,
    Live(BuddyHeap),
}

static GLOBAL: Mutex<GlobalState> = Mutex::new(GlobalState::Unborn);

/// The process-wide heap behind the C-style entry points. Initialized
/// lazily by the first allocation request; a failed initialization is
/// terminal. The mutex only satisfies Rust's aliasing rules for a
/// `static`; the engine itself remains single-threaded and callers are
/// expected to serialize.
pub struct GlobalHeap;

impl GlobalHeap {
    fn with_live<R>(default: R, f: impl FnOnce(&mut BuddyHeap) -> R) -> R {
        let mut slot = GLOBAL
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if matches!(*slot, GlobalState::Unborn) {
            *slot = match BuddyHeap::new() {
                Ok(heap) => GlobalState::Live(heap),
                Err(_e) => {
                    #[cfg(debug_assertions)]
                    eprintln!("[buddyheap] global heap initialization failed: {_e}");
                    GlobalState::Failed
                }
            };
        }
        match &mut *slot {
            GlobalState::Live(heap) => f(heap),
            GlobalState::Unborn | GlobalState::Failed => default,
        }
    }

    fn probe(f: impl FnOnce(StatsSnapshot) -> usize) -> usize {
        let slot = GLOBAL
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &*slot {
            GlobalState::Live(heap) => f(heap.stats()),
            GlobalState::Unborn | GlobalState::Failed => 0,
        }
    }

    /// Allocate at least `size` bytes; see [`BuddyHeap::alloc`].
    pub fn alloc(size: usize) -> *mut u8 {
        Self::with_live(std::ptr::null_mut(), |heap| heap.alloc(size))
    }

    /// Allocate `count * size` zeroed bytes; see [`BuddyHeap::zeroed_alloc`].
    pub fn zeroed_alloc(count: usize, size: usize) -> *mut u8 {
        Self::with_live(std::ptr::null_mut(), |heap| heap.zeroed_alloc(count, size))
    }

    /// Resize an allocation; see [`BuddyHeap::reallocate`].
    ///
    /// # Safety
    /// `ptr` must be null or a live payload pointer from the global heap.
    pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
        // Safety: upheld by caller.
        Self::with_live(std::ptr::null_mut(), |heap| unsafe {
            heap.reallocate(ptr, size)
        })
    }

    /// Release an allocation; see [`BuddyHeap::release`]. A release before
    /// any allocation is a no-op and does not initialize the heap.
    ///
    /// # Safety
    /// `ptr` must be null, clearly invalid (below one header width), or a
    /// payload pointer from the global heap that is not a released large
    /// block.
    pub unsafe fn release(ptr: *mut u8) {
        let mut slot = GLOBAL
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let GlobalState::Live(heap) = &mut *slot {
            // Safety: upheld by caller.
            unsafe { heap.release(ptr) };
        }
    }

    #[must_use]
    pub fn num_free_blocks() -> usize {
        Self::probe(|s| s.free_blocks)
    }

    #[must_use]
    pub fn num_free_bytes() -> usize {
        Self::probe(|s| s.free_bytes)
    }

    #[must_use]
    pub fn num_allocated_blocks() -> usize {
        Self::probe(|s| s.allocated_blocks)
    }

    #[must_use]
    pub fn num_allocated_bytes() -> usize {
        Self::probe(|s| s.allocated_bytes)
    }

    #[must_use]
    pub fn num_meta_data_bytes() -> usize {
        Self::probe(|s| s.meta_data_bytes)
    }

    /// Header bytes per managed block; compile-time constant.
    #[must_use]
    pub const fn size_meta_data() -> usize {
        HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::header::{MAX_ORDER, MIN_BLOCK};

    #[test]
    fn test_alloc_rejects_zero_and_over_limit() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();
        assert!(heap.alloc(0).is_null());
        assert!(heap.alloc(MAX_REQUEST + 1).is_null());
        assert!(heap.alloc(usize::MAX).is_null());
        // Negative sizes cast through usize land far over the limit.
        assert!(heap.alloc((-100i64) as usize).is_null());
    }

    #[test]
    fn test_dispatch_threshold_is_strict() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();

        // Largest request that still fits a pooled block.
        let pooled = heap.alloc(MAX_POOL_BLOCK - HEADER_SIZE);
        assert!(!pooled.is_null());
        assert_eq!(heap.large().len(), 0);

        // One byte more spills to a page mapping.
        let large = heap.alloc(MAX_POOL_BLOCK - HEADER_SIZE + 1);
        assert!(!large.is_null());
        assert_eq!(heap.large().len(), 1);

        // Safety: Test code.
        unsafe {
            heap.release(pooled);
            heap.release(large);
        }
        assert_eq!(heap.large().len(), 0);
        heap.pool().check_consistency();
    }

    #[test]
    fn test_zeroed_alloc_rejects_bad_inputs() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();
        assert!(heap.zeroed_alloc(0, 16).is_null());
        assert!(heap.zeroed_alloc(16, 0).is_null());
        assert!(heap.zeroed_alloc(20_000, 20_000).is_null()); // product over limit
        assert!(heap.zeroed_alloc(usize::MAX, 2).is_null()); // product overflows
    }

    #[test]
    fn test_zeroed_alloc_wipes_dirty_pooled_reuse() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();

        let p = heap.alloc(64);
        assert!(!p.is_null());
        // Safety: Test code; dirty the payload then free it.
        unsafe {
            std::ptr::write_bytes(p, 0x55, 64);
            heap.release(p);
        }

        let q = heap.zeroed_alloc(8, 8);
        assert_eq!(q, p, "first fit must reuse the freed block");
        // Safety: Test code.
        unsafe {
            let slice = std::slice::from_raw_parts(q, 64);
            assert!(slice.iter().all(|&b| b == 0), "reused payload not zeroed");
            heap.release(q);
        }
    }

    #[test]
    fn test_zeroed_alloc_large_path_is_zero() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();

        let len = 300_000usize;
        let p = heap.zeroed_alloc(len, 1);
        assert!(!p.is_null());
        assert_eq!(heap.large().len(), 1);
        // Safety: Test code.
        unsafe {
            let slice = std::slice::from_raw_parts(p, len);
            assert!(slice.iter().all(|&b| b == 0));
            heap.release(p);
        }
    }

    #[test]
    fn test_release_ignores_null_and_tiny_addresses() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();
        let before = heap.stats();
        // Safety: Test code; both pointers are in the "clearly invalid" range.
        unsafe {
            heap.release(std::ptr::null_mut());
            heap.release(8 as *mut u8);
        }
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn test_reallocate_null_acts_as_alloc() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();
        // Safety: Test code.
        unsafe {
            let p = heap.reallocate(std::ptr::null_mut(), 50);
            assert!(!p.is_null());
            heap.release(p);
        }
    }

    #[test]
    fn test_reallocate_zero_and_over_limit_keep_old_block() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();
        let p = heap.alloc(50);
        assert!(!p.is_null());
        // Safety: Test code.
        unsafe {
            *p = 0x77;
            assert!(heap.reallocate(p, 0).is_null());
            assert!(heap.reallocate(p, MAX_REQUEST + 1).is_null());
            // The old block is still live and untouched.
            assert_eq!(*p, 0x77);
            heap.release(p);
        }
    }

    #[test]
    fn test_reallocate_shrink_keeps_block_whole() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();
        let p = heap.alloc(400);
        let bytes_before = heap.stats().allocated_bytes;
        // Safety: Test code.
        unsafe {
            let q = heap.reallocate(p, 10);
            assert_eq!(q, p);
            // No split happened: the ledger is unchanged.
            assert_eq!(heap.stats().allocated_bytes, bytes_before);
            heap.release(q);
        }
    }

    #[test]
    fn test_reallocate_move_preserves_contents() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();

        let p = heap.alloc(40);
        let barrier = heap.alloc(40); // occupies p's buddy, forcing a move
        // Safety: Test code.
        unsafe {
            for i in 0..40 {
                *p.add(i) = i as u8;
            }
            let q = heap.reallocate(p, 4000);
            assert!(!q.is_null());
            assert_ne!(q, p);
            for i in 0..40 {
                assert_eq!(*q.add(i), i as u8);
            }
            heap.release(q);
            heap.release(barrier);
        }
        heap.pool().check_consistency();
    }

    #[test]
    fn test_reallocate_pooled_to_large_moves() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();

        let p = heap.alloc(1000);
        // Safety: Test code.
        unsafe {
            std::ptr::write_bytes(p, 0x42, 1000);
            let q = heap.reallocate(p, 500_000);
            assert!(!q.is_null());
            assert_ne!(q, p);
            assert_eq!(heap.large().len(), 1);
            let slice = std::slice::from_raw_parts(q, 1000);
            assert!(slice.iter().all(|&b| b == 0x42));
            heap.release(q);
        }
        heap.pool().check_consistency();
    }

    #[test]
    fn test_reallocate_large_shrink_and_grow() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();

        let p = heap.alloc(200_000);
        assert_eq!(heap.large().len(), 1);
        // Safety: Test code.
        unsafe {
            *p = 9;
            // Shrink within the mapping: same pointer.
            let q = heap.reallocate(p, 150_000);
            assert_eq!(q, p);

            // Grow past the mapping: move to a fresh one.
            let r = heap.reallocate(q, 400_000);
            assert!(!r.is_null());
            assert_ne!(r, q);
            assert_eq!(*r, 9);
            assert_eq!(heap.large().len(), 1);
            heap.release(r);
        }
        assert_eq!(heap.large().len(), 0);
    }

    #[test]
    fn test_max_request_boundary() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();
        // The limit itself must not crash; whether it succeeds is up to
        // the OS. Over the limit must null.
        let p = heap.alloc(MAX_REQUEST);
        if !p.is_null() {
            // Safety: Test code.
            unsafe { heap.release(p) };
        }
        assert!(heap.alloc(MAX_REQUEST + 1).is_null());
    }

    #[test]
    fn test_small_config_pool() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::with_config(HeapConfig { initial_blocks: 2 }).unwrap();
        assert_eq!(heap.stats().allocated_blocks, 2);

        let a = heap.alloc(MAX_POOL_BLOCK - HEADER_SIZE);
        let b = heap.alloc(MAX_POOL_BLOCK - HEADER_SIZE);
        assert!(!a.is_null() && !b.is_null());
        assert!(heap.alloc(MIN_BLOCK).is_null(), "two-block pool must be exhausted");
        // Safety: Test code.
        unsafe {
            heap.release(a);
            heap.release(b);
        }
        heap.pool().check_consistency();
    }

    #[test]
    fn test_zero_block_config_is_rejected() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        assert!(BuddyHeap::with_config(HeapConfig { initial_blocks: 0 }).is_err());
    }

    #[test]
    fn test_meta_data_probes() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());
        let mut heap = BuddyHeap::new().unwrap();
        assert_eq!(BuddyHeap::size_meta_data(), HEADER_SIZE);

        let before = heap.stats();
        assert_eq!(before.meta_data_bytes, HEADER_SIZE * before.allocated_blocks);

        let p = heap.alloc(100);
        let after = heap.stats();
        // alloc(100) split a top block once per order.
        assert_eq!(after.allocated_blocks, before.allocated_blocks + MAX_ORDER);
        assert_eq!(after.meta_data_bytes, HEADER_SIZE * after.allocated_blocks);
        // Safety: Test code.
        unsafe { heap.release(p) };
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn test_global_heap_smoke() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap_or_else(|e| e.into_inner());

        let p = GlobalHeap::alloc(100);
        assert!(!p.is_null());
        assert!(GlobalHeap::num_allocated_blocks() > 0);
        assert_eq!(
            GlobalHeap::num_meta_data_bytes(),
            GlobalHeap::size_meta_data() * GlobalHeap::num_allocated_blocks(),
        );

        // Safety: Test code.
        unsafe { GlobalHeap::release(p) };
        assert!(GlobalHeap::num_free_blocks() > 0);
        assert!(GlobalHeap::num_free_blocks() <= GlobalHeap::num_allocated_blocks());

        let q = GlobalHeap::zeroed_alloc(10, 10);
        assert!(!q.is_null());
        // Safety: Test code.
        unsafe {
            assert!(std::slice::from_raw_parts(q, 100).iter().all(|&b| b == 0));
            let r = GlobalHeap::reallocate(q, 200);
            assert!(!r.is_null());
            GlobalHeap::release(r);
        }

        // Invalid inputs never initialize anything or crash.
        assert!(GlobalHeap::alloc(0).is_null());
        assert!(GlobalHeap::zeroed_alloc(0, 0).is_null());
        // Safety: Test code.
        unsafe { GlobalHeap::release(std::ptr::null_mut()) };
    }
}
