use super::header::{
    buddy_of, order_for, payload_of, BlockHeader, HEADER_SIZE, MAX_ORDER, MAX_POOL_BLOCK,
    MIN_BLOCK, ORDER_COUNT,
};
use super::heap::HeapConfig;
use super::stats::HeapStats;
use super::vm::{MemError, OsMemOps, PlatformMemOps};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// The buddy free-list engine over the sbrk-reserved pool.
///
/// The pool is reserved once, aligned to its own total size, and carved
/// into maximum-order blocks. From then on blocks only split on allocation
/// and re-merge on release; nothing is ever returned to the OS.
///
/// Bucket `o` of `buckets` chains free blocks of exactly `MIN_BLOCK << o`
/// bytes in strictly ascending address order. Because the reservation base
/// is aligned to the whole region, every block carved or split from it is
/// aligned to its own size, which is what makes the XOR buddy rule valid.
pub(crate) struct Pool {
    base: NonNull<u8>,
    region_size: usize,
    buckets: [*mut BlockHeader; ORDER_COUNT],
    /// Debug shadow of the pool at order-0 granularity: a bit is set while
    /// its slot is covered by some free block. Insert and remove assert
    /// against it to catch overlap and double-link corruption.
    #[cfg(debug_assertions)]
    free_map: FixedBitSet,
}

// Safety: Pool owns its region; raw links only ever point into it.
unsafe impl Send for Pool {}

impl Pool {
    /// Reserve and carve the pool. One-shot: a failed extension leaves the
    /// break wherever sbrk put it and the caller must not retry.
    pub(crate) fn init(config: &HeapConfig, stats: &mut HeapStats) -> Result<Self, MemError> {
        if config.initial_blocks == 0 {
            return Err(MemError::InitFailed(
                "initial_blocks must be at least 1".to_string(),
            ));
        }
        let region = config.initial_blocks * MAX_POOL_BLOCK;

        let brk = PlatformMemOps::current_break()?.as_ptr() as usize;
        let pad = region - brk % region;
        if pad < region {
            // Safety: grow-only extension; the padding is simply abandoned.
            unsafe { PlatformMemOps::extend_break(pad)? };
        }
        // Safety: grow-only extension; the returned base is ours for good.
        let base = unsafe { PlatformMemOps::extend_break(region)? };
        if !(base.as_ptr() as usize).is_multiple_of(region) {
            // A foreign sbrk landed between the two extensions; the region
            // is unusable because self-alignment would not hold.
            return Err(MemError::InitFailed(format!(
                "pool base {:p} not aligned to region size {region:#x}",
                base.as_ptr(),
            )));
        }

        let mut pool = Self {
            base,
            region_size: region,
            buckets: [std::ptr::null_mut(); ORDER_COUNT],
            #[cfg(debug_assertions)]
            free_map: FixedBitSet::with_capacity(region / MIN_BLOCK),
        };

        for i in 0..config.initial_blocks {
            // Safety: i * MAX_POOL_BLOCK < region, and the slot is 8-aligned.
            let at = unsafe { NonNull::new_unchecked(base.as_ptr().add(i * MAX_POOL_BLOCK)) };
            // Safety: the slot is inside the fresh reservation.
            let h = unsafe { BlockHeader::stamp(at, MAX_POOL_BLOCK, true) };
            stats.on_block_created(MAX_POOL_BLOCK - HEADER_SIZE);
            pool.insert_free(h, stats);
        }

        Ok(pool)
    }

    /// Splice `h` into its bucket, keeping ascending address order.
    pub(crate) fn insert_free(&mut self, h: NonNull<BlockHeader>, stats: &mut HeapStats) {
        // Safety: h is a live pooled header owned by this pool.
        let size = unsafe { h.as_ref().size() };
        let o = order_for(size);
        debug_assert_eq!(size, MIN_BLOCK << o, "free block size is not its bucket size");
        #[cfg(debug_assertions)]
        self.shadow_set(h, size, true);

        let hp = h.as_ptr();
        // Safety: all touched headers are live members of this bucket.
        unsafe {
            let head = self.buckets[o];
            if head.is_null() || head > hp {
                (*hp).prev = std::ptr::null_mut();
                (*hp).next = head;
                if !head.is_null() {
                    (*head).prev = hp;
                }
                self.buckets[o] = hp;
            } else {
                let mut cur = head;
                while !(*cur).next.is_null() && (*cur).next < hp {
                    cur = (*cur).next;
                }
                debug_assert_ne!(cur, hp, "block inserted into its bucket twice");
                (*hp).next = (*cur).next;
                (*hp).prev = cur;
                if !(*cur).next.is_null() {
                    (*(*cur).next).prev = hp;
                }
                (*cur).next = hp;
            }
        }

        stats.on_free_insert(size - HEADER_SIZE);
    }

    /// Unlink `h` from its bucket and null its links.
    pub(crate) fn remove_free(&mut self, h: NonNull<BlockHeader>, stats: &mut HeapStats) {
        let hp = h.as_ptr();
        // Safety: h and its neighbors are live members of the same bucket.
        unsafe {
            let size = (*hp).size();
            let o = order_for(size);
            #[cfg(debug_assertions)]
            self.shadow_set(h, size, false);

            if (*hp).prev.is_null() {
                debug_assert_eq!(self.buckets[o], hp, "headless block claims to lead its bucket");
                self.buckets[o] = (*hp).next;
            } else {
                (*(*hp).prev).next = (*hp).next;
            }
            if !(*hp).next.is_null() {
                (*(*hp).next).prev = (*hp).prev;
            }
            (*hp).prev = std::ptr::null_mut();
            (*hp).next = std::ptr::null_mut();

            stats.on_free_remove(size - HEADER_SIZE);
        }
    }

    /// Serve `required` total bytes (header included) from the pool.
    ///
    /// First-fit by order, then lowest address within the bucket: scan
    /// `[order_for(required), MAX_ORDER]` for the first non-empty bucket,
    /// detach its head, and halve it until it is the target order, pushing
    /// each upper half one bucket down. Returns the payload pointer, or
    /// `None` when every candidate bucket is empty; the pool never grows.
    pub(crate) fn alloc(
        &mut self,
        required: usize,
        stats: &mut HeapStats,
    ) -> Option<NonNull<u8>> {
        debug_assert!(required <= MAX_POOL_BLOCK);
        let target = order_for(required);
        let o = (target..=MAX_ORDER).find(|&o| !self.buckets[o].is_null())?;

        // Safety: a non-null bucket head is a live header.
        let h = unsafe { NonNull::new_unchecked(self.buckets[o]) };
        self.remove_free(h, stats);
        // Safety: h is detached and exclusively ours now.
        unsafe {
            h.as_ref().check_canary();
            (*h.as_ptr()).set_free(false);
        }

        let mut order = o;
        let mut size = MIN_BLOCK << o;
        while order > target {
            let half = size / 2;
            // Safety: the upper half lies inside the block we just detached.
            let tail = unsafe {
                BlockHeader::stamp(
                    NonNull::new_unchecked(h.as_ptr().cast::<u8>().add(half)),
                    half,
                    true,
                )
            };
            // Safety: h is detached and exclusively ours.
            unsafe { (*h.as_ptr()).set_size(half) };
            self.insert_free(tail, stats);
            stats.on_split();
            size = half;
            order -= 1;
        }

        Some(payload_of(h))
    }

    /// Return an owned pooled block to its bucket, merging buddies upward.
    ///
    /// A block that is already free is left alone (double-release
    /// absorption). The merge loop stops at the first neighbor that is
    /// owned or split to a smaller order. Both checks matter: a free
    /// neighbor of the wrong size is not a buddy at this order.
    ///
    /// # Safety
    /// `h` must be the header of a block carved from this pool.
    pub(crate) unsafe fn release(&mut self, h: NonNull<BlockHeader>, stats: &mut HeapStats) {
        // Safety: upheld by caller.
        unsafe {
            if h.as_ref().is_free() {
                return;
            }
            (*h.as_ptr()).set_free(true);

            let mut h = h;
            let mut o = order_for(h.as_ref().size());
            while o < MAX_ORDER {
                let b = buddy_of(h);
                if !b.as_ref().is_free() || b.as_ref().size() != h.as_ref().size() {
                    break;
                }
                self.remove_free(b, stats);
                let merged = h.min(b);
                let doubled = h.as_ref().size() * 2;
                (*merged.as_ptr()).set_size(doubled);
                (*merged.as_ptr()).set_free(true);
                stats.on_merge();
                h = merged;
                o += 1;
            }

            self.insert_free(h, stats);
        }
    }

    /// Grow an owned block in place by merging free buddies, for
    /// reallocation. Two passes: a speculative one that only reads headers
    /// and checks, step by step, that the XOR buddy of the growing
    /// candidate is free and exactly candidate-sized; then, only if the
    /// candidate reached `required`, a commit pass that unlinks those
    /// buddies and doubles the block. Merging leftward moves the caller's
    /// payload down to the new base with an overlap-safe copy.
    ///
    /// Returns the (possibly moved) payload pointer, or `None` when the
    /// block cannot reach `required` in place; the block is untouched then.
    ///
    /// # Safety
    /// `h` must be the header of an owned block carved from this pool.
    pub(crate) unsafe fn try_grow(
        &mut self,
        h: NonNull<BlockHeader>,
        required: usize,
        stats: &mut HeapStats,
    ) -> Option<NonNull<u8>> {
        // Safety: upheld by caller.
        unsafe {
            debug_assert!(!h.as_ref().is_free());
            let start_size = h.as_ref().size();
            debug_assert!(required > start_size);

            let mut cand_addr = h.as_ptr() as usize;
            let mut cand_size = start_size;
            while cand_size < required {
                if cand_size >= MAX_POOL_BLOCK {
                    return None;
                }
                let b = (cand_addr ^ cand_size) as *const BlockHeader;
                if !(*b).is_free() || (*b).size() != cand_size {
                    return None;
                }
                cand_addr = cand_addr.min(b as usize);
                cand_size *= 2;
            }

            let old_payload = payload_of(h);
            let old_len = start_size - HEADER_SIZE;
            let mut cur = h;
            while cur.as_ref().size() < required {
                let b = buddy_of(cur);
                self.remove_free(b, stats);
                let merged = cur.min(b);
                let doubled = cur.as_ref().size() * 2;
                (*merged.as_ptr()).set_size(doubled);
                (*merged.as_ptr()).set_free(false);
                stats.on_merge();
                cur = merged;
            }

            let grown = payload_of(cur);
            if cur != h {
                // Safety: both ranges lie inside the merged block.
                std::ptr::copy(old_payload.as_ptr(), grown.as_ptr(), old_len);
            }
            Some(grown)
        }
    }

    #[cfg(debug_assertions)]
    fn shadow_set(&mut self, h: NonNull<BlockHeader>, size: usize, free: bool) {
        let start = (h.as_ptr() as usize - self.base.as_ptr() as usize) / MIN_BLOCK;
        for slot in start..start + size / MIN_BLOCK {
            assert_ne!(
                self.free_map.contains(slot),
                free,
                "free-map slot {slot} already {}",
                if free { "free" } else { "used" },
            );
            self.free_map.set(slot, free);
        }
    }

    /// Walk every bucket and assert the structural invariants: bucket
    /// blocks carry exactly their bucket's size and the free flag,
    /// addresses ascend strictly, every block is aligned to its own size
    /// and inside the region, and below the top order no two same-order
    /// buddies coexist in the lists.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self) {
        let base = self.base.as_ptr() as usize;
        for o in 0..ORDER_COUNT {
            let size = MIN_BLOCK << o;
            let mut cur = self.buckets[o];
            let mut last = 0usize;
            let mut prev_ptr: *mut BlockHeader = std::ptr::null_mut();
            while !cur.is_null() {
                // Safety: bucket members are live headers in the pool.
                unsafe {
                    let addr = cur as usize;
                    (*cur).check_canary();
                    assert_eq!((*cur).size(), size, "bucket {o} holds a wrong-size block");
                    assert!((*cur).is_free(), "bucket {o} holds an owned block");
                    assert!(addr.is_multiple_of(size), "block {addr:#x} not self-aligned");
                    assert!(
                        addr >= base && addr + size <= base + self.region_size,
                        "block {addr:#x} outside the pool",
                    );
                    assert!(addr > last, "bucket {o} not strictly ascending");
                    assert_eq!((*cur).prev, prev_ptr, "bucket {o} back-link broken");
                    if o < MAX_ORDER {
                        let b = (addr ^ size) as *const BlockHeader;
                        assert!(
                            !((*b).is_free() && (*b).size() == size),
                            "unmerged buddy pair at {addr:#x} in bucket {o}",
                        );
                    }
                    last = addr;
                    prev_ptr = cur;
                    cur = (*cur).next;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn bucket_len(&self, o: usize) -> usize {
        let mut n = 0;
        let mut cur = self.buckets[o];
        while !cur.is_null() {
            n += 1;
            // Safety: bucket members are live headers.
            cur = unsafe { (*cur).next };
        }
        n
    }
}
