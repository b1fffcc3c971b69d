use super::header::{payload_of, BlockHeader, HEADER_SIZE};
use super::stats::HeapStats;
use super::vm::{MemError, OsMemOps, PlatformMemOps};
use std::ptr::NonNull;

/// Registry of blocks too big for the pool. Each one is a private
/// anonymous mapping of its own, linked LIFO into a single doubly-linked
/// list; list order carries no meaning. Mapping and unmapping are paired
/// one-to-one with allocation and release; large blocks are never cached
/// or reused.
pub(crate) struct LargeList {
    head: *mut BlockHeader,
}

// Safety: LargeList owns every mapping its links point to.
unsafe impl Send for LargeList {}

impl LargeList {
    pub(crate) fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
        }
    }

    /// Map a fresh block of at least `required` bytes (header included),
    /// rounded up to the page size, and push it onto the list. A failed
    /// mapping links nothing.
    pub(crate) fn alloc(
        &mut self,
        required: usize,
        stats: &mut HeapStats,
    ) -> Result<NonNull<u8>, MemError> {
        let bytes = required.next_multiple_of(PlatformMemOps::page_size());
        // Safety: fresh private mapping of `bytes` bytes.
        let at = unsafe { PlatformMemOps::map_pages(bytes)? };
        // Safety: the mapping is ours and page-aligned.
        let h = unsafe { BlockHeader::stamp(at, bytes, false) };

        // Safety: h and the old head (if any) are live headers we own.
        unsafe {
            (*h.as_ptr()).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = h.as_ptr();
            }
            self.head = h.as_ptr();
        }

        stats.on_block_created(bytes - HEADER_SIZE);
        Ok(payload_of(h))
    }

    /// Unlink a block and return its pages to the OS. The header storage
    /// is gone afterwards; no further access is valid.
    ///
    /// # Safety
    /// `h` must be the header of a live block on this list.
    pub(crate) unsafe fn release(&mut self, h: NonNull<BlockHeader>, stats: &mut HeapStats) {
        let hp = h.as_ptr();
        // Safety: upheld by caller.
        unsafe {
            let size = (*hp).size();
            if (*hp).prev.is_null() {
                debug_assert_eq!(self.head, hp, "headless block claims to lead the large list");
                self.head = (*hp).next;
            } else {
                (*(*hp).prev).next = (*hp).next;
            }
            if !(*hp).next.is_null() {
                (*(*hp).next).prev = (*hp).prev;
            }

            stats.on_block_retired(size - HEADER_SIZE);
            // Safety: the mapping spans exactly [h, h + size).
            drop(PlatformMemOps::unmap_pages(h.cast::<u8>(), size));
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            n += 1;
            // Safety: list members are live headers.
            cur = unsafe { (*cur).next };
        }
        n
    }

    #[cfg(test)]
    pub(crate) fn head_addr(&self) -> usize {
        self.head as usize
    }
}

impl Drop for LargeList {
    fn drop(&mut self) {
        // Unmap anything a caller leaked so instance-per-test usage does
        // not accumulate mappings. The process-wide heap is never dropped.
        let mut cur = self.head;
        while !cur.is_null() {
            // Safety: list members are live headers whose mappings we own.
            unsafe {
                let next = (*cur).next;
                let size = (*cur).size();
                drop(PlatformMemOps::unmap_pages(
                    NonNull::new_unchecked(cur.cast::<u8>()),
                    size,
                ));
                cur = next;
            }
        }
    }
}
