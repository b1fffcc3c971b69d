//! The four allocation tallies the statistics probes report. Byte counters
//! track payload (block size minus header). Decrements saturate: the
//! counters are diagnostics for callers, not inputs to allocation
//! decisions, and must never wrap.

use super::header::HEADER_SIZE;

/// Point-in-time view of the heap counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Blocks currently sitting in a free-list bucket.
    pub free_blocks: usize,
    /// Payload bytes of those blocks.
    pub free_bytes: usize,
    /// Blocks managed by the heap: pooled blocks (free or owned) plus live
    /// large mappings.
    pub allocated_blocks: usize,
    /// Payload bytes of those blocks.
    pub allocated_bytes: usize,
    /// Header bytes across all managed blocks.
    pub meta_data_bytes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct HeapStats {
    free_blocks: usize,
    free_bytes: usize,
    allocated_blocks: usize,
    allocated_bytes: usize,
}

impl HeapStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A block entered a free-list bucket.
    pub(crate) fn on_free_insert(&mut self, payload: usize) {
        self.free_blocks += 1;
        self.free_bytes += payload;
    }

    /// A block left a free-list bucket.
    pub(crate) fn on_free_remove(&mut self, payload: usize) {
        self.free_blocks = self.free_blocks.saturating_sub(1);
        self.free_bytes = self.free_bytes.saturating_sub(payload);
    }

    /// A block came under heap management (pool carve or large mapping).
    pub(crate) fn on_block_created(&mut self, payload: usize) {
        self.allocated_blocks += 1;
        self.allocated_bytes += payload;
    }

    /// A block left heap management (large unmapping).
    pub(crate) fn on_block_retired(&mut self, payload: usize) {
        self.allocated_blocks = self.allocated_blocks.saturating_sub(1);
        self.allocated_bytes = self.allocated_bytes.saturating_sub(payload);
    }

    /// One block became two halves: one more block, and one header's worth
    /// of former payload now holds metadata.
    pub(crate) fn on_split(&mut self) {
        self.allocated_blocks += 1;
        self.allocated_bytes = self.allocated_bytes.saturating_sub(HEADER_SIZE);
    }

    /// Two buddies collapsed into one: the second header returns to payload.
    pub(crate) fn on_merge(&mut self) {
        self.allocated_blocks = self.allocated_blocks.saturating_sub(1);
        self.allocated_bytes += HEADER_SIZE;
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            free_blocks: self.free_blocks,
            free_bytes: self.free_bytes,
            allocated_blocks: self.allocated_blocks,
            allocated_bytes: self.allocated_bytes,
            meta_data_bytes: HEADER_SIZE * self.allocated_blocks,
        }
    }
}
