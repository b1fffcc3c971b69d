#[cfg(not(target_pointer_width = "64"))]
compile_error!("buddyheap supports only 64-bit targets.");

#[cfg(not(unix))]
compile_error!("buddyheap requires a Unix program break (sbrk).");

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator + entry points
pub use memory::heap::{BuddyHeap, GlobalHeap, HeapConfig, MAX_REQUEST};

// block geometry
pub use memory::header::{INITIAL_BLOCKS, MAX_ORDER, MAX_POOL_BLOCK, MIN_BLOCK};

// stats
pub use memory::stats::StatsSnapshot;

// errors
pub use memory::vm::MemError;
