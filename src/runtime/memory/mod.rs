pub mod allocator;
pub mod manager;

/// A byte range `[offset, offset + len)` of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub offset: usize,
    pub len: usize,
}

impl Block {
    #[must_use]
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

// Re-export the main types for easy access
pub use allocator::{AllocatorStats, BlockAllocator, DEFAULT_ALIGNMENT};
pub use manager::{AllocFlags, Allocation, MemoryManager};
