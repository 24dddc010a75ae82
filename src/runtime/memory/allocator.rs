use super::Block;
use crate::error::{CxlError, CxlResult};
use crate::utils::{align_padding, align_up, is_valid_alignment};
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub const DEFAULT_ALIGNMENT: usize = 64;

/// Occupancy snapshot of a [`BlockAllocator`]. `used + free == total` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
}

#[derive(Debug)]
struct State {
    // Sorted by offset, never two adjacent entries.
    free: Vec<Block>,
    // Start offset -> length.
    allocated: BTreeMap<usize, usize>,
}

impl State {
    fn largest_free(&self) -> usize {
        self.free.iter().map(|b| b.len).max().unwrap_or(0)
    }

    /// Merges touching free blocks until no adjacent pair is left.
    fn coalesce(&mut self) {
        loop {
            let before = self.free.len();
            let mut merged: Vec<Block> = Vec::with_capacity(before);

            for block in self.free.drain(..) {
                match merged.last_mut() {
                    Some(prev) if prev.end() == block.offset => prev.len += block.len,
                    _ => merged.push(block),
                }
            }

            self.free = merged;
            if self.free.len() == before {
                break;
            }
        }
    }
}

/// First-fit sub-allocator over the byte range `[0, total)` of a region.
///
/// Hands out offsets, never pointers. All operations run under one mutex and never block
/// on I/O while holding it.
#[derive(Debug)]
pub struct BlockAllocator {
    total: usize,
    state: Mutex<State>,
}

impl BlockAllocator {
    #[must_use]
    pub fn new(total: usize) -> Self {
        let free = if total == 0 {
            Vec::new()
        } else {
            vec![Block::new(0, total)]
        };

        Self {
            total,
            state: Mutex::new(State {
                free,
                allocated: BTreeMap::new(),
            }),
        }
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Reserves `size` bytes aligned to `align` and returns the offset.
    ///
    /// The size is rounded up to a multiple of `align`; any padding needed to align the
    /// start of the chosen free block stays on the free list.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size or an alignment that is not a power of two,
    /// `OutOfMemory` if no free block can hold the request. State is unchanged on error.
    pub fn allocate(&self, size: usize, align: usize) -> CxlResult<usize> {
        if size == 0 {
            return Err(CxlError::InvalidArgument(
                "allocation size must be non-zero".into(),
            ));
        }
        if !is_valid_alignment(align) {
            return Err(CxlError::InvalidArgument(format!(
                "alignment {align} is not a power of two"
            )));
        }

        let mut state = self.state.lock();

        let Some(rounded) = align_up(size, align) else {
            return Err(CxlError::OutOfMemory {
                requested: size,
                align,
                largest_free: state.largest_free(),
            });
        };

        let found = state.free.iter().enumerate().find_map(|(idx, block)| {
            let pad = align_padding(block.offset, align);
            (pad <= block.len && block.len - pad >= rounded).then_some((idx, pad))
        });
        let Some((idx, pad)) = found else {
            return Err(CxlError::OutOfMemory {
                requested: size,
                align,
                largest_free: state.largest_free(),
            });
        };

        let block = state.free[idx];
        let start = block.offset + pad;
        let end = start + rounded;

        // Leading waste and trailing remainder replace the block in place, keeping the order.
        state.free.remove(idx);
        let mut at = idx;
        if pad > 0 {
            state.free.insert(at, Block::new(block.offset, pad));
            at += 1;
        }
        if end < block.end() {
            state.free.insert(at, Block::new(end, block.end() - end));
        }
        state.allocated.insert(start, rounded);
        drop(state);

        tracing::debug!("allocated region block [{start:#x}, +{rounded:#x}) (align {align})");
        Ok(start)
    }

    /// Returns the block starting at `offset` to the free list.
    ///
    /// # Errors
    /// `NotAllocated` if no allocated block starts at `offset`.
    pub fn free(&self, offset: usize) -> CxlResult<()> {
        let mut state = self.state.lock();

        let Some(len) = state.allocated.remove(&offset) else {
            drop(state);
            tracing::warn!("rejected free of untracked region offset {offset:#x}");
            return Err(CxlError::NotAllocated { offset });
        };

        let pos = state.free.partition_point(|b| b.offset < offset);
        state.free.insert(pos, Block::new(offset, len));
        state.coalesce();
        drop(state);

        tracing::debug!("freed region block [{offset:#x}, +{len:#x})");
        Ok(())
    }

    /// Length of the allocated block starting at `offset`, if any.
    #[must_use]
    pub fn block_len(&self, offset: usize) -> Option<usize> {
        self.state.lock().allocated.get(&offset).copied()
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        let used = state.allocated.values().sum();
        let free = state.free.iter().map(|b| b.len).sum();
        AllocatorStats {
            total: self.total,
            used,
            free,
        }
    }

    #[must_use]
    pub fn largest_free(&self) -> usize {
        self.state.lock().largest_free()
    }

    /// Snapshot of the free list in offset order.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<Block> {
        self.state.lock().free.clone()
    }

    /// Snapshot of the allocated blocks in offset order.
    #[must_use]
    pub fn allocated_blocks(&self) -> Vec<Block> {
        self.state
            .lock()
            .allocated
            .iter()
            .map(|(&offset, &len)| Block::new(offset, len))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn full_region_then_small_allocation_scenario() {
        let alloc = BlockAllocator::new(MIB);

        assert_eq!(alloc.allocate(MIB - 64, 64).unwrap(), 0);
        assert!(matches!(
            alloc.allocate(128, DEFAULT_ALIGNMENT),
            Err(CxlError::OutOfMemory { requested: 128, .. })
        ));

        alloc.free(0).unwrap();
        assert_eq!(alloc.allocate(128, DEFAULT_ALIGNMENT).unwrap(), 0);
    }

    #[test]
    fn size_is_rounded_to_alignment() {
        let alloc = BlockAllocator::new(4096);
        let a = alloc.allocate(1, 64).unwrap();
        let b = alloc.allocate(1, 64).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 64);
        assert_eq!(alloc.block_len(a), Some(64));
        assert_eq!(alloc.stats().used, 128);
    }

    #[test]
    fn alignment_padding_stays_free() {
        let alloc = BlockAllocator::new(8192);
        alloc.allocate(64, 64).unwrap();
        let aligned = alloc.allocate(100, 4096).unwrap();
        assert_eq!(aligned, 4096);

        assert_eq!(alloc.free_blocks(), vec![Block::new(64, 4096 - 64)]);
        let stats = alloc.stats();
        assert_eq!(stats.used + stats.free, stats.total);
    }

    #[test]
    fn first_fit_takes_lowest_hole() {
        let alloc = BlockAllocator::new(4096);
        let a = alloc.allocate(256, 64).unwrap();
        let _b = alloc.allocate(256, 64).unwrap();
        let c = alloc.allocate(256, 64).unwrap();
        alloc.free(a).unwrap();
        alloc.free(c).unwrap();

        // Both holes fit; the one stored first wins even though it is not the tightest.
        assert_eq!(alloc.allocate(128, 64).unwrap(), a);
    }

    #[test]
    fn free_merges_both_neighbours() {
        let alloc = BlockAllocator::new(3 * 64);
        let a = alloc.allocate(64, 64).unwrap();
        let b = alloc.allocate(64, 64).unwrap();
        let c = alloc.allocate(64, 64).unwrap();

        alloc.free(a).unwrap();
        alloc.free(c).unwrap();
        assert_eq!(alloc.free_blocks().len(), 2);

        alloc.free(b).unwrap();
        assert_eq!(alloc.free_blocks(), vec![Block::new(0, 192)]);
    }

    #[test]
    fn double_free_is_rejected_without_corruption() {
        let alloc = BlockAllocator::new(4096);
        let a = alloc.allocate(512, 64).unwrap();
        alloc.free(a).unwrap();
        let before = alloc.free_blocks();

        assert!(matches!(
            alloc.free(a),
            Err(CxlError::NotAllocated { offset }) if offset == a
        ));
        assert_eq!(alloc.free_blocks(), before);
        assert!(alloc.free(17).is_err());
    }

    #[test]
    fn out_of_memory_leaves_state_unchanged() {
        let alloc = BlockAllocator::new(4096);
        alloc.allocate(1024, 64).unwrap();
        let free_before = alloc.free_blocks();
        let used_before = alloc.allocated_blocks();

        let err = alloc.allocate(4096, 64).unwrap_err();
        assert!(matches!(
            err,
            CxlError::OutOfMemory {
                largest_free: 3072,
                ..
            }
        ));
        assert_eq!(alloc.free_blocks(), free_before);
        assert_eq!(alloc.allocated_blocks(), used_before);
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let alloc = BlockAllocator::new(4096);
        assert!(matches!(
            alloc.allocate(0, 64),
            Err(CxlError::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc.allocate(64, 0),
            Err(CxlError::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc.allocate(64, 96),
            Err(CxlError::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc.allocate(usize::MAX, 64),
            Err(CxlError::OutOfMemory { .. })
        ));
        assert_eq!(alloc.allocate(3, 1).unwrap(), 0);
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        let alloc = std::sync::Arc::new(BlockAllocator::new(MIB));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..64 {
                        mine.push(alloc.allocate(64 + i * 8, 64).unwrap());
                        if i % 3 == 0 {
                            alloc.free(mine.remove(0)).unwrap();
                        }
                    }
                    mine
                })
            })
            .collect();
        for t in threads {
            t.join().expect("thread panicked");
        }

        let blocks = alloc.allocated_blocks();
        for pair in blocks.windows(2) {
            assert!(pair[0].end() <= pair[1].offset);
        }
        let stats = alloc.stats();
        assert_eq!(stats.used + stats.free, MIB);
    }
}
