use super::allocator::{AllocatorStats, BlockAllocator, DEFAULT_ALIGNMENT};
use crate::driver::source::RegionSource;
use crate::error::{CxlError, CxlResult};
use crate::runtime::region::{MappedRegion, RegionPtr};
use crate::utils::is_valid_alignment;

/// Flags controlling how a block is carved out of the region.
#[derive(Debug, Clone, Copy)]
pub struct AllocFlags {
    pub align: usize,
    pub zeroed: bool,
}

impl Default for AllocFlags {
    fn default() -> Self {
        Self {
            align: DEFAULT_ALIGNMENT,
            zeroed: false,
        }
    }
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub const fn zeroed(mut self) -> Self {
        self.zeroed = true;
        self
    }
}

/// A block of the region owned by one caller.
///
/// Not `Clone`: the block is released by handing the allocation back to
/// [`MemoryManager::free`]. Dropping it without freeing leaks the block.
#[derive(Debug)]
#[must_use = "an allocation must be freed through the MemoryManager"]
pub struct Allocation {
    ptr: RegionPtr,
    size: usize,
}

impl Allocation {
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.ptr.offset()
    }

    /// Usable length, the requested size rounded up to the alignment.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// The block's offset as a device command address.
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.ptr.offset() as u64
    }

    #[must_use]
    pub const fn ptr(&self) -> &RegionPtr {
        &self.ptr
    }

    fn check(&self, op: &'static str, at: usize, len: usize) -> CxlResult<()> {
        match at.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(CxlError::OutOfBounds {
                op,
                offset: self.offset().saturating_add(at),
                len,
                size: self.offset() + self.size,
            }),
        }
    }

    pub fn write(&self, at: usize, bytes: &[u8]) -> CxlResult<()> {
        self.check("write", at, bytes.len())?;
        self.ptr.write(at, bytes)
    }

    pub fn read(&self, at: usize, len: usize) -> CxlResult<Vec<u8>> {
        self.check("read", at, len)?;
        self.ptr.read(at, len)
    }

    pub fn fill(&self, at: usize, len: usize, byte: u8) -> CxlResult<()> {
        self.check("fill", at, len)?;
        self.ptr.fill(at, len, byte)
    }
}

/// The region together with its sub-allocator.
#[derive(Debug)]
pub struct MemoryManager {
    region: MappedRegion,
    allocator: BlockAllocator,
    default_align: usize,
}

impl MemoryManager {
    #[must_use]
    pub fn new(region: MappedRegion) -> Self {
        let allocator = BlockAllocator::new(region.size());
        Self {
            region,
            allocator,
            default_align: DEFAULT_ALIGNMENT,
        }
    }

    /// Changes the alignment used by [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// `InvalidArgument` if `align` is not a power of two.
    pub fn with_default_align(mut self, align: usize) -> CxlResult<Self> {
        if !is_valid_alignment(align) {
            return Err(CxlError::InvalidArgument(format!(
                "alignment {align} is not a power of two"
            )));
        }
        self.default_align = align;
        Ok(self)
    }

    /// Maps `size` bytes from `source` and manages them.
    pub fn open(source: impl RegionSource + 'static, size: usize) -> CxlResult<Self> {
        Ok(Self::new(MappedRegion::open(source, size)?))
    }

    #[must_use]
    pub const fn region(&self) -> &MappedRegion {
        &self.region
    }

    #[must_use]
    pub const fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    #[must_use]
    pub const fn default_align(&self) -> usize {
        self.default_align
    }

    /// Allocates `size` bytes with the default alignment (64 bytes unless configured).
    pub fn allocate(&self, size: usize) -> CxlResult<Allocation> {
        self.allocate_with(size, AllocFlags::new().align(self.default_align))
    }

    /// Unified allocation entry point.
    ///
    /// # Errors
    /// Allocator errors, or `NotInitialized` if the region has been closed.
    pub fn allocate_with(&self, size: usize, flags: AllocFlags) -> CxlResult<Allocation> {
        let offset = self.allocator.allocate(size, flags.align)?;
        let size = self.allocator.block_len(offset).unwrap_or(size);

        let ptr = match self.region.ptr(offset) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.roll_back(offset);
                return Err(e);
            }
        };

        let allocation = Allocation { ptr, size };
        if flags.zeroed
            && let Err(e) = allocation.fill(0, size, 0)
        {
            self.roll_back(offset);
            return Err(e);
        }

        Ok(allocation)
    }

    /// Returns a block reserved by a failed `allocate_with` to the free list.
    fn roll_back(&self, offset: usize) {
        if let Err(e) = self.allocator.free(offset) {
            tracing::warn!("failed to roll back block {offset:#x}: {e}");
        }
    }

    /// Releases a block previously returned by `allocate`.
    pub fn free(&self, allocation: Allocation) -> CxlResult<()> {
        self.allocator.free(allocation.offset())
    }

    /// Releases the block at `offset`, for callers that only kept the offset.
    pub fn free_offset(&self, offset: usize) -> CxlResult<()> {
        self.allocator.free(offset)
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> CxlResult<()> {
        self.region.write(offset, bytes)
    }

    pub fn read(&self, offset: usize, len: usize) -> CxlResult<Vec<u8>> {
        self.region.read(offset, len)
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::source::AnonymousSource;

    fn manager(size: usize) -> MemoryManager {
        MemoryManager::open(AnonymousSource, size).unwrap()
    }

    #[test]
    fn allocation_round_trips_through_the_region() {
        let mm = manager(64 * 1024);
        let a = mm.allocate(100).unwrap();
        assert_eq!(a.size(), 128);

        a.write(0, b"hello cxl").unwrap();
        assert_eq!(mm.read(a.offset(), 9).unwrap(), b"hello cxl");
        assert_eq!(a.read(0, 9).unwrap(), b"hello cxl");
        mm.free(a).unwrap();
        assert_eq!(mm.stats().used, 0);
    }

    #[test]
    fn allocation_access_is_confined_to_the_block() {
        let mm = manager(4096);
        let a = mm.allocate(64).unwrap();
        assert!(matches!(
            a.write(60, &[0u8; 8]),
            Err(CxlError::OutOfBounds { .. })
        ));
        mm.free(a).unwrap();
    }

    #[test]
    fn zeroed_flag_clears_recycled_memory() {
        let mm = manager(4096);
        let a = mm.allocate(256).unwrap();
        a.fill(0, 256, 0xEE).unwrap();
        mm.free(a).unwrap();

        let b = mm.allocate_with(256, AllocFlags::new().zeroed()).unwrap();
        assert!(b.read(0, 256).unwrap().iter().all(|&x| x == 0));
        mm.free(b).unwrap();
    }

    #[test]
    fn closed_region_releases_the_reserved_block() {
        let mm = manager(4096);
        mm.region().close();
        assert!(matches!(
            mm.allocate(64),
            Err(CxlError::NotInitialized { .. })
        ));
        assert_eq!(mm.stats().used, 0);
    }

    #[test]
    fn failed_zeroing_returns_the_block() {
        let mm = manager(4096);
        mm.region().close();
        assert!(matches!(
            mm.allocate_with(256, AllocFlags::new().zeroed()),
            Err(CxlError::NotInitialized { .. })
        ));
        assert_eq!(mm.stats().used, 0);
        assert_eq!(mm.allocator().free_blocks().len(), 1);
    }

    #[test]
    fn rolling_back_an_unknown_block_is_logged_not_fatal() {
        let mm = manager(4096);
        let a = mm.allocate(64).unwrap();
        mm.roll_back(a.offset() + 8);
        assert_eq!(mm.stats().used, a.size());
        mm.free(a).unwrap();
    }

    #[test]
    fn custom_alignment_is_honoured() {
        let mm = manager(64 * 1024);
        let small = mm.allocate(8).unwrap();
        let page = mm.allocate_with(8, AllocFlags::new().align(4096)).unwrap();
        assert_eq!(page.offset() % 4096, 0);
        assert_eq!(page.size(), 4096);
        mm.free(small).unwrap();
        mm.free(page).unwrap();
        assert_eq!(mm.allocator().free_blocks().len(), 1);
    }

    #[test]
    fn configured_default_alignment_applies_to_allocate() {
        let mm = manager(64 * 1024).with_default_align(1024).unwrap();
        let a = mm.allocate(1).unwrap();
        let b = mm.allocate(1).unwrap();
        assert_eq!(b.offset() - a.offset(), 1024);
        mm.free(a).unwrap();
        mm.free(b).unwrap();
        assert!(manager(4096).with_default_align(3).is_err());
    }
}
