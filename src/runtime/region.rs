//! The mapped CXL region.
//!
//! [`MappedRegion`] is the single owner of the mapping. Everything else reaches the bytes
//! through a [`RegionPtr`], an offset plus a weak reference back to the owner, so every
//! access is re-validated against the region's liveness and bounds. Once the region is
//! closed no handle can reach the unmapped memory: accesses fail with `NotInitialized`.
//!
//! Reads and writes take a shared lock; `close` takes the exclusive lock and therefore
//! waits for in-flight accesses before unmapping. The region does not serialize data
//! accesses against each other: callers touching overlapping ranges concurrently observe
//! unspecified bytes, which is the same contract the device has with the host.

use crate::driver::source::{RawSpan, RegionSource};
use crate::error::{CxlError, CxlResult};
use parking_lot::RwLock;
use std::fmt;
use std::ptr;
use std::sync::{Arc, Weak};

struct RegionInner {
    size: usize,
    origin: String,
    span: RwLock<Option<RawSpan>>,
    source: Box<dyn RegionSource>,
}

impl RegionInner {
    /// Runs `f` on the address of `[offset, offset + len)` while holding the shared lock.
    fn with_raw<R>(
        &self,
        op: &'static str,
        offset: usize,
        len: usize,
        f: impl FnOnce(*mut u8) -> R,
    ) -> CxlResult<R> {
        let guard = self.span.read();
        let span = guard.as_ref().ok_or(CxlError::NotInitialized { op })?;
        check_bounds(op, offset, len, self.size)?;

        // In bounds of a live mapping, checked above.
        let addr = unsafe { span.as_ptr().add(offset) };
        Ok(f(addr))
    }

    /// Liveness and bounds check without touching memory.
    fn check(&self, op: &'static str, offset: usize, len: usize) -> CxlResult<()> {
        if !self.is_live() {
            return Err(CxlError::NotInitialized { op });
        }
        check_bounds(op, offset, len, self.size)
    }

    fn is_live(&self) -> bool {
        self.span.read().is_some()
    }

    fn close(&self) -> bool {
        let Some(span) = self.span.write().take() else {
            return false;
        };

        if let Err(e) = self.source.close(span) {
            tracing::error!("failed to unmap CXL region from {}: {e}", self.origin);
        }
        tracing::info!("closed CXL region {} ({:#x} bytes)", self.origin, self.size);
        true
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_bounds(op: &'static str, offset: usize, len: usize, size: usize) -> CxlResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(CxlError::OutOfBounds {
            op,
            offset,
            len,
            size,
        }),
    }
}

/// A contiguous byte region mapped from a [`RegionSource`].
pub struct MappedRegion {
    inner: Arc<RegionInner>,
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("origin", &self.inner.origin)
            .field("size", &self.inner.size)
            .field("live", &self.inner.is_live())
            .finish()
    }
}

impl MappedRegion {
    /// Maps `size` bytes from `source`.
    ///
    /// # Errors
    /// Propagates `NotFound`/`MapFailed` from the source. Nothing is left mapped on failure.
    pub fn open(source: impl RegionSource + 'static, size: usize) -> CxlResult<Self> {
        let span = source.open(size)?;
        let origin = source.describe();

        if span.len() != size {
            let len = span.len();
            source.close(span)?;
            return Err(CxlError::MapFailed {
                origin,
                size,
                source: std::io::Error::other(format!("source mapped {len} bytes")),
            });
        }

        tracing::info!("mapped CXL region {origin} ({size:#x} bytes)");

        Ok(Self {
            inner: Arc::new(RegionInner {
                size,
                origin,
                span: RwLock::new(Some(span)),
                source: Box::new(source),
            }),
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.is_live()
    }

    /// Copies `len` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: usize, len: usize) -> CxlResult<Vec<u8>> {
        // Reject the range before sizing the buffer from it.
        self.inner.check("read", offset, len)?;
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> CxlResult<()> {
        self.inner.with_raw("read", offset, buf.len(), |src| unsafe {
            ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        })
    }

    /// Copies `bytes` into the region at `offset`.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> CxlResult<()> {
        self.inner.with_raw("write", offset, bytes.len(), |dst| unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        })
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> CxlResult<()> {
        self.inner.with_raw("fill", offset, len, |dst| unsafe {
            ptr::write_bytes(dst, byte, len);
        })
    }

    /// Returns a handle to `offset`.
    ///
    /// # Errors
    /// `NotInitialized` after close, `OutOfBounds` if `offset` is not inside the region.
    pub fn ptr(&self, offset: usize) -> CxlResult<RegionPtr> {
        if !self.inner.is_live() {
            return Err(CxlError::NotInitialized { op: "ptr" });
        }
        if offset >= self.inner.size {
            return Err(CxlError::OutOfBounds {
                op: "ptr",
                offset,
                len: 0,
                size: self.inner.size,
            });
        }

        Ok(RegionPtr {
            region: Arc::downgrade(&self.inner),
            offset,
            size: self.inner.size,
        })
    }

    /// A handle to the whole region, for collaborators such as the simulated device.
    pub fn handle(&self) -> CxlResult<RegionPtr> {
        self.ptr(0)
    }

    /// Unmaps the region. Idempotent; returns whether this call performed the unmap.
    ///
    /// Blocks until in-flight accesses through any handle have finished.
    pub fn close(&self) -> bool {
        self.inner.close()
    }
}

/// An offset into a [`MappedRegion`] that does not keep the mapping alive.
///
/// All offsets passed to the methods are relative to [`RegionPtr::offset`].
#[derive(Clone)]
pub struct RegionPtr {
    region: Weak<RegionInner>,
    offset: usize,
    size: usize,
}

impl fmt::Debug for RegionPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionPtr")
            .field("offset", &self.offset)
            .field("live", &self.is_live())
            .finish()
    }
}

impl RegionPtr {
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the region this handle points into.
    #[must_use]
    pub const fn region_size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.region.upgrade().is_some_and(|inner| inner.is_live())
    }

    /// A handle `delta` bytes further into the region.
    pub fn add(&self, delta: usize) -> CxlResult<Self> {
        let offset = self
            .offset
            .checked_add(delta)
            .filter(|&o| o < self.size)
            .ok_or(CxlError::OutOfBounds {
                op: "ptr",
                offset: self.offset,
                len: delta,
                size: self.size,
            })?;

        Ok(Self {
            region: self.region.clone(),
            offset,
            size: self.size,
        })
    }

    fn resolve(&self, op: &'static str, at: usize) -> CxlResult<(Arc<RegionInner>, usize)> {
        let inner = self
            .region
            .upgrade()
            .ok_or(CxlError::NotInitialized { op })?;
        let offset = self.offset.checked_add(at).ok_or(CxlError::OutOfBounds {
            op,
            offset: self.offset,
            len: at,
            size: self.size,
        })?;
        Ok((inner, offset))
    }

    fn with_raw<R>(
        &self,
        op: &'static str,
        at: usize,
        len: usize,
        f: impl FnOnce(*mut u8) -> R,
    ) -> CxlResult<R> {
        let (inner, offset) = self.resolve(op, at)?;
        inner.with_raw(op, offset, len, f)
    }

    pub fn read(&self, at: usize, len: usize) -> CxlResult<Vec<u8>> {
        let (inner, offset) = self.resolve("read", at)?;
        inner.check("read", offset, len)?;
        drop(inner);

        let mut buf = vec![0u8; len];
        self.read_into(at, &mut buf)?;
        Ok(buf)
    }

    pub fn read_into(&self, at: usize, buf: &mut [u8]) -> CxlResult<()> {
        self.with_raw("read", at, buf.len(), |src| unsafe {
            ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        })
    }

    pub fn write(&self, at: usize, bytes: &[u8]) -> CxlResult<()> {
        self.with_raw("write", at, bytes.len(), |dst| unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        })
    }

    pub fn fill(&self, at: usize, len: usize, byte: u8) -> CxlResult<()> {
        self.with_raw("fill", at, len, |dst| unsafe {
            ptr::write_bytes(dst, byte, len);
        })
    }

    /// Copies `len` bytes from `src` to `dst` inside the region. The ranges may overlap.
    pub fn copy_within(&self, src: usize, dst: usize, len: usize) -> CxlResult<()> {
        let inner = self
            .region
            .upgrade()
            .ok_or(CxlError::NotInitialized { op: "copy" })?;
        let base = self.offset;
        let (Some(src), Some(dst)) = (base.checked_add(src), base.checked_add(dst)) else {
            return Err(CxlError::OutOfBounds {
                op: "copy",
                offset: base,
                len,
                size: self.size,
            });
        };

        let guard = inner.span.read();
        let span = guard.as_ref().ok_or(CxlError::NotInitialized { op: "copy" })?;
        check_bounds("copy", src, len, inner.size)?;
        check_bounds("copy", dst, len, inner.size)?;
        unsafe {
            ptr::copy(span.as_ptr().add(src), span.as_ptr().add(dst), len);
        }
        Ok(())
    }

    /// Zero-copy shared view of `[at, at + len)`.
    ///
    /// # Safety
    /// Nobody may write to the range while `f` runs: neither another thread nor the device.
    pub unsafe fn with_slice<R>(
        &self,
        at: usize,
        len: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> CxlResult<R> {
        self.with_raw("slice", at, len, |addr| {
            f(unsafe { std::slice::from_raw_parts(addr, len) })
        })
    }

    /// Zero-copy mutable view of `[at, at + len)`.
    ///
    /// # Safety
    /// The caller must have exclusive use of the range while `f` runs.
    pub unsafe fn with_slice_mut<R>(
        &self,
        at: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> CxlResult<R> {
        self.with_raw("slice", at, len, |addr| {
            f(unsafe { std::slice::from_raw_parts_mut(addr, len) })
        })
    }
}
