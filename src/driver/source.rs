#![allow(clippy::cast_possible_wrap)]

use crate::error::{CxlError, CxlResult};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

/// A contiguous span of mapped bytes handed out by a [`RegionSource`].
///
/// The span does not own the mapping; it must be returned to the source that produced it.
#[derive(Debug)]
pub struct RawSpan {
    ptr: NonNull<u8>,
    len: usize,
}

// The span is an address range; access to it is synchronized by `MappedRegion`.
unsafe impl Send for RawSpan {}
unsafe impl Sync for RawSpan {}

impl RawSpan {
    /// # Safety
    /// `ptr` must point to `len` bytes that stay mapped read/write until the span is closed.
    #[must_use]
    pub const unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Capability that acquires and releases the backing memory of a region.
pub trait RegionSource: Send + Sync {
    /// Human readable origin of the mapping, used in diagnostics.
    fn describe(&self) -> String;

    /// Map `size` bytes.
    fn open(&self, size: usize) -> CxlResult<RawSpan>;

    /// Release a span previously returned by `open`.
    fn close(&self, span: RawSpan) -> CxlResult<()>;
}

/// Maps a CXL device node (or any file) with `MAP_SHARED`.
#[derive(Debug, Clone)]
pub struct DeviceFileSource {
    path: PathBuf,
}

impl DeviceFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map_failed(&self, size: usize, source: io::Error) -> CxlError {
        CxlError::MapFailed {
            origin: self.describe(),
            size,
            source,
        }
    }
}

impl RegionSource for DeviceFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&self, size: usize) -> CxlResult<RawSpan> {
        if size == 0 {
            return Err(CxlError::InvalidArgument(
                "region size must be non-zero".into(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => CxlError::NotFound {
                    path: self.path.clone(),
                },
                _ => self.map_failed(size, e),
            })?;

        // Touching pages past the end of a regular file raises SIGBUS.
        let meta = file.metadata().map_err(|e| self.map_failed(size, e))?;
        if meta.is_file() && meta.len() < size as u64 {
            return Err(self.map_failed(
                size,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("backing file holds only {} bytes", meta.len()),
                ),
            ));
        }

        // The mapping keeps its own reference to the file; the descriptor can close afterwards.
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(self.map_failed(size, io::Error::last_os_error()));
        }

        let ptr = NonNull::new(ret.cast::<u8>())
            .ok_or_else(|| self.map_failed(size, io::Error::other("mmap returned null")))?;
        Ok(unsafe { RawSpan::from_raw_parts(ptr, size) })
    }

    fn close(&self, span: RawSpan) -> CxlResult<()> {
        unmap(span)
    }
}

/// Private anonymous memory, standing in for the device when no hardware is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousSource;

impl RegionSource for AnonymousSource {
    fn describe(&self) -> String {
        "anonymous".to_string()
    }

    fn open(&self, size: usize) -> CxlResult<RawSpan> {
        if size == 0 {
            return Err(CxlError::InvalidArgument(
                "region size must be non-zero".into(),
            ));
        }

        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(CxlError::MapFailed {
                origin: self.describe(),
                size,
                source: io::Error::last_os_error(),
            });
        }

        let ptr = NonNull::new(ret.cast::<u8>()).ok_or_else(|| CxlError::MapFailed {
            origin: self.describe(),
            size,
            source: io::Error::other("mmap returned null"),
        })?;
        Ok(unsafe { RawSpan::from_raw_parts(ptr, size) })
    }

    fn close(&self, span: RawSpan) -> CxlResult<()> {
        unmap(span)
    }
}

fn unmap(span: RawSpan) -> CxlResult<()> {
    let ret = unsafe { libc::munmap(span.as_ptr().cast(), span.len()) };
    if ret < 0 {
        return Err(CxlError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_device_reports_not_found() {
        let source = DeviceFileSource::new("/nonexistent/cxl0");
        let err = source.open(4096).unwrap_err();
        assert!(matches!(err, CxlError::NotFound { .. }), "{err}");
    }

    #[test]
    fn short_backing_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 100]).unwrap();

        let source = DeviceFileSource::new(file.path());
        let err = source.open(4096).unwrap_err();
        assert!(matches!(err, CxlError::MapFailed { .. }), "{err}");
    }

    #[test]
    fn file_mapping_is_shared_with_the_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();

        let source = DeviceFileSource::new(file.path());
        let span = source.open(4096).unwrap();
        unsafe { span.as_ptr().add(10).write(0x5A) };
        source.close(span).unwrap();

        let bytes = std::fs::read(file.path()).unwrap();
        assert_eq!(bytes[10], 0x5A);
    }

    #[test]
    fn anonymous_mapping_is_zeroed() {
        let span = AnonymousSource.open(8192).unwrap();
        assert_eq!(span.len(), 8192);
        let first = unsafe { span.as_ptr().read() };
        assert_eq!(first, 0);
        AnonymousSource.close(span).unwrap();
    }

    #[test]
    fn zero_sized_region_is_rejected() {
        assert!(matches!(
            AnonymousSource.open(0),
            Err(CxlError::InvalidArgument(_))
        ));
    }
}
