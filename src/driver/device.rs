use crate::driver::ioctl::{
    CXL_MEM_QUERY_CMD, CXL_MEM_SEND_COMMAND, CommandStatus, MemCommandArgs, QueryCommandArgs,
};
use crate::driver::{DeviceChannel, DeviceReport};
use crate::error::{CxlError, CxlResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

pub const DEFAULT_DEVICE_PATH: &str = "/dev/cxl0";

/// A handle to the CXL FPGA character device (`/dev/cxl0`).
///
/// This struct provides methods to issue IOCTLs to the kernel driver.
/// It wraps the file descriptor in an `Arc`, so it is cheap to clone and share
/// across command channels that need to persist beyond the initial context.
/// The descriptor is not exposed: commands only reach the driver through
/// `send_command`/`query_command`, which own the id space.
#[derive(Clone, Debug)]
pub struct CxlDevice {
    file: Arc<File>,
    path: PathBuf,
    next_id: Arc<AtomicU32>,
}

impl CxlDevice {
    /// Opens the CXL driver device.
    ///
    /// # Errors
    /// Returns `NotFound` if the node does not exist, or `Io` for other failures
    /// (e.g., driver not loaded, permissions).
    pub fn open(path: impl AsRef<Path>) -> CxlResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => CxlError::NotFound { path: path.clone() },
                _ => CxlError::Io(e),
            })?;

        Ok(Self {
            file: Arc::new(file),
            path,
            next_id: Arc::new(AtomicU32::new(1)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Queue a command on the FPGA.
    ///
    /// The driver copies `args` and tracks the command under `args.id`.
    pub fn send_command(&self, args: &mut MemCommandArgs) -> io::Result<()> {
        unsafe { self.ioctl(CXL_MEM_SEND_COMMAND, args) }
    }

    /// Query a queued command.
    ///
    /// On success, `args.status` and `args.result` are populated by the driver.
    /// The driver forgets a command once it has reported a terminal status for it.
    pub fn query_command(&self, args: &mut QueryCommandArgs) -> io::Result<()> {
        unsafe { self.ioctl(CXL_MEM_QUERY_CMD, args) }
    }

    /// Next driver command id. The counter starts at 1 and never wraps, so zero (the id
    /// of a zeroed query struct) is never issued and no id is reused.
    fn allocate_id(&self) -> CxlResult<u32> {
        self.next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map_err(|_| CxlError::Driver("device command id space exhausted".into()))
    }
}

impl DeviceChannel for CxlDevice {
    fn send(&self, opcode: u32, address: u64, data: u64) -> CxlResult<u64> {
        let mut args = MemCommandArgs {
            id: self.allocate_id()?,
            opcode,
            address,
            data,
        };

        self.send_command(&mut args).map_err(|e| {
            CxlError::Driver(format!(
                "CXL_MEM_SEND_COMMAND (opcode {opcode:#x}) failed: {e}"
            ))
        })?;
        Ok(u64::from(args.id))
    }

    fn query(&self, id: u64) -> CxlResult<DeviceReport> {
        let id = u32::try_from(id)
            .map_err(|_| CxlError::Driver(format!("device id {id} exceeds the 32-bit id space")))?;
        let mut args = QueryCommandArgs {
            id,
            ..Default::default()
        };

        self.query_command(&mut args)
            .map_err(|e| CxlError::Driver(format!("CXL_MEM_QUERY_CMD ({id}) failed: {e}")))?;

        Ok(DeviceReport {
            status: CommandStatus::from_wire(args.status)?,
            result: args.result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_node_is_not_found() {
        let err = CxlDevice::open("/nonexistent/cxl7").unwrap_err();
        assert!(matches!(err, CxlError::NotFound { .. }));
    }

    #[test]
    fn ioctl_on_regular_file_surfaces_driver_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let device = CxlDevice::open(file.path()).unwrap();

        let err = device.send(0, 0, 0).unwrap_err();
        assert!(matches!(err, CxlError::Driver(_)), "{err}");

        let err = device.query(1).unwrap_err();
        assert!(matches!(err, CxlError::Driver(_)), "{err}");
    }

    #[test]
    fn ids_are_unique_across_clones() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let device = CxlDevice::open(file.path()).unwrap();
        let clone = device.clone();
        let a = device.allocate_id().unwrap();
        let b = clone.allocate_id().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn id_space_exhaustion_is_an_error_not_a_wrap() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let device = CxlDevice::open(file.path()).unwrap();
        device.next_id.store(u32::MAX - 1, Ordering::Relaxed);

        assert_eq!(device.allocate_id().unwrap(), u32::MAX - 1);
        assert!(matches!(device.allocate_id(), Err(CxlError::Driver(_))));
        assert!(matches!(device.allocate_id(), Err(CxlError::Driver(_))));
        assert!(matches!(device.send(0, 0, 0), Err(CxlError::Driver(_))));
    }
}
