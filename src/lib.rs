//! Host access to a CXL-attached memory and accelerator device.
//!
//! A region of device memory is mapped into the process ([`MappedRegion`]), carved into
//! blocks ([`MemoryManager`]) and used as the staging area for commands executed by the
//! FPGA ([`CommandChannel`]). [`Harness`] measures what the region delivers.
//!
//! [`driver`] holds everything that crosses the process boundary: the ioctl wire format,
//! the character device, region backing, and an in-process simulator for hosts without
//! the hardware.

pub mod driver;
pub mod error;
pub mod runtime;
pub mod utils;

pub use error::{CxlError, CxlResult};
pub use runtime::{
    CommandChannel, Context, CxlConfig, Harness, MappedRegion, MemoryManager, RegionPtr,
};
