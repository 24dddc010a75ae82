//! The device boundary: wire formats, the character device, region backing and the
//! in-process FPGA simulator.

pub mod device;
pub mod ioctl;
pub mod registry;
pub mod sim;
pub mod source;

use crate::error::CxlResult;
use ioctl::CommandStatus;

/// What the device reports for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceReport {
    pub status: CommandStatus,
    pub result: u64,
}

/// Capability that executes FPGA commands.
///
/// `send` queues a command and returns the device's id for it. `query` never blocks.
/// A device may forget a command once it has reported a terminal status; querying an
/// id it does not know reports `Invalid`.
pub trait DeviceChannel: Send + Sync {
    fn send(&self, opcode: u32, address: u64, data: u64) -> CxlResult<u64>;

    fn query(&self, id: u64) -> CxlResult<DeviceReport>;
}

pub use device::{CxlDevice, DEFAULT_DEVICE_PATH};
pub use registry::{DeviceId, DeviceRegistry};
pub use sim::{SimConfig, SimulatedDevice};
pub use source::{AnonymousSource, DeviceFileSource, RawSpan, RegionSource};
