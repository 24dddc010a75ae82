//! The host-side runtime built on top of the driver boundary.

pub mod command;
pub mod config;
pub mod context;
pub mod harness;
pub mod memory;
pub mod region;

pub use command::{CommandChannel, CommandId, CommandReport, WaitPolicy};
pub use config::CxlConfig;
pub use context::Context;
pub use harness::{
    AccessMode, Bandwidth, ComputeOp, ComputeReport, Harness, HarnessConfig, Latency, Throughput,
};
pub use memory::{AllocFlags, Allocation, AllocatorStats, BlockAllocator, MemoryManager};
pub use region::{MappedRegion, RegionPtr};
