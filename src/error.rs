use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CxlError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CXL device not found at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Failed to map {size} bytes from {origin}: {source}")]
    MapFailed {
        origin: String,
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("{op}: range [{offset:#x}, +{len:#x}) exceeds region size {size:#x}")]
    OutOfBounds {
        op: &'static str,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("{op}: region is not mapped")]
    NotInitialized { op: &'static str },

    #[error("Out of region memory: requested {requested:#x} bytes (align {align}), largest free block {largest_free:#x}")]
    OutOfMemory {
        requested: usize,
        align: usize,
        largest_free: usize,
    },

    #[error("Offset {offset:#x} is not an allocated block")]
    NotAllocated { offset: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Command channel not ready: {0}")]
    ChannelNotReady(String),

    #[error("Unknown command id {id}")]
    UnknownCommand { id: u64 },

    #[error("Command {id} still active after {waited:?}")]
    Timeout { id: u64, waited: Duration },

    #[error("No device registered as dev{id}")]
    UnknownDevice { id: u32 },

    #[error("CXL Driver Error: {0}")]
    Driver(String),
}

// A convenient alias
pub type CxlResult<T> = Result<T, CxlError>;
