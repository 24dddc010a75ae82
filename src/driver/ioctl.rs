use crate::error::{CxlError, CxlResult};

// ===============================================================================================
// Request Numbers
// ===============================================================================================

/// Queue a command on the FPGA (`struct cxl_mem_command`).
pub const CXL_MEM_SEND_COMMAND: u32 = 0x1001;
/// Query the status of a queued command (`struct cxl_mem_query_cmd`).
pub const CXL_MEM_QUERY_CMD: u32 = 0x1002;

// ===============================================================================================
// Command Status
// ===============================================================================================

pub const CXL_CMD_STATUS_ACTIVE: u32 = 0;
pub const CXL_CMD_STATUS_COMPLETED: u32 = 1;
pub const CXL_CMD_STATUS_ERROR: u32 = 2;
pub const CXL_CMD_STATUS_INVALID: u32 = 3;

/// Status of a device command as reported across the driver boundary.
///
/// `Active` is the only non-terminal state. The discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandStatus {
    Active = CXL_CMD_STATUS_ACTIVE,
    Completed = CXL_CMD_STATUS_COMPLETED,
    Error = CXL_CMD_STATUS_ERROR,
    Invalid = CXL_CMD_STATUS_INVALID,
}

impl CommandStatus {
    /// Decodes a raw status word.
    ///
    /// # Errors
    /// Returns `CxlError::Driver` for values outside the protocol.
    pub fn from_wire(raw: u32) -> CxlResult<Self> {
        match raw {
            CXL_CMD_STATUS_ACTIVE => Ok(Self::Active),
            CXL_CMD_STATUS_COMPLETED => Ok(Self::Completed),
            CXL_CMD_STATUS_ERROR => Ok(Self::Error),
            CXL_CMD_STATUS_INVALID => Ok(Self::Invalid),
            other => Err(CxlError::Driver(format!("unknown command status {other}"))),
        }
    }

    #[must_use]
    pub const fn to_wire(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

// ===============================================================================================
// FPGA Opcodes
// ===============================================================================================

pub const CMD_NOP: u32 = 0x00;
pub const CMD_MEM_COPY: u32 = 0x01;
pub const CMD_MEM_FILL: u32 = 0x02;
pub const CMD_ACCELERATE: u32 = 0x03;

/// Typed view of the `(opcode, address, data)` triple understood by the FPGA.
///
/// Offsets are region offsets. Copy and scale pack a 32-bit length or count in the
/// upper half of `data`; fill packs the length above the fill byte.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandPayload {
    Nop,
    Copy { src: u32, dst: u64, len: u32 },
    Fill { offset: u64, len: u64, byte: u8 },
    Scale { offset: u64, count: u32, factor: f32 },
}

impl CommandPayload {
    /// Packs the payload into `(opcode, address, data)`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if a fill length does not fit in 56 bits.
    pub fn encode(self) -> CxlResult<(u32, u64, u64)> {
        match self {
            Self::Nop => Ok((CMD_NOP, 0, 0)),
            Self::Copy { src, dst, len } => {
                Ok((CMD_MEM_COPY, dst, (u64::from(len) << 32) | u64::from(src)))
            }
            Self::Fill { offset, len, byte } => {
                if len >> 56 != 0 {
                    return Err(CxlError::InvalidArgument(format!(
                        "fill length {len:#x} does not fit the command word"
                    )));
                }
                Ok((CMD_MEM_FILL, offset, (len << 8) | u64::from(byte)))
            }
            Self::Scale {
                offset,
                count,
                factor,
            } => Ok((
                CMD_ACCELERATE,
                offset,
                (u64::from(count) << 32) | u64::from(factor.to_bits()),
            )),
        }
    }

    /// Unpacks a raw command. Returns `None` for opcodes the FPGA does not implement.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn decode(opcode: u32, address: u64, data: u64) -> Option<Self> {
        match opcode {
            CMD_NOP => Some(Self::Nop),
            CMD_MEM_COPY => Some(Self::Copy {
                src: data as u32,
                dst: address,
                len: (data >> 32) as u32,
            }),
            CMD_MEM_FILL => Some(Self::Fill {
                offset: address,
                len: data >> 8,
                byte: data as u8,
            }),
            CMD_ACCELERATE => Some(Self::Scale {
                offset: address,
                count: (data >> 32) as u32,
                factor: f32::from_bits(data as u32),
            }),
            _ => None,
        }
    }
}

// ===============================================================================================
// IOCTL Argument Structures
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MemCommandArgs {
    pub id: u32,
    pub opcode: u32,
    pub address: u64,
    pub data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct QueryCommandArgs {
    pub id: u32,
    pub status: u32,
    pub result: u64,
}

const _: () = assert!(std::mem::size_of::<MemCommandArgs>() == 24);
const _: () = assert!(std::mem::size_of::<QueryCommandArgs>() == 16);
