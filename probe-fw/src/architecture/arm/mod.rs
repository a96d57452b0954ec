//! ARM Debug Interface (ADIv5) support.
//!
//! See <https://developer.arm.com/documentation/ihi0031/f/?lang=en> for the
//! ADIv5 specification.

pub mod ap;
pub mod core;
pub mod dp;
pub mod memory;

use crate::probe::ParityError;

/// The two kinds of ports a DAP transaction can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    /// The Debug Port itself.
    DebugPort,
    /// An Access Port behind the DP.
    AccessPort,
}

/// A register of the Debug Port or an Access Port.
pub trait Register: From<u32> + Into<u32> + Sized {
    /// The register's address within its port (byte addressed, so always a
    /// multiple of 4).
    const ADDRESS: u8;
    /// The register's name.
    const NAME: &'static str;
}

/// A memory mapped register of the target.
pub trait MemoryMappedRegister: From<u32> + Into<u32> + Sized {
    /// The physical address of the register in the target's memory map.
    const ADDRESS: u32;
    /// The register's name.
    const NAME: &'static str;
}

/// Low-level DAP protocol errors.
///
/// The fatal variants are the crate's fast-unwind token: nothing between
/// the wire and the session catches them, they surface to the host as a
/// failed connection.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DapError {
    /// The target did not acknowledge a request at all, or answered with
    /// an ACK pattern the protocol does not define.
    #[error("Target did not acknowledge the request")]
    NoAcknowledge,
    /// The target kept answering WAIT past the retry limit.
    #[error("Target did not complete the transfer within the retry limit")]
    WaitRetriesExceeded,
    /// The target answered FAULT; the sticky error must be cleared before
    /// Access Port traffic resumes.
    #[error("Target returned a FAULT response")]
    FaultResponse,
    /// Read data failed its parity check.
    #[error("Incorrect parity on read data")]
    IncorrectParity,
}

impl From<ParityError> for DapError {
    fn from(_: ParityError) -> Self {
        DapError::IncorrectParity
    }
}

/// ARM specific errors.
#[derive(thiserror::Error, Debug)]
pub enum ArmError {
    /// A DAP protocol error occurred.
    #[error("A DAP protocol error occurred")]
    Dap(#[from] DapError),
    /// The Debug Port has a sticky fault latched which has not been
    /// acknowledged yet.
    #[error("The debug port has an unacknowledged sticky fault latched")]
    StickyFault,
    /// An operation did not complete within its time budget.
    #[error("An operation timed out")]
    Timeout,
    /// A memory access was attempted with an incorrectly aligned address.
    #[error("Memory access at {address:#010x} is not aligned to {alignment} bytes")]
    MemoryNotAligned {
        /// The requested address.
        address: u32,
        /// The required alignment in bytes.
        alignment: u32,
    },
    /// The requested operation requires the core to be halted.
    #[error("The core is not halted")]
    CoreNotHalted,
    /// The AP at this index is not a MEM-AP.
    #[error("AP {0} is not a memory access port")]
    NotAMemoryAp(u8),
    /// A breakpoint at this address cannot be represented by the FPB.
    #[error("Hardware breakpoints are not supported at address {0:#010x}")]
    UnsupportedBreakpointAddress(u32),
    /// All FPB comparators are in use.
    #[error("All hardware breakpoint comparators are in use")]
    NoBreakpointSlots,
    /// All DWT comparators are in use.
    #[error("All watchpoint comparators are in use")]
    NoWatchpointSlots,
    /// Watchpoints cover accesses of 1, 2 or 4 bytes only.
    #[error("Unsupported watchpoint size {0}")]
    UnsupportedWatchpointSize(u8),
    /// No breakpoint or watchpoint matching the request is set.
    #[error("No breakpoint or watchpoint is set at {0:#010x}")]
    BreakwatchNotFound(u32),
    /// The register selector is not part of the core's register file.
    #[error("Register {0} is not part of the register file")]
    UnknownRegister(u16),
    /// An error during CoreSight discovery.
    #[error("Error during CoreSight discovery")]
    RomTable(#[source] memory::romtable::RomTableError),
}
