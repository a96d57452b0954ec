use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Properties of a flash bank which are used when programming it.
///
/// The geometry half of a flash driver: where the bank lives, how small the
/// programming unit is and what an erased cell reads back as. The protocol
/// half (key sequences, status polling) lives with the family driver in the
/// firmware core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NvmProperties {
    /// The address range of the bank.
    pub address_range: Range<u32>,
    /// Smallest unit that can be erased at once.
    pub block_size: u32,
    /// Alignment required of programming operations, in bytes.
    pub write_alignment: u32,
    /// The value of a byte that was just erased.
    pub erased_byte_value: u8,
    /// Size of the coalescing buffer for drivers that commit writes in
    /// fixed chunks (half-pages, rows). `None` means writes are committed
    /// as they arrive.
    pub write_buffer_size: Option<u32>,
    /// The approximate time it takes to erase a block, in milliseconds.
    pub erase_block_timeout: u32,
    /// The approximate time it takes to program a write unit, in
    /// milliseconds.
    pub program_timeout: u32,
}

impl Default for NvmProperties {
    #[allow(clippy::reversed_empty_ranges)]
    fn default() -> Self {
        NvmProperties {
            address_range: 0..0,
            block_size: 0,
            write_alignment: 4,
            erased_byte_value: 0xFF,
            write_buffer_size: None,
            erase_block_timeout: 100,
            program_timeout: 100,
        }
    }
}
