//! Target description data model for `probe-fw`.
//!
//! Plain value types describing what an attached device looks like: its
//! memory regions, its flash sector geometry and the programming properties
//! of each flash bank. The probe firmware core builds these during target
//! discovery; the GDB surface renders them into the memory-map XML.

#![warn(missing_docs)]

mod memory;
mod nvm_properties;

pub use memory::{MemoryRange, MemoryRegion, NvmRegion, RamRegion, SectorDescription, SectorInfo};
pub use nvm_properties::NvmProperties;
