//! Firmware core for an ADIv5 debug probe.
//!
//! Everything between the probe's GPIO pins and the GDB remote-serial
//! dispatcher lives here: the bit-banged SWD and JTAG wire drivers, the
//! Debug Port and Access Port protocol engines, CoreSight discovery, the
//! Cortex-M run control and the flash programming framework with its
//! per-family drivers.
//!
//! The USB transport, the RSP packet parser and the platform pin/clock
//! setup are external: the parser decodes packets and calls into
//! [`Session`], the platform implements the pin traits in [`probe`].
//!
//! A typical connect path:
//!
//! ```no_run
//! # fn pins() -> probe_fw::probe::fake::ScriptedWire { unreachable!() }
//! use probe_fw::Session;
//!
//! let wire = pins();
//! let mut session = Session::swd_scan(wire)?;
//! let xml = session.memory_map_xml()?;
//! # Ok::<(), probe_fw::Error>(())
//! ```

pub mod architecture;
mod error;
pub mod flashing;
pub mod gdb;
pub mod probe;
mod session;
pub mod targets;

pub use crate::architecture::arm::core::{
    Breakwatch, BreakwatchKind, CoreStatus, CortexM, HaltReason,
};
pub use crate::architecture::arm::{ArmError, DapError};
pub use crate::error::Error;
pub use crate::flashing::FlashError;
pub use crate::session::Session;
pub use crate::targets::Target;
