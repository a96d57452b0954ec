//! Supported device families.
//!
//! Each family module owns three things: the probe that recognizes its
//! silicon from identification registers, the flash driver speaking its
//! register-level procedure, and the `monitor` commands it offers the
//! host. Probes run in the order of [`PROBES`] against every Cortex-M
//! found during discovery; the first match wins.

pub mod lpc;
pub mod nrf51;
pub mod samd;
pub mod stm32f1;
pub mod stm32f4;
pub mod stm32l0;

use probe_fw_target::MemoryRegion;
use tracing::debug;

use crate::architecture::arm::core::{BreakwatchKind, CortexM};
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::memory::RomTable;
use crate::error::Error;
use crate::flashing::{FlashAccess, FlashBank, FlashError};
use crate::gdb::GdbOutput;

/// Everything a family probe reports about recognized silicon.
pub struct TargetInfo {
    /// Human readable device name, owned by the target.
    pub name: String,
    /// The family identification code the probe matched on.
    pub part_id: u32,
    /// RAM and flash regions for the memory map.
    pub memory_map: Vec<MemoryRegion>,
    /// Flash banks with their drivers.
    pub flash: Vec<FlashBank>,
    /// The family's `monitor` commands.
    pub commands: Vec<MonitorCommand>,
}

/// A `monitor` command registered by a family.
#[derive(Clone, Copy)]
pub struct MonitorCommand {
    /// The command word after `monitor`.
    pub name: &'static str,
    /// One-line description for `monitor help`.
    pub help: &'static str,
    /// The handler; receives the remaining argument words.
    pub handler:
        fn(&mut Target, &mut dyn DpAccess, &mut dyn GdbOutput, &[&str]) -> Result<(), Error>,
}

/// A family probe: inspect the device behind the core and describe it.
///
/// Returns `Ok(None)` when the silicon is not this family's.
pub type TargetProbe =
    fn(&mut CortexM, &mut dyn DpAccess, &RomTable) -> Result<Option<TargetInfo>, Error>;

/// The ordered list of family probes.
pub const PROBES: &[(&str, TargetProbe)] = &[
    ("stm32f1", stm32f1::probe),
    ("stm32f4", stm32f4::probe),
    ("stm32l0", stm32l0::probe),
    ("samd", samd::probe),
    ("lpc", lpc::probe),
    ("nrf51", nrf51::probe),
];

/// Run every family probe against a freshly attached core.
pub fn probe_all(
    mut core: CortexM,
    dp: &mut dyn DpAccess,
    rom: &RomTable,
) -> Result<Option<Target>, Error> {
    for (name, probe) in PROBES {
        debug!("Trying target probe '{name}'");
        if let Some(info) = probe(&mut core, dp, rom)? {
            debug!("Probe '{name}' matched: {}", info.name);
            return Ok(Some(Target::assemble(core, info)));
        }
        // A probe poking at addresses the device does not decode may
        // have latched a fault; acknowledge it before the next one.
        if dp.fault() {
            dp.error_clear().map_err(crate::architecture::arm::ArmError::from)?;
        }
    }
    Ok(None)
}

/// One attached, identified device.
pub struct Target {
    /// Human readable device name.
    pub name: String,
    /// The family identification code.
    pub part_id: u32,
    /// RAM and flash regions, in address order.
    pub memory_map: Vec<MemoryRegion>,
    /// Flash banks.
    pub flash: Vec<FlashBank>,
    /// The run control for the device's core.
    pub core: CortexM,
    commands: Vec<MonitorCommand>,
}

impl Target {
    fn assemble(core: CortexM, info: TargetInfo) -> Self {
        Target {
            name: info.name,
            part_id: info.part_id,
            memory_map: info.memory_map,
            flash: info.flash,
            core,
            commands: info.commands,
        }
    }

    /// The registered `monitor` commands.
    pub fn commands(&self) -> &[MonitorCommand] {
        &self.commands
    }

    /// Dispatch a `monitor` command line.
    pub fn monitor(
        &mut self,
        dp: &mut dyn DpAccess,
        out: &mut dyn GdbOutput,
        line: &str,
    ) -> Result<(), Error> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            for command in &self.commands {
                out.gdb_out(&format!("{} -- {}\n", command.name, command.help));
            }
            return Ok(());
        };
        let args: Vec<&str> = words.collect();

        let command = self
            .commands
            .iter()
            .find(|c| c.name == name)
            .copied()
            .ok_or_else(|| Error::UnknownMonitorCommand(name.to_string()))?;

        (command.handler)(self, dp, out, &args)
    }

    /// Read target memory.
    pub fn read_memory(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), Error> {
        self.core.ap_mut().read_8(dp, address, data)?;
        Ok(())
    }

    /// Write target memory (RAM and peripherals; flash goes through the
    /// flash operations).
    pub fn write_memory(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        self.core.ap_mut().write_8(dp, address, data)?;
        Ok(())
    }

    /// Erase `[address, address + length)` of flash, bank by bank.
    pub fn flash_erase(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        length: u32,
    ) -> Result<(), FlashError> {
        let Target { core, flash, .. } = self;
        let mut access = FlashAccess { core, dp };

        let mut cursor = address;
        let end = address + length;
        while cursor < end {
            let bank = flash
                .iter_mut()
                .find(|bank| bank.contains(cursor))
                .ok_or(FlashError::OutOfRegion {
                    address: cursor,
                    length: end - cursor,
                })?;
            let span = (end - cursor).min(bank.props.address_range.end - cursor);

            bank.erase(&mut access, cursor, span)?;
            cursor += span;
        }
        Ok(())
    }

    /// Buffer a flash write; committed by bank chunking and
    /// [`Target::flash_done`].
    pub fn flash_write(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let Target { core, flash, .. } = self;
        let mut access = FlashAccess { core, dp };

        let mut cursor = address;
        let mut remaining = data;
        while !remaining.is_empty() {
            let bank = flash
                .iter_mut()
                .find(|bank| bank.contains(cursor))
                .ok_or(FlashError::OutOfRegion {
                    address: cursor,
                    length: remaining.len() as u32,
                })?;
            let span = (remaining.len() as u32).min(bank.props.address_range.end - cursor) as usize;

            bank.write(&mut access, cursor, &remaining[..span])?;
            cursor += span as u32;
            remaining = &remaining[span..];
        }
        Ok(())
    }

    /// Flush pending flash writes and lock every touched bank.
    pub fn flash_done(&mut self, dp: &mut dyn DpAccess) -> Result<(), FlashError> {
        let Target { core, flash, .. } = self;
        let mut access = FlashAccess { core, dp };
        for bank in flash.iter_mut() {
            bank.done(&mut access)?;
        }
        Ok(())
    }

    /// Install a breakpoint or watchpoint (the GDB `Z` packet).
    pub fn set_breakwatch(
        &mut self,
        dp: &mut dyn DpAccess,
        kind: BreakwatchKind,
        address: u32,
        size: u8,
    ) -> Result<(), Error> {
        self.core.set_breakwatch(dp, kind, address, size)?;
        Ok(())
    }

    /// Remove a breakpoint or watchpoint (the GDB `z` packet).
    pub fn clear_breakwatch(
        &mut self,
        dp: &mut dyn DpAccess,
        kind: BreakwatchKind,
        address: u32,
    ) -> Result<(), Error> {
        self.core.clear_breakwatch(dp, kind, address)?;
        Ok(())
    }
}
