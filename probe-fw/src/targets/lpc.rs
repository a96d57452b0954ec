//! NXP LPC11xx and LPC43xx support.
//!
//! Both families flash through the In-Application Programming routines
//! in their boot ROM. The probe writes a command block into target RAM,
//! points r0/r1 at it, parks the return address on a planted `BKPT` and
//! runs the ROM routine to completion. The LPC43xx additionally selects
//! a flash bank in every call and publishes its IAP entry point through
//! a pointer in ROM.

use probe_fw_target::{MemoryRegion, NvmProperties, NvmRegion, RamRegion};
use std::time::Duration;
use tracing::debug;

use super::{MonitorCommand, Target, TargetInfo};
use crate::architecture::arm::core::{regsel, BreakwatchKind, CortexM, BKPT_INSTRUCTION};
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::memory::RomTable;
use crate::architecture::arm::ArmError;
use crate::error::Error;
use crate::flashing::{FlashAccess, FlashBank, FlashDriver, FlashError};
use crate::gdb::GdbOutput;

/// IAP command codes.
const IAP_CMD_PREPARE: u32 = 50;
const IAP_CMD_PROGRAM: u32 = 51;
const IAP_CMD_ERASE: u32 = 52;

/// IAP status: command performed successfully.
const IAP_STATUS_CMD_SUCCESS: u32 = 0;

/// LPC11xx identification and ROM entry.
const LPC11XX_DEVICE_ID: u32 = 0x4004_83F4;
const LPC11XX_IAP_ENTRY: u32 = 0x1FFF_1FF1;

/// LPC43xx part id register and the ROM word holding the IAP entry.
const LPC43XX_CHIPID: u32 = 0x4004_3200;
const LPC43XX_IAP_ENTRY_POINTER: u32 = 0x1040_0100;

/// RAM layout during an IAP call: command block, result block, the
/// planted return breakpoint and the data staging buffer.
const IAP_CMD_OFFSET: u32 = 0x00;
const IAP_RESULT_OFFSET: u32 = 0x20;
const IAP_RETURN_OFFSET: u32 = 0x40;
const IAP_BUFFER_OFFSET: u32 = 0x100;

/// The CPU clock in kHz handed to timing sensitive IAP commands.
const IAP_CCLK_KHZ: u32 = 12_000;

#[derive(Debug, Clone, Copy)]
struct IapSetup {
    entry: u32,
    ram_base: u32,
    ram_top: u32,
    /// Bank argument for the LPC43xx flavor of the call table.
    bank: Option<u32>,
    /// Sector number of the first block of the region.
    base_sector: u32,
}

/// Issue one IAP call and return its status word.
fn iap_call(
    access: &mut FlashAccess<'_>,
    setup: &IapSetup,
    command: [u32; 5],
) -> Result<u32, FlashError> {
    let cmd_address = setup.ram_base + IAP_CMD_OFFSET;
    let result_address = setup.ram_base + IAP_RESULT_OFFSET;
    let return_address = setup.ram_base + IAP_RETURN_OFFSET;

    access.write_32(cmd_address, &command)?;
    access
        .core
        .ap_mut()
        .write_word_16(access.dp, return_address, BKPT_INSTRUCTION)?;

    let saved: Vec<u32> = (0..=18u16)
        .map(|sel| access.core.read_core_reg(access.dp, sel))
        .collect::<Result<_, _>>()?;

    let hw_breakpoint =
        match access
            .core
            .set_breakwatch(access.dp, BreakwatchKind::Breakpoint, return_address, 2)
        {
            Ok(()) => true,
            Err(ArmError::UnsupportedBreakpointAddress(_)) => false,
            Err(error) => return Err(error.into()),
        };

    access.core.write_core_reg(access.dp, 0, cmd_address)?;
    access.core.write_core_reg(access.dp, 1, result_address)?;
    access
        .core
        .write_core_reg(access.dp, regsel::SP, setup.ram_top & !7)?;
    access
        .core
        .write_core_reg(access.dp, regsel::LR, return_address | 1)?;
    access.core.write_core_reg(access.dp, regsel::PC, setup.entry)?;
    access.core.write_core_reg(access.dp, regsel::XPSR, 1 << 24)?;

    access.core.resume(access.dp)?;
    let waited = access
        .core
        .wait_for_halt(access.dp, Duration::from_millis(2000));
    if waited.is_err() {
        access.core.halt(access.dp, Duration::from_millis(100))?;
    }
    access.core.poll_halt(access.dp)?;

    if hw_breakpoint {
        access
            .core
            .clear_breakwatch(access.dp, BreakwatchKind::Breakpoint, return_address)?;
    }

    let status = access.read_word_32(result_address)?;

    for (sel, value) in saved.iter().enumerate() {
        access.core.write_core_reg(access.dp, sel as u16, *value)?;
    }

    waited.map_err(FlashError::from)?;
    debug!("IAP command {} -> status {}", command[0], status);
    Ok(status)
}

/// Map an IAP failure status onto the framework's error kinds.
fn iap_failure(status: u32, failure: FlashError) -> FlashError {
    // 2 = SRC_ADDR_ERROR .. 9 = SECTOR_NOT_PREPARED, 10 = COMPARE_ERROR,
    // 11 = BUSY; anything protection flavored maps to Protected.
    match status {
        4 | 9 => FlashError::Protected,
        _ => failure,
    }
}

struct LpcIap {
    setup: IapSetup,
}

impl LpcIap {
    fn sector_of(&self, props: &NvmProperties, address: u32) -> u32 {
        self.setup.base_sector + (address - props.address_range.start) / props.block_size
    }

    fn prepare(
        &self,
        access: &mut FlashAccess<'_>,
        sector: u32,
    ) -> Result<(), FlashError> {
        let bank = self.setup.bank.unwrap_or(0);
        let status = iap_call(
            access,
            &self.setup,
            [IAP_CMD_PREPARE, sector, sector, bank, 0],
        )?;
        if status != IAP_STATUS_CMD_SUCCESS {
            return Err(iap_failure(status, FlashError::Protected));
        }
        Ok(())
    }
}

impl FlashDriver for LpcIap {
    fn erase_block(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
    ) -> Result<(), FlashError> {
        let sector = self.sector_of(props, address);
        self.prepare(access, sector)?;

        let mut command = [IAP_CMD_ERASE, sector, sector, IAP_CCLK_KHZ, 0];
        if let Some(bank) = self.setup.bank {
            command[4] = bank;
        }
        let status = iap_call(access, &self.setup, command)?;
        if status != IAP_STATUS_CMD_SUCCESS {
            return Err(iap_failure(status, FlashError::EraseFailed { address }));
        }
        Ok(())
    }

    fn program(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let sector = self.sector_of(props, address);
        self.prepare(access, sector)?;

        let buffer = self.setup.ram_base + IAP_BUFFER_OFFSET;
        access.write_8(buffer, data)?;

        let status = iap_call(
            access,
            &self.setup,
            [
                IAP_CMD_PROGRAM,
                address,
                buffer,
                data.len() as u32,
                IAP_CCLK_KHZ,
            ],
        )?;
        if status != IAP_STATUS_CMD_SUCCESS {
            return Err(iap_failure(status, FlashError::ProgramFailed { address }));
        }
        Ok(())
    }
}

pub(crate) fn probe(
    core: &mut CortexM,
    dp: &mut dyn DpAccess,
    _rom: &RomTable,
) -> Result<Option<TargetInfo>, Error> {
    if let Some(info) = probe_lpc11xx(core, dp)? {
        return Ok(Some(info));
    }
    if dp.fault() {
        dp.error_clear().map_err(ArmError::from)?;
    }
    probe_lpc43xx(core, dp)
}

fn probe_lpc11xx(
    core: &mut CortexM,
    dp: &mut dyn DpAccess,
) -> Result<Option<TargetInfo>, Error> {
    let device_id = core.ap_mut().read_word_32(dp, LPC11XX_DEVICE_ID)?;
    if dp.fault() {
        return Ok(None);
    }

    let name = match device_id {
        0x0A07_102B | 0x1A07_102B => "LPC1110",
        0x0A16_D02B | 0x1A16_D02B | 0x041E_502B | 0x2516_D02B | 0x0416_502B => "LPC1111",
        0x0A23_902B | 0x1A24_902B | 0x2524_D02B => "LPC1112",
        0x0434_502B | 0x2532_902B => "LPC1113",
        0x0A40_902B | 0x1A40_902B | 0x0444_502B | 0x2540_902B | 0x2540_102B => "LPC1114",
        _ => return Ok(None),
    };
    debug!("LPC device id {device_id:#010x}: {name}");

    let flash_range = 0x0000_0000..0x8000;
    let ram_base = 0x1000_0000;
    let ram_size = 0x2000;

    Ok(Some(TargetInfo {
        name: format!("NXP {name}"),
        part_id: device_id,
        memory_map: vec![
            MemoryRegion::Nvm(NvmRegion {
                range: flash_range.clone(),
                block_size: 0x1000,
                is_boot_memory: true,
            }),
            MemoryRegion::Ram(RamRegion {
                range: ram_base..ram_base + ram_size,
                is_boot_memory: false,
            }),
        ],
        flash: vec![FlashBank::new(
            NvmProperties {
                address_range: flash_range,
                block_size: 0x1000,
                write_alignment: 4,
                erased_byte_value: 0xFF,
                write_buffer_size: Some(0x100),
                erase_block_timeout: 400,
                program_timeout: 200,
            },
            Box::new(LpcIap {
                setup: IapSetup {
                    entry: LPC11XX_IAP_ENTRY,
                    ram_base,
                    // The top 32 bytes belong to the IAP routines.
                    ram_top: ram_base + ram_size - 32,
                    bank: None,
                    base_sector: 0,
                },
            }),
        )],
        commands: vec![MonitorCommand {
            name: "erase_mass",
            help: "Erase the entire flash",
            handler: cmd_erase_mass,
        }],
    }))
}

fn probe_lpc43xx(
    core: &mut CortexM,
    dp: &mut dyn DpAccess,
) -> Result<Option<TargetInfo>, Error> {
    let chipid = core.ap_mut().read_word_32(dp, LPC43XX_CHIPID)?;
    if dp.fault() {
        return Ok(None);
    }

    let name = match chipid {
        0x4906_002B | 0x7906_002B => "LPC4337",
        0x4900_002B | 0x7900_002B => "LPC4370",
        _ => return Ok(None),
    };
    debug!("LPC chip id {chipid:#010x}: {name}");

    // The ROM publishes the IAP entry through a pointer.
    let entry = core.ap_mut().read_word_32(dp, LPC43XX_IAP_ENTRY_POINTER)?;
    let ram_base = 0x1000_0000;
    let ram_size = 0x2_0000;

    let mut memory_map = vec![MemoryRegion::Ram(RamRegion {
        range: ram_base..ram_base + ram_size,
        is_boot_memory: false,
    })];
    let mut flash = Vec::new();

    // Two flash banks; each starts with eight 8 KiB sectors followed by
    // 64 KiB sectors.
    for (bank, base) in [(0u32, 0x1A00_0000u32), (1, 0x1B00_0000)] {
        let groups: &[(u32, u32, u32)] = &[
            // (offset, sector size, first sector)
            (0x0000_0000, 0x2000, 0),
            (0x0001_0000, 0x1_0000, 8),
        ];
        let bank_size = 0x8_0000;

        for &(offset, sector_size, base_sector) in groups {
            let start = base + offset;
            let end = match groups.iter().find(|g| g.0 > offset) {
                Some(next) => base + next.0,
                None => base + bank_size,
            };

            memory_map.push(MemoryRegion::Nvm(NvmRegion {
                range: start..end,
                block_size: sector_size,
                is_boot_memory: bank == 0 && offset == 0,
            }));
            flash.push(FlashBank::new(
                NvmProperties {
                    address_range: start..end,
                    block_size: sector_size,
                    write_alignment: 4,
                    erased_byte_value: 0xFF,
                    write_buffer_size: Some(0x200),
                    erase_block_timeout: 800,
                    program_timeout: 400,
                },
                Box::new(LpcIap {
                    setup: IapSetup {
                        entry,
                        ram_base,
                        ram_top: ram_base + 0x8000,
                        bank: Some(bank),
                        base_sector,
                    },
                }),
            ));
        }
    }

    Ok(Some(TargetInfo {
        name: format!("NXP {name}"),
        part_id: chipid,
        memory_map,
        flash,
        commands: vec![MonitorCommand {
            name: "erase_mass",
            help: "Erase the entire flash",
            handler: cmd_erase_mass,
        }],
    }))
}

/// IAP has no chip erase; erase every bank block by block.
fn cmd_erase_mass(
    target: &mut Target,
    dp: &mut dyn DpAccess,
    out: &mut dyn GdbOutput,
    _args: &[&str],
) -> Result<(), Error> {
    let Target { core, flash, .. } = target;
    let mut access = FlashAccess { core, dp };

    for bank in flash.iter_mut() {
        let (start, end) = (
            bank.props.address_range.start,
            bank.props.address_range.end,
        );
        bank.erase(&mut access, start, end - start)?;
    }

    out.gdb_out("Mass erase complete\n");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::arm::ap::mock::{MockDap, ResumeBehavior};
    use crate::architecture::arm::ap::{GenericAp, MemoryAp, IDR};
    use crate::architecture::arm::memory::romtable::{PeripheralId, RomTable};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn attached(dap: &mut MockDap) -> CortexM {
        let idr = IDR::from(dap.idr);
        let ap = MemoryAp::new(dap, GenericAp { apsel: 0, idr }).unwrap();
        let mut core = CortexM::new(ap, Arc::new(AtomicBool::new(false)));
        core.attach(dap).unwrap();
        core
    }

    fn empty_rom() -> RomTable {
        RomTable {
            peripheral_id: PeripheralId::from_raw(0),
            components: Vec::new(),
        }
    }

    #[test]
    fn lpc1114_is_recognized() {
        let mut dap = MockDap::new(0x1000_0000, 0x2000);
        dap.set_reg(LPC11XX_DEVICE_ID, 0x0A40_902B);
        let mut core = attached(&mut dap);

        let info = probe(&mut core, &mut dap, &empty_rom()).unwrap().unwrap();
        assert_eq!(info.name, "NXP LPC1114");
        assert_eq!(info.flash[0].props.block_size, 0x1000);
        assert_eq!(info.flash[0].props.write_buffer_size, Some(0x100));
    }

    #[test]
    fn iap_call_builds_command_block_and_runs_the_rom() {
        let mut dap = MockDap::new(0x1000_0000, 0x2000);
        dap.set_reg(LPC11XX_DEVICE_ID, 0x0A40_902B);
        let mut core = attached(&mut dap);
        let info = probe(&mut core, &mut dap, &empty_rom()).unwrap().unwrap();
        let mut bank = info.flash.into_iter().next().unwrap();

        // Both IAP calls (prepare, erase) return CMD_SUCCESS: the result
        // block already holds zero in RAM.
        dap.resume_behavior = ResumeBehavior::HaltWith {
            dfsr: 1 << 1,
            set_regs: vec![],
        };

        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };
        bank.erase(&mut access, 0x1000, 0x1000).unwrap();

        // The command block of the last call: erase sector 1..1.
        let words: Vec<u32> = dap.ram[0..20]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![IAP_CMD_ERASE, 1, 1, IAP_CCLK_KHZ, 0]);

        // The ROM entry was the jump target with r0/r1 pointing at the
        // blocks.
        assert_eq!(dap.regbank[15], LPC11XX_IAP_ENTRY);
        assert_eq!(dap.regbank[0], 0x1000_0000);
        assert_eq!(dap.regbank[1], 0x1000_0020);
        // The return address parks on the planted breakpoint.
        assert_eq!(dap.regbank[14], 0x1000_0040 | 1);
        assert_eq!(
            u16::from_le_bytes(dap.ram[0x40..0x42].try_into().unwrap()),
            BKPT_INSTRUCTION
        );
    }

    #[test]
    fn lpc43xx_reads_its_iap_entry_from_rom() {
        let mut dap = MockDap::new(0x1000_0000, 0x2000);
        dap.set_reg(LPC43XX_CHIPID, 0x4906_002B);
        dap.set_reg(LPC43XX_IAP_ENTRY_POINTER, 0x1040_1235);
        let mut core = attached(&mut dap);

        let info = probe(&mut core, &mut dap, &empty_rom()).unwrap().unwrap();
        assert_eq!(info.name, "NXP LPC4337");
        // Two banks, each split into the 8 KiB and 64 KiB groups.
        assert_eq!(info.flash.len(), 4);
        assert_eq!(info.flash[0].props.address_range.start, 0x1A00_0000);
        assert_eq!(info.flash[2].props.address_range.start, 0x1B00_0000);
    }
}
