//! STM32F4 support.
//!
//! Unlike the F1 the erase granule is a numbered sector of varying size:
//! four 16 KiB sectors, one 64 KiB sector and 128 KiB sectors for the
//! rest. Each size group becomes its own flash bank carrying the number
//! of its first sector, and FLASH_CR.SNB is computed from the offset
//! inside the group. PSIZE selects 32-bit parallelism to match the word
//! programming the framework delivers.

use bitfield::bitfield;
use probe_fw_target::{MemoryRegion, NvmProperties, NvmRegion, RamRegion};
use std::time::Duration;
use tracing::debug;

use super::{MonitorCommand, Target, TargetInfo};
use crate::architecture::arm::core::CortexM;
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::memory::RomTable;
use crate::error::Error;
use crate::flashing::{FlashAccess, FlashBank, FlashDriver, FlashError};
use crate::gdb::GdbOutput;

const DBGMCU_IDCODE: u32 = 0xE004_2000;

const FLASH_KEYR: u32 = 0x4002_3C04;
const FLASH_OPTKEYR: u32 = 0x4002_3C08;
const FLASH_SR: u32 = 0x4002_3C0C;
const FLASH_CR: u32 = 0x4002_3C10;
const FLASH_OPTCR: u32 = 0x4002_3C14;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;
const OPTKEY1: u32 = 0x0819_2A3B;
const OPTKEY2: u32 = 0x4C5D_6E7F;

bitfield! {
    /// FLASH_SR.
    #[derive(Copy, Clone)]
    pub struct FlashSr(u32);
    impl Debug;
    pub bsy, _: 16;
    pub pgserr, _: 7;
    pub pgperr, _: 6;
    pub pgaerr, _: 5;
    pub wrperr, _: 4;
    pub operr, _: 1;
    pub eop, _: 0;
}

impl FlashSr {
    /// All error bits.
    const ERROR_MASK: u32 = 1 << 7 | 1 << 6 | 1 << 5 | 1 << 4 | 1 << 1;
}

bitfield! {
    /// FLASH_CR.
    #[derive(Copy, Clone)]
    pub struct FlashCr(u32);
    impl Debug;
    pub lock, set_lock: 31;
    pub strt, set_strt: 16;
    pub u8, psize, set_psize: 9, 8;
    pub u8, snb, set_snb: 6, 3;
    pub mer, set_mer: 2;
    pub ser, set_ser: 1;
    pub pg, set_pg: 0;
}

/// 32-bit programming parallelism.
const PSIZE_X32: u8 = 0b10;

pub(crate) fn probe(
    core: &mut CortexM,
    dp: &mut dyn DpAccess,
    _rom: &RomTable,
) -> Result<Option<TargetInfo>, Error> {
    let idcode = core.ap_mut().read_word_32(dp, DBGMCU_IDCODE)? & 0xFFF;
    if dp.fault() {
        return Ok(None);
    }

    let (name, flash_size, ram_size) = match idcode {
        0x413 => ("STM32F405/F407", 0x10_0000, 0x2_0000),
        0x419 => ("STM32F42x/F43x", 0x10_0000, 0x3_0000),
        0x423 => ("STM32F401xB/C", 0x4_0000, 0x1_0000),
        0x431 => ("STM32F411", 0x8_0000, 0x2_0000),
        _ => return Ok(None),
    };
    debug!("DBGMCU_IDCODE {idcode:#05x}: {name}");

    let mut memory_map = vec![MemoryRegion::Ram(RamRegion {
        range: 0x2000_0000..0x2000_0000 + ram_size,
        is_boot_memory: false,
    })];
    // 64 KiB of core-coupled RAM, not accessible for booting or DMA.
    memory_map.push(MemoryRegion::Ram(RamRegion {
        range: 0x1000_0000..0x1001_0000,
        is_boot_memory: false,
    }));

    let mut flash = Vec::new();
    let groups: &[(u32, u32, u8)] = &[
        // (offset, sector size, first sector number)
        (0x0000_0000, 0x4000, 0),
        (0x0001_0000, 0x1_0000, 4),
        (0x0002_0000, 0x2_0000, 5),
    ];
    for &(offset, sector_size, base_sector) in groups {
        if offset >= flash_size {
            break;
        }
        let start = 0x0800_0000 + offset;
        let end = match groups.iter().find(|g| g.0 > offset) {
            Some(next) => 0x0800_0000 + next.0.min(flash_size),
            None => 0x0800_0000 + flash_size,
        };

        memory_map.push(MemoryRegion::Nvm(NvmRegion {
            range: start..end,
            block_size: sector_size,
            is_boot_memory: offset == 0,
        }));
        flash.push(FlashBank::new(
            NvmProperties {
                address_range: start..end,
                block_size: sector_size,
                write_alignment: 4,
                erased_byte_value: 0xFF,
                write_buffer_size: None,
                erase_block_timeout: 2000,
                program_timeout: 100,
            },
            Box::new(Stm32F4Flash { base_sector }),
        ));
    }

    Ok(Some(TargetInfo {
        name: name.to_string(),
        part_id: idcode,
        memory_map,
        flash,
        commands: vec![
            MonitorCommand {
                name: "erase_mass",
                help: "Erase the entire flash",
                handler: cmd_erase_mass,
            },
            MonitorCommand {
                name: "option",
                help: "Read or write the option control register: option [write <value>]",
                handler: cmd_option,
            },
        ],
    }))
}

struct Stm32F4Flash {
    /// Sector number of the first block in this bank.
    base_sector: u8,
}

fn unlock(access: &mut FlashAccess<'_>) -> Result<(), FlashError> {
    let cr = FlashCr(access.read_word_32(FLASH_CR)?);
    if !cr.lock() {
        return Ok(());
    }

    access.write_word_32(FLASH_KEYR, KEY1)?;
    access.write_word_32(FLASH_KEYR, KEY2)?;

    let cr = FlashCr(access.read_word_32(FLASH_CR)?);
    if cr.lock() {
        return Err(FlashError::Protected);
    }
    Ok(())
}

fn wait_done(
    access: &mut FlashAccess<'_>,
    timeout_ms: u32,
    failure: FlashError,
) -> Result<(), FlashError> {
    let status = FlashSr(access.poll_status(
        FLASH_SR,
        1 << 16, // BSY
        Duration::from_millis(u64::from(timeout_ms)),
    )?);

    access.write_word_32(FLASH_SR, status.0)?;

    if status.wrperr() {
        return Err(FlashError::Protected);
    }
    if status.0 & FlashSr::ERROR_MASK != 0 {
        return Err(failure);
    }
    Ok(())
}

impl FlashDriver for Stm32F4Flash {
    fn erase_block(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
    ) -> Result<(), FlashError> {
        unlock(access)?;

        let sector =
            self.base_sector + ((address - props.address_range.start) / props.block_size) as u8;

        let mut cr = FlashCr(0);
        cr.set_ser(true);
        cr.set_snb(sector);
        cr.set_psize(PSIZE_X32);
        access.write_word_32(FLASH_CR, cr.0)?;
        cr.set_strt(true);
        access.write_word_32(FLASH_CR, cr.0)?;

        wait_done(
            access,
            props.erase_block_timeout,
            FlashError::EraseFailed { address },
        )
    }

    fn program(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        unlock(access)?;

        let mut cr = FlashCr(0);
        cr.set_pg(true);
        cr.set_psize(PSIZE_X32);
        access.write_word_32(FLASH_CR, cr.0)?;

        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("aligned span")))
            .collect();
        access.write_32(address, &words)?;

        wait_done(
            access,
            props.program_timeout,
            FlashError::ProgramFailed { address },
        )
    }

    fn done(
        &mut self,
        access: &mut FlashAccess<'_>,
        _props: &NvmProperties,
    ) -> Result<(), FlashError> {
        let mut cr = FlashCr(0);
        cr.set_lock(true);
        access.write_word_32(FLASH_CR, cr.0)?;
        Ok(())
    }

    fn erase_all(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
    ) -> Result<(), FlashError> {
        unlock(access)?;

        let mut cr = FlashCr(0);
        cr.set_mer(true);
        cr.set_psize(PSIZE_X32);
        access.write_word_32(FLASH_CR, cr.0)?;
        cr.set_strt(true);
        access.write_word_32(FLASH_CR, cr.0)?;

        wait_done(
            access,
            props.erase_block_timeout * 16,
            FlashError::EraseFailed {
                address: props.address_range.start,
            },
        )
    }
}

fn cmd_erase_mass(
    target: &mut Target,
    dp: &mut dyn DpAccess,
    out: &mut dyn GdbOutput,
    _args: &[&str],
) -> Result<(), Error> {
    let Target { core, flash, .. } = target;
    // MER covers every sector, so any bank's driver may issue it.
    let bank = &mut flash[0];
    let mut access = FlashAccess { core, dp };

    bank.erase_all(&mut access)?;
    bank.driver.done(&mut access, &bank.props)?;
    out.gdb_out("Mass erase complete\n");
    Ok(())
}

fn cmd_option(
    target: &mut Target,
    dp: &mut dyn DpAccess,
    out: &mut dyn GdbOutput,
    args: &[&str],
) -> Result<(), Error> {
    let Target { core, .. } = target;
    let mut access = FlashAccess { core, dp };

    match args {
        [] => {}
        ["write", value] => {
            let value = super::stm32f1::parse_hex(value)?;
            access
                .write_word_32(FLASH_OPTKEYR, OPTKEY1)
                .map_err(FlashError::from)?;
            access
                .write_word_32(FLASH_OPTKEYR, OPTKEY2)
                .map_err(FlashError::from)?;
            access
                .write_word_32(FLASH_OPTCR, value)
                .map_err(FlashError::from)?;
            // OPTSTRT commits the new option bytes.
            access
                .write_word_32(FLASH_OPTCR, value | 1 << 1)
                .map_err(FlashError::from)?;
            wait_done(&mut access, 2000, FlashError::ProgramFailed { address: FLASH_OPTCR })?;
        }
        _ => {
            out.gdb_out("usage: monitor option [write <value>]\n");
            return Ok(());
        }
    }

    let optcr = access.read_word_32(FLASH_OPTCR).map_err(FlashError::from)?;
    out.gdb_out(&format!("OPTCR: 0x{optcr:08X}\n"));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::arm::ap::mock::MockDap;
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
    fn sector_layout_for_1mb_part() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        dap.set_reg(DBGMCU_IDCODE, 0x1000_6413);
        let mut core = attached(&mut dap);

        let info = probe(&mut core, &mut dap, &empty_rom()).unwrap().unwrap();
        assert_eq!(info.flash.len(), 3);
        assert_eq!(info.flash[0].props.address_range, 0x0800_0000..0x0801_0000);
        assert_eq!(info.flash[0].props.block_size, 0x4000);
        assert_eq!(info.flash[1].props.address_range, 0x0801_0000..0x0802_0000);
        assert_eq!(info.flash[1].props.block_size, 0x1_0000);
        assert_eq!(info.flash[2].props.address_range, 0x0802_0000..0x0810_0000);
        assert_eq!(info.flash[2].props.block_size, 0x2_0000);
    }

    #[test]
    fn sector_number_encoding_reaches_cr() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        dap.set_reg(DBGMCU_IDCODE, 0x1000_6413);
        let mut core = attached(&mut dap);
        let info = probe(&mut core, &mut dap, &empty_rom()).unwrap().unwrap();

        // Erase the second 128 KiB sector: global sector number 6.
        let mut bank = info.flash.into_iter().nth(2).unwrap();
        dap.set_reg(FLASH_CR, 0);
        dap.script_reads(FLASH_SR, vec![1 << 16, 1 << 0]);
        dap.set_w1c(FLASH_SR, FlashSr::ERROR_MASK | 1);

        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };
        bank.erase(&mut access, 0x0804_0000, 0x2_0000).unwrap();

        let cr_writes: Vec<u32> = dap
            .write_log
            .iter()
            .filter(|(addr, _)| *addr == FLASH_CR)
            .map(|(_, value)| *value)
            .collect();
        let expected = 1 << 1 | (6 << 3) | u32::from(PSIZE_X32) << 8;
        assert_eq!(cr_writes, vec![expected, expected | 1 << 16]);
    }
}
