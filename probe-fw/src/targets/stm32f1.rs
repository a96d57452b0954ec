//! STM32F1 medium/high density support.
//!
//! The flash controller programs half words and erases a page at a time
//! through FLASH_CR.PER with the page address in FLASH_AR. Option bytes
//! live at 0x1FFF_F800 and have their own unlock and programming bits.

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

const FLASH_KEYR: u32 = 0x4002_2004;
const FLASH_OPTKEYR: u32 = 0x4002_2008;
const FLASH_SR: u32 = 0x4002_200C;
const FLASH_CR: u32 = 0x4002_2010;
const FLASH_AR: u32 = 0x4002_2014;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

/// The option byte block.
const OPTION_BASE: u32 = 0x1FFF_F800;
const OPTION_LEN: u32 = 16;
/// Read protection disabled key.
const RDP_KEY: u16 = 0x5AA5;

bitfield! {
    /// FLASH_SR.
    #[derive(Copy, Clone)]
    pub struct FlashSr(u32);
    impl Debug;
    pub eop, _: 5;
    pub wrprterr, _: 4;
    pub pgerr, _: 2;
    pub bsy, _: 0;
}

impl FlashSr {
    /// PGERR | WRPRTERR.
    const ERROR_MASK: u32 = 1 << 2 | 1 << 4;
}

bitfield! {
    /// FLASH_CR.
    #[derive(Copy, Clone)]
    pub struct FlashCr(u32);
    impl Debug;
    pub optwre, set_optwre: 9;
    pub lock, set_lock: 7;
    pub strt, set_strt: 6;
    pub opter, set_opter: 5;
    pub optpg, set_optpg: 4;
    pub mer, set_mer: 2;
    pub per, set_per: 1;
    pub pg, set_pg: 0;
}

/// Identify the device from the low 12 bits of DBGMCU_IDCODE.
pub(crate) fn probe(
    core: &mut CortexM,
    dp: &mut dyn DpAccess,
    _rom: &RomTable,
) -> Result<Option<TargetInfo>, Error> {
    let idcode = core.ap_mut().read_word_32(dp, DBGMCU_IDCODE)? & 0xFFF;
    if dp.fault() {
        return Ok(None);
    }

    let (name, flash_size, ram_size, block_size) = match idcode {
        0x410 => ("STM32F103 medium density", 0x2_0000, 0x5000, 0x400),
        0x412 => ("STM32F103 low density", 0x8000, 0x2800, 0x400),
        0x414 => ("STM32F10x high density", 0x8_0000, 0x1_0000, 0x800),
        0x418 => ("STM32F105/F107 connectivity line", 0x4_0000, 0x1_0000, 0x800),
        0x420 => ("STM32F100 value line", 0x2_0000, 0x2000, 0x400),
        0x428 => ("STM32F100 high density value line", 0x8_0000, 0x8000, 0x800),
        0x430 => ("STM32F10x XL density", 0x10_0000, 0x1_8000, 0x800),
        _ => return Ok(None),
    };
    debug!("DBGMCU_IDCODE {idcode:#05x}: {name}");

    let flash_range = 0x0800_0000..0x0800_0000 + flash_size;
    let props = NvmProperties {
        address_range: flash_range.clone(),
        block_size,
        write_alignment: 4,
        erased_byte_value: 0xFF,
        write_buffer_size: None,
        erase_block_timeout: 400,
        program_timeout: 100,
    };

    Ok(Some(TargetInfo {
        name: name.to_string(),
        part_id: idcode,
        memory_map: vec![
            MemoryRegion::Nvm(NvmRegion {
                range: flash_range,
                block_size,
                is_boot_memory: true,
            }),
            MemoryRegion::Ram(RamRegion {
                range: 0x2000_0000..0x2000_0000 + ram_size,
                is_boot_memory: false,
            }),
        ],
        flash: vec![FlashBank::new(props, Box::new(Stm32F1Flash))],
        commands: vec![
            MonitorCommand {
                name: "erase_mass",
                help: "Erase the entire flash",
                handler: cmd_erase_mass,
            },
            MonitorCommand {
                name: "option",
                help: "Read or write option bytes: option [erase | <addr> <value>]",
                handler: cmd_option,
            },
        ],
    }))
}

struct Stm32F1Flash;

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

/// Wait for BSY to clear and fold the status bits into a result.
fn wait_done(
    access: &mut FlashAccess<'_>,
    timeout_ms: u32,
    failure: FlashError,
) -> Result<(), FlashError> {
    let status = FlashSr(access.poll_status(
        FLASH_SR,
        1, // BSY
        Duration::from_millis(u64::from(timeout_ms)),
    )?);

    // The sticky bits are write-one-to-clear.
    access.write_word_32(FLASH_SR, status.0)?;

    if status.wrprterr() {
        return Err(FlashError::Protected);
    }
    if status.pgerr() || !status.eop() {
        return Err(failure);
    }
    Ok(())
}

impl FlashDriver for Stm32F1Flash {
    fn erase_block(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
    ) -> Result<(), FlashError> {
        unlock(access)?;

        let mut cr = FlashCr(0);
        cr.set_per(true);
        access.write_word_32(FLASH_CR, cr.0)?;
        access.write_word_32(FLASH_AR, address)?;
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
        access.write_word_32(FLASH_CR, cr.0)?;

        // The controller accepts half word programming only.
        for (offset, half) in data.chunks_exact(2).enumerate() {
            let target = address + 2 * offset as u32;
            access.write_word_16(target, u16::from_le_bytes([half[0], half[1]]))?;
            wait_done(
                access,
                props.program_timeout,
                FlashError::ProgramFailed { address: target },
            )?;
        }
        Ok(())
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
        access.write_word_32(FLASH_CR, cr.0)?;
        cr.set_strt(true);
        access.write_word_32(FLASH_CR, cr.0)?;

        wait_done(
            access,
            props.erase_block_timeout * 32,
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
    let bank = &mut flash[0];
    let mut access = FlashAccess { core, dp };

    bank.erase_all(&mut access)?;
    bank.driver.done(&mut access, &bank.props)?;
    out.gdb_out("Mass erase complete\n");
    Ok(())
}

/// `monitor option`: no arguments prints the block, `erase` wipes it and
/// disables read protection, `<addr> <value>` programs one half word.
fn cmd_option(
    target: &mut Target,
    dp: &mut dyn DpAccess,
    out: &mut dyn GdbOutput,
    args: &[&str],
) -> Result<(), Error> {
    let Target { core, flash, .. } = target;
    let props = flash[0].props.clone();
    let mut access = FlashAccess { core, dp };

    match args {
        [] => {}
        ["erase"] => {
            option_unlock(&mut access)?;

            let mut cr = FlashCr(0);
            cr.set_opter(true);
            cr.set_optwre(true);
            access.write_word_32(FLASH_CR, cr.0)?;
            cr.set_strt(true);
            access.write_word_32(FLASH_CR, cr.0)?;
            wait_done(
                &mut access,
                props.erase_block_timeout,
                FlashError::EraseFailed {
                    address: OPTION_BASE,
                },
            )?;

            // Leave the part readable.
            option_program(&mut access, &props, OPTION_BASE, RDP_KEY)?;
        }
        [addr, value] => {
            let address = parse_hex(addr)?;
            let value = parse_hex(value)? as u16;
            if address < OPTION_BASE || address >= OPTION_BASE + OPTION_LEN || address % 2 != 0 {
                return Err(Error::Other(anyhow::anyhow!(
                    "option address must be an even address inside {OPTION_BASE:#010x}+{OPTION_LEN:#x}"
                )));
            }
            option_unlock(&mut access)?;
            option_program(&mut access, &props, address, value)?;
        }
        _ => {
            out.gdb_out("usage: monitor option [erase | <addr> <value>]\n");
            return Ok(());
        }
    }

    for offset in (0..OPTION_LEN).step_by(4) {
        let word = access.read_word_32(OPTION_BASE + offset).map_err(FlashError::from)?;
        out.gdb_out(&format!(
            "0x{:08X}: 0x{:04X} 0x{:04X}\n",
            OPTION_BASE + offset,
            word & 0xFFFF,
            word >> 16
        ));
    }
    Ok(())
}

fn option_unlock(access: &mut FlashAccess<'_>) -> Result<(), FlashError> {
    unlock(access)?;
    access.write_word_32(FLASH_OPTKEYR, KEY1)?;
    access.write_word_32(FLASH_OPTKEYR, KEY2)?;
    Ok(())
}

fn option_program(
    access: &mut FlashAccess<'_>,
    props: &NvmProperties,
    address: u32,
    value: u16,
) -> Result<(), FlashError> {
    let mut cr = FlashCr(0);
    cr.set_optpg(true);
    cr.set_optwre(true);
    access.write_word_32(FLASH_CR, cr.0)?;
    access.write_word_16(address, value)?;
    wait_done(
        access,
        props.program_timeout,
        FlashError::ProgramFailed { address },
    )
}

pub(crate) fn parse_hex(text: &str) -> Result<u32, Error> {
    let trimmed = text.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16)
        .map_err(|_| Error::Other(anyhow::anyhow!("'{text}' is not a hex number")))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::arm::ap::mock::MockDap;
    use crate::architecture::arm::ap::{GenericAp, MemoryAp, IDR};
    use crate::architecture::arm::memory::romtable::RomTable;
    use crate::gdb::BufferedOutput;
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
            peripheral_id: crate::architecture::arm::memory::romtable::PeripheralId::from_raw(0),
            components: Vec::new(),
        }
    }

    fn f103(dap: &mut MockDap) -> (CortexM, TargetInfo) {
        dap.set_reg(DBGMCU_IDCODE, 0x2000_6410);
        let mut core = attached(dap);
        let info = probe(&mut core, dap, &empty_rom()).unwrap().unwrap();
        (core, info)
    }

    #[test]
    fn probes_stm32f103_geometry() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let (_core, info) = f103(&mut dap);

        assert_eq!(info.part_id, 0x410);
        assert!(info.name.contains("STM32F103"));

        let MemoryRegion::Nvm(flash) = &info.memory_map[0] else {
            panic!("first region must be flash");
        };
        assert_eq!(flash.range, 0x0800_0000..0x0802_0000);
        assert_eq!(flash.block_size, 0x400);
        let MemoryRegion::Ram(ram) = &info.memory_map[1] else {
            panic!("second region must be RAM");
        };
        assert_eq!(ram.range, 0x2000_0000..0x2000_5000);
    }

    #[test]
    fn unknown_idcode_does_not_match() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        dap.set_reg(DBGMCU_IDCODE, 0x2000_6999);
        let mut core = attached(&mut dap);
        assert!(probe(&mut core, &mut dap, &empty_rom()).unwrap().is_none());
    }

    #[test]
    fn erase_mass_writes_mer_then_strt() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let (core, info) = f103(&mut dap);
        let mut target = Target::assemble(core, info);

        // Unlocked CR, then BSY clears with EOP set.
        dap.set_reg(FLASH_CR, 0);
        dap.script_reads(FLASH_SR, vec![1, 1, 1 << 5]);
        dap.set_w1c(FLASH_SR, FlashSr::ERROR_MASK | 1 << 5);

        let mut out = BufferedOutput::default();
        target.monitor(&mut dap, &mut out, "erase_mass").unwrap();

        let cr_writes: Vec<u32> = dap
            .write_log
            .iter()
            .filter(|(addr, _)| *addr == FLASH_CR)
            .map(|(_, value)| *value)
            .collect();
        // MER alone, then MER|STRT, then the lock from done().
        assert_eq!(cr_writes, vec![1 << 2, 1 << 2 | 1 << 6, 1 << 7]);
        assert!(out.text().contains("Mass erase complete"));
    }

    #[test]
    fn page_erase_programs_ar_and_checks_eop() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let (mut core, info) = f103(&mut dap);
        let mut bank = info.flash.into_iter().next().unwrap();

        dap.set_reg(FLASH_CR, 0);
        dap.script_reads(FLASH_SR, vec![1, 1 << 5]);
        dap.set_w1c(FLASH_SR, FlashSr::ERROR_MASK | 1 << 5);

        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };
        bank.erase(&mut access, 0x0800_0400, 0x400).unwrap();

        assert!(dap.write_log.contains(&(FLASH_AR, 0x0800_0400)));
    }

    #[test]
    fn protection_error_is_reported() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let (mut core, info) = f103(&mut dap);
        let mut bank = info.flash.into_iter().next().unwrap();

        dap.set_reg(FLASH_CR, 0);
        // BSY clears but WRPRTERR is latched.
        dap.script_reads(FLASH_SR, vec![1 << 4]);
        dap.set_w1c(FLASH_SR, FlashSr::ERROR_MASK | 1 << 5);

        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };
        assert!(matches!(
            bank.erase(&mut access, 0x0800_0000, 0x400),
            Err(FlashError::Protected)
        ));
    }

    #[test]
    fn locked_flash_unlocks_with_the_key_sequence() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let (mut core, info) = f103(&mut dap);
        let mut bank = info.flash.into_iter().next().unwrap();

        // CR reads locked first, unlocked after the keys.
        dap.script_reads(FLASH_CR, vec![1 << 7, 0]);
        dap.script_reads(FLASH_SR, vec![1 << 5]);
        dap.set_w1c(FLASH_SR, FlashSr::ERROR_MASK | 1 << 5);

        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };
        bank.erase(&mut access, 0x0800_0000, 0x400).unwrap();

        let keys: Vec<u32> = dap
            .write_log
            .iter()
            .filter(|(addr, _)| *addr == FLASH_KEYR)
            .map(|(_, value)| *value)
            .collect();
        assert_eq!(keys, vec![KEY1, KEY2]);
    }
}
