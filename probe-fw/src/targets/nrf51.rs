//! Nordic nRF51 support.
//!
//! Everything is register level: the NVMC is put into erase or write
//! mode through CONFIG, pages are erased by address, words are written
//! straight over the bus, and READY gates every step. The UICR is a
//! second tiny region with its own erase trigger. Geometry comes from
//! the factory information block.

use probe_fw_target::{MemoryRegion, NvmProperties, NvmRegion, RamRegion};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{MonitorCommand, Target, TargetInfo};
use crate::architecture::arm::core::CortexM;
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::memory::RomTable;
use crate::error::Error;
use crate::flashing::{FlashAccess, FlashBank, FlashDriver, FlashError};
use crate::gdb::GdbOutput;

/// Factory information configuration registers.
const FICR_CODEPAGESIZE: u32 = 0x1000_0010;
const FICR_CODESIZE: u32 = 0x1000_0014;
const FICR_SIZERAMBLOCKS: u32 = 0x1000_0018;
const FICR_NUMRAMBLOCK: u32 = 0x1000_001C;

/// Non-volatile memory controller.
const NVMC_READY: u32 = 0x4001_E400;
const NVMC_CONFIG: u32 = 0x4001_E504;
const NVMC_ERASEPAGE: u32 = 0x4001_E508;
const NVMC_ERASEALL: u32 = 0x4001_E50C;
const NVMC_ERASEUICR: u32 = 0x4001_E514;

/// CONFIG values: read only, write enable, erase enable.
const CONFIG_REN: u32 = 0;
const CONFIG_WEN: u32 = 1;
const CONFIG_EEN: u32 = 2;

const UICR_BASE: u32 = 0x1000_1000;
const UICR_SIZE: u32 = 0x100;

pub(crate) fn probe(
    core: &mut CortexM,
    dp: &mut dyn DpAccess,
    rom: &RomTable,
) -> Result<Option<TargetInfo>, Error> {
    // Nordic's JEP106 designer code gates the FICR reads.
    let nordic = rom
        .peripheral_id
        .designer()
        .map(|designer| designer.cc == 0x02 && designer.id == 0x44)
        .unwrap_or(false);
    if !nordic {
        return Ok(None);
    }

    let page_size = core.ap_mut().read_word_32(dp, FICR_CODEPAGESIZE)?;
    let pages = core.ap_mut().read_word_32(dp, FICR_CODESIZE)?;
    let ram_block = core.ap_mut().read_word_32(dp, FICR_SIZERAMBLOCKS)?;
    let ram_blocks = core.ap_mut().read_word_32(dp, FICR_NUMRAMBLOCK)?;
    if dp.fault() {
        return Ok(None);
    }
    if !page_size.is_power_of_two() || !(0x100..=0x1000).contains(&page_size) || pages == 0 {
        debug!("Nordic part with implausible FICR geometry, skipping");
        return Ok(None);
    }

    let flash_size = page_size * pages;
    let ram_size = ram_block * ram_blocks;
    debug!("nRF51: {pages} pages of {page_size} bytes, {ram_size:#x} bytes of RAM");

    let flash_range = 0x0000_0000..flash_size;
    let uicr_range = UICR_BASE..UICR_BASE + UICR_SIZE;

    Ok(Some(TargetInfo {
        name: "Nordic nRF51".to_string(),
        part_id: pages << 16 | page_size >> 8,
        memory_map: vec![
            MemoryRegion::Nvm(NvmRegion {
                range: flash_range.clone(),
                block_size: page_size,
                is_boot_memory: true,
            }),
            MemoryRegion::Nvm(NvmRegion {
                range: uicr_range.clone(),
                block_size: UICR_SIZE,
                is_boot_memory: false,
            }),
            MemoryRegion::Ram(RamRegion {
                range: 0x2000_0000..0x2000_0000 + ram_size,
                is_boot_memory: false,
            }),
        ],
        flash: vec![
            FlashBank::new(
                NvmProperties {
                    address_range: flash_range,
                    block_size: page_size,
                    write_alignment: 4,
                    erased_byte_value: 0xFF,
                    write_buffer_size: None,
                    erase_block_timeout: 100,
                    program_timeout: 100,
                },
                Box::new(Nrf51Flash { uicr: false }),
            ),
            FlashBank::new(
                NvmProperties {
                    address_range: uicr_range,
                    block_size: UICR_SIZE,
                    write_alignment: 4,
                    erased_byte_value: 0xFF,
                    write_buffer_size: None,
                    erase_block_timeout: 100,
                    program_timeout: 100,
                },
                Box::new(Nrf51Flash { uicr: true }),
            ),
        ],
        commands: vec![MonitorCommand {
            name: "erase_mass",
            help: "Erase the code flash and the UICR",
            handler: cmd_erase_mass,
        }],
    }))
}

struct Nrf51Flash {
    /// This instance drives the UICR rather than the code flash.
    uicr: bool,
}

fn wait_ready(access: &mut FlashAccess<'_>, timeout_ms: u32) -> Result<(), FlashError> {
    let start = Instant::now();
    loop {
        if access.read_word_32(NVMC_READY)? & 1 != 0 {
            return Ok(());
        }
        if start.elapsed() >= Duration::from_millis(u64::from(timeout_ms)) {
            return Err(FlashError::Timeout);
        }
    }
}

impl FlashDriver for Nrf51Flash {
    fn erase_block(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
    ) -> Result<(), FlashError> {
        access.write_word_32(NVMC_CONFIG, CONFIG_EEN)?;
        if self.uicr {
            access.write_word_32(NVMC_ERASEUICR, 1)?;
        } else {
            access.write_word_32(NVMC_ERASEPAGE, address)?;
        }
        wait_ready(access, props.erase_block_timeout)?;
        access.write_word_32(NVMC_CONFIG, CONFIG_REN)?;
        Ok(())
    }

    fn program(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        access.write_word_32(NVMC_CONFIG, CONFIG_WEN)?;

        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("aligned span")))
            .collect();
        for (i, word) in words.iter().enumerate() {
            access.write_word_32(address + 4 * i as u32, *word)?;
            wait_ready(access, props.program_timeout)?;
        }

        access.write_word_32(NVMC_CONFIG, CONFIG_REN)?;
        Ok(())
    }

    fn erase_all(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
    ) -> Result<(), FlashError> {
        access.write_word_32(NVMC_CONFIG, CONFIG_EEN)?;
        access.write_word_32(NVMC_ERASEALL, 1)?;
        wait_ready(access, props.erase_block_timeout * 256)?;
        access.write_word_32(NVMC_CONFIG, CONFIG_REN)?;
        Ok(())
    }
}

fn cmd_erase_mass(
    target: &mut Target,
    dp: &mut dyn DpAccess,
    out: &mut dyn GdbOutput,
    _args: &[&str],
) -> Result<(), Error> {
    let Target { core, flash, .. } = target;
    let (uicr_start, uicr_end) = {
        let range = &flash[1].props.address_range;
        (range.start, range.end)
    };

    let mut access = FlashAccess { core, dp };
    flash[0].erase_all(&mut access)?;
    // ERASEALL covers the code flash; the UICR has its own trigger.
    flash[1].erase(&mut access, uicr_start, uicr_end - uicr_start)?;

    out.gdb_out("Mass erase complete\n");
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

    fn nordic_rom() -> RomTable {
        // JEP106 continuation 2, identity 0x44, with the JEDEC bit.
        RomTable {
            peripheral_id: PeripheralId::from_raw(0x44_u64 << 12 | 1_u64 << 19 | 2_u64 << 32),
            components: Vec::new(),
        }
    }

    fn seed_ficr(dap: &mut MockDap) {
        dap.set_reg(FICR_CODEPAGESIZE, 0x400);
        dap.set_reg(FICR_CODESIZE, 256);
        dap.set_reg(FICR_SIZERAMBLOCKS, 0x2000);
        dap.set_reg(FICR_NUMRAMBLOCK, 2);
    }

    #[test]
    fn geometry_comes_from_ficr() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        seed_ficr(&mut dap);
        let mut core = attached(&mut dap);

        let info = probe(&mut core, &mut dap, &nordic_rom()).unwrap().unwrap();
        assert_eq!(info.name, "Nordic nRF51");
        assert_eq!(info.flash[0].props.address_range, 0x0..0x4_0000);
        assert_eq!(info.flash[0].props.block_size, 0x400);
        assert_eq!(info.flash[1].props.address_range, UICR_BASE..UICR_BASE + 0x100);

        let ram = info
            .memory_map
            .iter()
            .find_map(|region| match region {
                MemoryRegion::Ram(ram) => Some(ram.range.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(ram, 0x2000_0000..0x2000_4000);
    }

    #[test]
    fn non_nordic_designer_is_skipped() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        seed_ficr(&mut dap);
        let mut core = attached(&mut dap);

        let rom = RomTable {
            peripheral_id: PeripheralId::from_raw(0x3B_u64 << 12 | 1 << 19 | 4_u64 << 32),
            components: Vec::new(),
        };
        assert!(probe(&mut core, &mut dap, &rom).unwrap().is_none());
    }

    #[test]
    fn page_erase_uses_config_and_erasepage() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        seed_ficr(&mut dap);
        let mut core = attached(&mut dap);
        let info = probe(&mut core, &mut dap, &nordic_rom()).unwrap().unwrap();
        let mut bank = info.flash.into_iter().next().unwrap();

        dap.set_reg(NVMC_READY, 1);
        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };
        bank.erase(&mut access, 0x800, 0x400).unwrap();

        let nvmc_writes: Vec<(u32, u32)> = dap
            .write_log
            .iter()
            .copied()
            .filter(|(addr, _)| (NVMC_CONFIG..=NVMC_ERASEUICR).contains(addr))
            .collect();
        assert_eq!(
            nvmc_writes,
            vec![
                (NVMC_CONFIG, CONFIG_EEN),
                (NVMC_ERASEPAGE, 0x800),
                (NVMC_CONFIG, CONFIG_REN),
            ]
        );
    }
}
