//! Microchip/Atmel SAMD support.
//!
//! The family is recognized from the Peripheral ID of its ROM table, the
//! exact device from the DSU's DID register. The NVM controller erases a
//! row (four pages) at a time and programs through the page buffer: the
//! probe writes the page over the bus, then issues the write-page
//! command.

use bitfield::bitfield;
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

/// Peripheral ID of the SAMD ROM table, with the revision field masked.
const ROM_PIDR: u64 = 0x0001_FCD0;
const ROM_PIDR_MASK: u64 = 0x000F_0FFF_FFFF;

/// Device Service Unit, through its external access window.
const DSU_CTRLSTAT: u32 = 0x4100_2100;
const DSU_DID: u32 = 0x4100_2118;
/// DSU.CTRL chip erase command.
const DSU_CTRL_CE: u32 = 1 << 4;
/// DSU.STATUSA.DONE, as seen through the word at CTRLSTAT.
const DSU_STATUSA_DONE: u32 = 1 << 8;

/// Non-volatile memory controller.
const NVMC_CTRLA: u32 = 0x4100_4000;
const NVMC_CTRLB: u32 = 0x4100_4004;
const NVMC_PARAM: u32 = 0x4100_4008;
const NVMC_INTFLAG: u32 = 0x4100_4014;
const NVMC_STATUS: u32 = 0x4100_4018;
const NVMC_ADDR: u32 = 0x4100_401C;

/// CTRLA.CMDEX key.
const CMDEX: u32 = 0xA5 << 8;
/// Commands.
const CMD_ERASE_ROW: u32 = 0x02;
const CMD_WRITE_PAGE: u32 = 0x04;
const CMD_PAGE_BUFFER_CLEAR: u32 = 0x44;

/// INTFLAG.READY.
const READY: u32 = 1 << 0;

bitfield! {
    /// NVMC STATUS.
    #[derive(Copy, Clone)]
    pub struct NvmcStatus(u32);
    impl Debug;
    pub nvme, _: 4;
    pub locke, _: 3;
    pub proge, _: 2;
    pub load, _: 1;
    pub prm, _: 0;
}

impl NvmcStatus {
    const ERROR_MASK: u32 = 1 << 4 | 1 << 3 | 1 << 2;
}

bitfield! {
    /// DSU Device ID.
    #[derive(Copy, Clone)]
    pub struct Did(u32);
    impl Debug;
    pub u8, processor, _: 31, 28;
    pub u8, family, _: 27, 23;
    pub u8, series, _: 21, 16;
    pub u8, die, _: 15, 12;
    pub u8, revision, _: 11, 8;
    pub u8, devsel, _: 7, 0;
}

/// Decode the marketing name out of DID.
fn decode_variant(did: Did) -> Option<(String, u32, u32)> {
    // Processor 1 is the Cortex-M0+, family 0 the D series.
    if did.processor() != 1 || did.family() != 0 {
        return None;
    }

    let series = match did.series() {
        0 => 20,
        1 => 21,
        _ => return None,
    };

    // DEVSEL counts J, G then E pin variants, five memory sizes each.
    let pin = match did.devsel() / 5 {
        0 => 'J',
        1 => 'G',
        2 => 'E',
        _ => return None,
    };
    let mem = 18 - u32::from(did.devsel() % 5);
    let revision = char::from(b'A' + did.revision());

    let name = format!("Atmel SAMD{series}{pin}{mem}A (rev {revision})");
    let flash_size = 1 << mem;
    let ram_size = 1 << (mem - 3);
    Some((name, flash_size, ram_size))
}

pub(crate) fn probe(
    core: &mut CortexM,
    dp: &mut dyn DpAccess,
    rom: &RomTable,
) -> Result<Option<TargetInfo>, Error> {
    if rom.peripheral_id.raw() & ROM_PIDR_MASK != ROM_PIDR {
        return Ok(None);
    }

    let did = Did(core.ap_mut().read_word_32(dp, DSU_DID)?);
    if dp.fault() {
        return Ok(None);
    }
    let Some((name, flash_size, ram_size)) = decode_variant(did) else {
        debug!("SAMD ROM table but unknown DID {:#010x}", did.0);
        return Ok(None);
    };
    debug!("DSU DID {:#010x}: {name}", did.0);

    // Geometry from the NVMC itself: page size and page count.
    let param = core.ap_mut().read_word_32(dp, NVMC_PARAM)?;
    let page_size = 8u32 << ((param >> 16) & 0x7);
    let pages = param & 0xFFFF;
    let nvm_size = if pages > 0 {
        (page_size * pages).min(flash_size)
    } else {
        flash_size
    };
    let row_size = page_size * 4;

    let flash_range = 0x0000_0000..nvm_size;

    Ok(Some(TargetInfo {
        name,
        part_id: did.0,
        memory_map: vec![
            MemoryRegion::Nvm(NvmRegion {
                range: flash_range.clone(),
                block_size: row_size,
                is_boot_memory: true,
            }),
            MemoryRegion::Ram(RamRegion {
                range: 0x2000_0000..0x2000_0000 + ram_size,
                is_boot_memory: false,
            }),
        ],
        flash: vec![FlashBank::new(
            NvmProperties {
                address_range: flash_range,
                block_size: row_size,
                write_alignment: 4,
                erased_byte_value: 0xFF,
                write_buffer_size: Some(page_size),
                erase_block_timeout: 100,
                program_timeout: 100,
            },
            Box::new(SamdFlash),
        )],
        commands: vec![MonitorCommand {
            name: "erase_mass",
            help: "Erase the entire chip through the DSU",
            handler: cmd_erase_mass,
        }],
    }))
}

struct SamdFlash;

fn wait_ready(access: &mut FlashAccess<'_>, timeout_ms: u32) -> Result<(), FlashError> {
    let start = Instant::now();
    loop {
        if access.read_word_32(NVMC_INTFLAG)? & READY != 0 {
            return Ok(());
        }
        if start.elapsed() >= Duration::from_millis(u64::from(timeout_ms)) {
            return Err(FlashError::Timeout);
        }
    }
}

fn check_status(access: &mut FlashAccess<'_>, failure: FlashError) -> Result<(), FlashError> {
    let status = NvmcStatus(access.read_word_32(NVMC_STATUS)?);
    if status.0 & NvmcStatus::ERROR_MASK == 0 {
        return Ok(());
    }
    // Status bits are write-one-to-clear.
    access.write_word_32(NVMC_STATUS, status.0 & NvmcStatus::ERROR_MASK)?;
    if status.locke() {
        Err(FlashError::Protected)
    } else {
        Err(failure)
    }
}

impl FlashDriver for SamdFlash {
    fn erase_block(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
    ) -> Result<(), FlashError> {
        // NVMC addresses count half words.
        access.write_word_32(NVMC_ADDR, address / 2)?;
        access.write_word_32(NVMC_CTRLA, CMDEX | CMD_ERASE_ROW)?;
        wait_ready(access, props.erase_block_timeout)?;
        check_status(access, FlashError::EraseFailed { address })
    }

    fn program(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        access.write_word_32(NVMC_CTRLA, CMDEX | CMD_PAGE_BUFFER_CLEAR)?;
        wait_ready(access, props.program_timeout)?;

        // Fill the page buffer over the bus, then commit it.
        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("aligned span")))
            .collect();
        access.write_32(address, &words)?;

        access.write_word_32(NVMC_ADDR, address / 2)?;
        access.write_word_32(NVMC_CTRLA, CMDEX | CMD_WRITE_PAGE)?;
        wait_ready(access, props.program_timeout)?;
        check_status(access, FlashError::ProgramFailed { address })
    }

    fn erase_all(
        &mut self,
        access: &mut FlashAccess<'_>,
        _props: &NvmProperties,
    ) -> Result<(), FlashError> {
        access.write_word_32(DSU_CTRLSTAT, DSU_CTRL_CE)?;

        let start = Instant::now();
        loop {
            if access.read_word_32(DSU_CTRLSTAT)? & DSU_STATUSA_DONE != 0 {
                return Ok(());
            }
            if start.elapsed() >= Duration::from_secs(5) {
                return Err(FlashError::Timeout);
            }
        }
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
    out.gdb_out("Chip erase complete\n");
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

    fn samd_rom() -> RomTable {
        RomTable {
            // Revision B in the masked-out nibble.
            peripheral_id: PeripheralId::from_raw(0x0011_FCD0),
            components: Vec::new(),
        }
    }

    /// SAMD21J18A rev B: processor M0+, family D, series 21, devsel 0.
    const DID_SAMD21J18A: u32 = 0x1001_0100;

    #[test]
    fn samd21_is_decoded_from_did() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        dap.set_reg(DSU_DID, DID_SAMD21J18A);
        // 4096 pages of 64 bytes.
        dap.set_reg(NVMC_PARAM, 4096 | 1 << 17 | 1 << 16);
        let mut core = attached(&mut dap);

        let info = probe(&mut core, &mut dap, &samd_rom()).unwrap().unwrap();
        assert_eq!(info.name, "Atmel SAMD21J18A (rev B)");

        let bank = &info.flash[0];
        assert_eq!(bank.props.address_range, 0x0..0x4_0000);
        assert_eq!(bank.props.block_size, 256);
        assert_eq!(bank.props.write_buffer_size, Some(64));
    }

    #[test]
    fn wrong_rom_pidr_is_skipped() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        dap.set_reg(DSU_DID, DID_SAMD21J18A);
        let mut core = attached(&mut dap);

        let rom = RomTable {
            peripheral_id: PeripheralId::from_raw(0x0001_0000),
            components: Vec::new(),
        };
        assert!(probe(&mut core, &mut dap, &rom).unwrap().is_none());
    }

    #[test]
    fn row_erase_counts_half_words() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        dap.set_reg(DSU_DID, DID_SAMD21J18A);
        dap.set_reg(NVMC_PARAM, 4096 | 1 << 17 | 1 << 16);
        let mut core = attached(&mut dap);
        let info = probe(&mut core, &mut dap, &samd_rom()).unwrap().unwrap();
        let mut bank = info.flash.into_iter().next().unwrap();

        dap.set_reg(NVMC_INTFLAG, READY);
        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };
        bank.erase(&mut access, 0x100, 0x100).unwrap();

        assert!(dap.write_log.contains(&(NVMC_ADDR, 0x80)));
        assert!(dap
            .write_log
            .contains(&(NVMC_CTRLA, CMDEX | CMD_ERASE_ROW)));
    }

    #[test]
    fn page_program_commits_through_the_page_buffer() {
        let mut dap = MockDap::new(0x0, 0x1000);
        dap.set_reg(DSU_DID, DID_SAMD21J18A);
        dap.set_reg(NVMC_PARAM, 4096 | 1 << 17 | 1 << 16);
        let mut core = attached(&mut dap);
        let info = probe(&mut core, &mut dap, &samd_rom()).unwrap().unwrap();
        let mut bank = info.flash.into_iter().next().unwrap();

        dap.set_reg(NVMC_INTFLAG, READY);
        let payload = [0xA5u8; 64];
        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };
        bank.write(&mut access, 0x40, &payload).unwrap();

        // Buffer clear, then the page data on the bus, then write page.
        assert!(dap
            .write_log
            .contains(&(NVMC_CTRLA, CMDEX | CMD_PAGE_BUFFER_CLEAR)));
        assert_eq!(&dap.ram[0x40..0x80], &payload);
        assert!(dap.write_log.contains(&(NVMC_ADDR, 0x20)));
        assert!(dap.write_log.contains(&(NVMC_CTRLA, CMDEX | CMD_WRITE_PAGE)));
    }
}
