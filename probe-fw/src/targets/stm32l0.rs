//! STM32L0 and STM32L1 support.
//!
//! The low power families program through the NVM interface: PECR
//! selects the operation, key registers unlock it and the actual data
//! transfer is a plain bus write. Half-page programming (FPRG) needs the
//! sixteen words delivered back to back, which the probe cannot do fast
//! enough over the wire, so those go through a copy stub running from
//! target RAM. The data EEPROM is a separate region programmed a word at
//! a time.

use bitfield::bitfield;
use probe_fw_target::{MemoryRegion, NvmProperties, NvmRegion, RamRegion};
use std::time::Duration;
use tracing::debug;

use super::{MonitorCommand, Target, TargetInfo};
use crate::architecture::arm::core::CortexM;
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::memory::RomTable;
use crate::error::Error;
use crate::flashing::{stub, FlashAccess, FlashBank, FlashDriver, FlashError};
use crate::gdb::GdbOutput;

/// The L0 DBGMCU lives on the APB, the L1's in the Cortex-M private
/// space like the F series.
const DBGMCU_IDCODE_L0: u32 = 0x4001_5800;
const DBGMCU_IDCODE_L1: u32 = 0xE004_2000;

const PEKEY1: u32 = 0x89AB_CDEF;
const PEKEY2: u32 = 0x0203_0405;
const PRGKEY1: u32 = 0x8C9D_AEBF;
const PRGKEY2: u32 = 0x1314_1516;

bitfield! {
    /// FLASH_PECR.
    #[derive(Copy, Clone)]
    pub struct Pecr(u32);
    impl Debug;
    pub fprg, set_fprg: 10;
    pub erase, set_erase: 9;
    pub data, set_data: 4;
    pub prog, set_prog: 3;
    pub optlock, _: 2;
    pub prglock, _: 1;
    pub pelock, _: 0;
}

bitfield! {
    /// FLASH_SR.
    #[derive(Copy, Clone)]
    pub struct NvmSr(u32);
    impl Debug;
    pub notzeroerr, _: 16;
    pub rderr, _: 13;
    pub optverr, _: 11;
    pub sizerr, _: 10;
    pub pgaerr, _: 9;
    pub wrperr, _: 8;
    pub eop, _: 1;
    pub bsy, _: 0;
}

impl NvmSr {
    const ERROR_MASK: u32 = 1 << 16 | 1 << 13 | 1 << 11 | 1 << 10 | 1 << 9 | 1 << 8;
}

/// NVM register file layout, shared between L0 and L1 at different
/// bases.
#[derive(Debug, Clone, Copy)]
struct NvmRegs {
    base: u32,
}

impl NvmRegs {
    fn pecr(&self) -> u32 {
        self.base + 0x04
    }
    fn pekeyr(&self) -> u32 {
        self.base + 0x0C
    }
    fn prgkeyr(&self) -> u32 {
        self.base + 0x10
    }
    fn sr(&self) -> u32 {
        self.base + 0x18
    }
}

const L0_NVM: NvmRegs = NvmRegs { base: 0x4002_2000 };
const L1_NVM: NvmRegs = NvmRegs { base: 0x4002_3C00 };

/// A tight Thumb copy loop: r0 = destination, r1 = source, r2 = word
/// count. Ends in the `BKPT` the stub runner plants after it.
///
/// ```text
/// loop: ldr  r4, [r1]
///       str  r4, [r0]
///       adds r1, #4
///       adds r0, #4
///       subs r2, #1
///       bne  loop
/// ```
const COPY_STUB: [u16; 6] = [0x680C, 0x6004, 0x3104, 0x3004, 0x3A01, 0xD1F9];

/// RAM layout during a stub run.
const STUB_LOAD: u32 = 0x2000_0000;
const STUB_BUFFER: u32 = 0x2000_0400;

pub(crate) fn probe(
    core: &mut CortexM,
    dp: &mut dyn DpAccess,
    _rom: &RomTable,
) -> Result<Option<TargetInfo>, Error> {
    // L0 first; its DBGMCU address reads as zero on other parts.
    let idcode_l0 = core.ap_mut().read_word_32(dp, DBGMCU_IDCODE_L0)? & 0xFFF;
    if dp.fault() {
        dp.error_clear()
            .map_err(crate::architecture::arm::ArmError::from)?;
    } else if let Some(info) = probe_l0(idcode_l0) {
        return Ok(Some(info));
    }

    let idcode_l1 = core.ap_mut().read_word_32(dp, DBGMCU_IDCODE_L1)? & 0xFFF;
    if dp.fault() {
        return Ok(None);
    }
    Ok(probe_l1(idcode_l1))
}

fn probe_l0(idcode: u32) -> Option<TargetInfo> {
    let (name, flash_size, ram_size, eeprom_size) = match idcode {
        0x457 => ("STM32L01x", 0x4000, 0x800, 0x200),
        0x425 => ("STM32L03x", 0x1_0000, 0x2000, 0x800),
        0x417 => ("STM32L05x", 0x1_0000, 0x2000, 0x800),
        0x447 => ("STM32L07x", 0x2_0000, 0x5000, 0x1800),
        _ => return None,
    };
    debug!("L0 DBGMCU_IDCODE {idcode:#05x}: {name}");

    // 128 byte pages, 64 byte half pages programmed through the stub.
    let flash_range = 0x0800_0000..0x0800_0000 + flash_size;
    let eeprom_range = 0x0808_0000..0x0808_0000 + eeprom_size;

    Some(TargetInfo {
        name: name.to_string(),
        part_id: idcode,
        memory_map: vec![
            MemoryRegion::Nvm(NvmRegion {
                range: flash_range.clone(),
                block_size: 0x80,
                is_boot_memory: true,
            }),
            MemoryRegion::Nvm(NvmRegion {
                range: eeprom_range.clone(),
                block_size: 4,
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
                    block_size: 0x80,
                    write_alignment: 4,
                    erased_byte_value: 0x00,
                    write_buffer_size: Some(0x40),
                    erase_block_timeout: 100,
                    program_timeout: 100,
                },
                Box::new(Stm32LxFlash {
                    regs: L0_NVM,
                    half_page: Some(HalfPage {
                        ram_top: 0x2000_0000 + ram_size,
                    }),
                }),
            ),
            FlashBank::new(
                NvmProperties {
                    address_range: eeprom_range,
                    block_size: 4,
                    write_alignment: 4,
                    erased_byte_value: 0x00,
                    write_buffer_size: None,
                    erase_block_timeout: 100,
                    program_timeout: 100,
                },
                Box::new(Stm32LxData { regs: L0_NVM }),
            ),
        ],
        commands: vec![MonitorCommand {
            name: "erase_mass",
            help: "Erase the entire flash",
            handler: cmd_erase_mass_l0,
        }],
    })
}

fn probe_l1(idcode: u32) -> Option<TargetInfo> {
    let (name, flash_size, ram_size, eeprom_size) = match idcode {
        0x416 => ("STM32L1xx category 1", 0x2_0000, 0x4000, 0x1000),
        0x429 => ("STM32L1xx category 2", 0x2_0000, 0x8000, 0x1000),
        0x427 => ("STM32L1xx category 3", 0x4_0000, 0x8000, 0x2000),
        0x436 => ("STM32L1xx category 4", 0x6_0000, 0xC000, 0x3000),
        0x437 => ("STM32L1xx category 5", 0x8_0000, 0x1_4000, 0x4000),
        _ => return None,
    };
    debug!("L1 DBGMCU_IDCODE {idcode:#05x}: {name}");

    let flash_range = 0x0800_0000..0x0800_0000 + flash_size;
    let eeprom_range = 0x0808_0000..0x0808_0000 + eeprom_size;

    Some(TargetInfo {
        name: name.to_string(),
        part_id: idcode,
        memory_map: vec![
            MemoryRegion::Nvm(NvmRegion {
                range: flash_range.clone(),
                block_size: 0x100,
                is_boot_memory: true,
            }),
            MemoryRegion::Nvm(NvmRegion {
                range: eeprom_range.clone(),
                block_size: 4,
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
                    block_size: 0x100,
                    write_alignment: 4,
                    erased_byte_value: 0x00,
                    write_buffer_size: None,
                    erase_block_timeout: 100,
                    program_timeout: 100,
                },
                Box::new(Stm32LxFlash {
                    regs: L1_NVM,
                    half_page: None,
                }),
            ),
            FlashBank::new(
                NvmProperties {
                    address_range: eeprom_range,
                    block_size: 4,
                    write_alignment: 4,
                    erased_byte_value: 0x00,
                    write_buffer_size: None,
                    erase_block_timeout: 100,
                    program_timeout: 100,
                },
                Box::new(Stm32LxData { regs: L1_NVM }),
            ),
        ],
        commands: vec![MonitorCommand {
            name: "erase_mass",
            help: "Erase the entire flash",
            handler: cmd_erase_mass_l1,
        }],
    })
}

fn unlock(access: &mut FlashAccess<'_>, regs: NvmRegs) -> Result<(), FlashError> {
    let pecr = Pecr(access.read_word_32(regs.pecr())?);
    if pecr.pelock() {
        access.write_word_32(regs.pekeyr(), PEKEY1)?;
        access.write_word_32(regs.pekeyr(), PEKEY2)?;
    }
    let pecr = Pecr(access.read_word_32(regs.pecr())?);
    if pecr.prglock() {
        access.write_word_32(regs.prgkeyr(), PRGKEY1)?;
        access.write_word_32(regs.prgkeyr(), PRGKEY2)?;
    }

    let pecr = Pecr(access.read_word_32(regs.pecr())?);
    if pecr.pelock() || pecr.prglock() {
        return Err(FlashError::Protected);
    }
    Ok(())
}

fn lock(access: &mut FlashAccess<'_>, regs: NvmRegs) -> Result<(), FlashError> {
    // Setting PELOCK relocks the whole interface.
    access.write_word_32(regs.pecr(), 1)?;
    Ok(())
}

fn wait_done(
    access: &mut FlashAccess<'_>,
    regs: NvmRegs,
    timeout_ms: u32,
    failure: FlashError,
) -> Result<(), FlashError> {
    let status = NvmSr(access.poll_status(
        regs.sr(),
        1, // BSY
        Duration::from_millis(u64::from(timeout_ms)),
    )?);

    // Clear the sticky bits (write-one-to-clear, EOP included).
    access.write_word_32(regs.sr(), status.0 & (NvmSr::ERROR_MASK | 1 << 1))?;

    if status.wrperr() {
        return Err(FlashError::Protected);
    }
    if status.0 & NvmSr::ERROR_MASK != 0 {
        return Err(failure);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct HalfPage {
    ram_top: u32,
}

/// The program flash of the L0/L1.
struct Stm32LxFlash {
    regs: NvmRegs,
    /// Half-page programming through the copy stub; `None` programs
    /// word by word.
    half_page: Option<HalfPage>,
}

impl FlashDriver for Stm32LxFlash {
    fn erase_block(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
    ) -> Result<(), FlashError> {
        unlock(access, self.regs)?;

        let mut pecr = Pecr(0);
        pecr.set_erase(true);
        pecr.set_prog(true);
        access.write_word_32(self.regs.pecr(), pecr.0)?;
        // Writing the first word of the page triggers the erase.
        access.write_word_32(address, 0)?;

        let result = wait_done(
            access,
            self.regs,
            props.erase_block_timeout,
            FlashError::EraseFailed { address },
        );
        access.write_word_32(self.regs.pecr(), 0)?;
        result
    }

    fn program(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        unlock(access, self.regs)?;

        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("aligned span")))
            .collect();

        let result = match self.half_page {
            Some(half_page) => {
                // FPRG half pages: stage the data in RAM, let the stub
                // stream it while the NVM is in half-page mode.
                let mut pecr = Pecr(0);
                pecr.set_fprg(true);
                pecr.set_prog(true);
                access.write_word_32(self.regs.pecr(), pecr.0)?;

                access.write_32(STUB_BUFFER, &words)?;
                let status = stub::run_stub(
                    access.core,
                    access.dp,
                    &stub_bytes(),
                    STUB_LOAD,
                    [address, STUB_BUFFER, words.len() as u32, self.regs.base],
                    half_page.ram_top,
                    Duration::from_millis(u64::from(props.program_timeout) * 10),
                )?;
                if status != 0 {
                    return Err(FlashError::Stub(status));
                }
                wait_done(
                    access,
                    self.regs,
                    props.program_timeout,
                    FlashError::ProgramFailed { address },
                )
            }
            None => {
                // Word programming needs no mode bits, just the unlock.
                access.write_word_32(self.regs.pecr(), 0)?;
                for (i, word) in words.iter().enumerate() {
                    access.write_word_32(address + 4 * i as u32, *word)?;
                    wait_done(
                        access,
                        self.regs,
                        props.program_timeout,
                        FlashError::ProgramFailed {
                            address: address + 4 * i as u32,
                        },
                    )?;
                }
                Ok(())
            }
        };

        let pecr_clear = access.write_word_32(self.regs.pecr(), 0);
        result.and(pecr_clear.map_err(FlashError::from))
    }

    fn done(
        &mut self,
        access: &mut FlashAccess<'_>,
        _props: &NvmProperties,
    ) -> Result<(), FlashError> {
        lock(access, self.regs)
    }
}

/// The data EEPROM region, programmed a word at a time.
struct Stm32LxData {
    regs: NvmRegs,
}

impl FlashDriver for Stm32LxData {
    fn erase_block(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
    ) -> Result<(), FlashError> {
        unlock(access, self.regs)?;

        let mut pecr = Pecr(0);
        pecr.set_erase(true);
        pecr.set_data(true);
        access.write_word_32(self.regs.pecr(), pecr.0)?;
        access.write_word_32(address, 0)?;

        let result = wait_done(
            access,
            self.regs,
            props.erase_block_timeout,
            FlashError::EraseFailed { address },
        );
        access.write_word_32(self.regs.pecr(), 0)?;
        result
    }

    fn program(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        unlock(access, self.regs)?;
        access.write_word_32(self.regs.pecr(), 0)?;

        for (i, chunk) in data.chunks_exact(4).enumerate() {
            let target = address + 4 * i as u32;
            let word = u32::from_le_bytes(chunk.try_into().expect("aligned span"));
            access.write_word_32(target, word)?;
            wait_done(
                access,
                self.regs,
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
        lock(access, self.regs)
    }
}

fn stub_bytes() -> Vec<u8> {
    COPY_STUB.iter().flat_map(|h| h.to_le_bytes()).collect()
}

/// The L0 mass erase needs an option byte reload (OBL_LAUNCH), which
/// drops the debug connection mid-sequence; there is no safe way to
/// drive it from the probe.
fn cmd_erase_mass_l0(
    _target: &mut Target,
    _dp: &mut dyn DpAccess,
    out: &mut dyn GdbOutput,
    _args: &[&str],
) -> Result<(), Error> {
    out.gdb_out("Mass erase is not supported on STM32L0: OBL_LAUNCH loses target contact\n");
    Err(Error::Flash(FlashError::NotImplemented(
        "STM32L0 mass erase",
    )))
}

/// The L1 has no single mass erase trigger either, but a full page-by-
/// page erase of the program flash is equivalent and keeps contact.
fn cmd_erase_mass_l1(
    target: &mut Target,
    dp: &mut dyn DpAccess,
    out: &mut dyn GdbOutput,
    _args: &[&str],
) -> Result<(), Error> {
    let Target { core, flash, .. } = target;
    let bank = &mut flash[0];
    let (start, end) = (
        bank.props.address_range.start,
        bank.props.address_range.end,
    );

    let mut access = FlashAccess { core, dp };
    bank.erase(&mut access, start, end - start)?;
    bank.done(&mut access)?;
    out.gdb_out("Mass erase complete\n");
    Ok(())
}
