//! The debug session: one wire, one Debug Port, the attached targets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::architecture::arm::ap::{scan_aps, MemoryAp};
use crate::architecture::arm::core::{BreakwatchKind, CoreStatus, CortexM};
use crate::architecture::arm::dp::jtag::JtagDp;
use crate::architecture::arm::dp::swd::SwDp;
use crate::architecture::arm::dp::{power_up, DpAccess};
use crate::architecture::arm::memory::{PeripheralType, RomTable};
use crate::architecture::arm::ArmError;
use crate::error::Error;
use crate::gdb::{self, GdbOutput};
use crate::probe::{JtagSequence, SwdSequence, WireProtocol};
use crate::targets::{self, Target};

/// An active debug session.
///
/// Owns the Debug Port, the list of attached targets and the host break
/// flag. Exactly one target is current at any time; the RSP dispatcher
/// calls the operations below against it.
pub struct Session {
    dp: Box<dyn DpAccess>,
    protocol: WireProtocol,
    targets: Vec<Target>,
    current: usize,
    interrupt: Arc<AtomicBool>,
}

impl Session {
    /// Connect over SWD, power the debug domain up and attach to every
    /// recognized device.
    pub fn swd_scan<W: SwdSequence + 'static>(wire: W) -> Result<Self, Error> {
        let dp = SwDp::connect(wire)?;
        info!("SW-DP IDCODE: {:#010x}", dp.idcode());
        Self::discover(Box::new(dp), WireProtocol::Swd)
    }

    /// Connect over JTAG and attach to every recognized device.
    pub fn jtag_scan<W: JtagSequence + 'static>(wire: W) -> Result<Self, Error> {
        let dp = JtagDp::connect(wire)?;
        info!("JTAG-DP IDCODE: {:#010x}", dp.idcode());
        Self::discover(Box::new(dp), WireProtocol::Jtag)
    }

    /// Shared discovery: enumerate APs, walk ROM tables, attach cores
    /// and dispatch the family probes.
    fn discover(mut dp: Box<dyn DpAccess>, protocol: WireProtocol) -> Result<Self, Error> {
        power_up(dp.as_mut())?;

        let interrupt = Arc::new(AtomicBool::new(false));
        let mut targets = Vec::new();

        for generic in scan_aps(dp.as_mut())? {
            if !generic.is_memory_ap() {
                continue;
            }

            let mut ap = MemoryAp::new(dp.as_mut(), generic)?;
            let rom = match RomTable::parse(dp.as_mut(), &mut ap) {
                Ok(rom) => rom,
                Err(error) => {
                    warn!("AP {}: ROM table walk failed: {error}", ap.apsel());
                    if dp.fault() {
                        dp.error_clear().map_err(ArmError::from)?;
                    }
                    continue;
                }
            };

            if rom.find(PeripheralType::Scs).is_none() {
                debug!("AP {}: no Cortex-M system control space", ap.apsel());
                continue;
            }

            let mut core = CortexM::new(ap, interrupt.clone());
            core.attach(dp.as_mut())?;

            match targets::probe_all(core, dp.as_mut(), &rom)? {
                Some(target) => {
                    info!("Attached: {}", target.name);
                    targets.push(target);
                }
                None => warn!("Cortex-M found, but no family probe matched"),
            }
        }

        if targets.is_empty() {
            return Err(Error::NoTargets);
        }

        Ok(Session {
            dp,
            protocol,
            targets,
            current: 0,
            interrupt,
        })
    }

    /// The wire protocol this session was opened with.
    pub fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    /// The attached targets' names, in attach order.
    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name.as_str()).collect()
    }

    /// Make the `index`-th target current.
    pub fn select_target(&mut self, index: usize) -> Result<(), Error> {
        if index >= self.targets.len() {
            return Err(Error::TargetNotFound(index));
        }
        self.current = index;
        Ok(())
    }

    /// The current target.
    pub fn target(&self) -> &Target {
        &self.targets[self.current]
    }

    fn parts(&mut self) -> (&mut Target, &mut dyn DpAccess) {
        (&mut self.targets[self.current], self.dp.as_mut())
    }

    /// Signal a host break (`Ctrl-C`); honored at the next safe point.
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// Whether a sticky DP fault is latched. Reports once and runs the
    /// error-clear cycle, so a subsequent call starts clean.
    pub fn check_error(&mut self) -> Result<bool, Error> {
        let faulted = self.dp.fault();
        if faulted {
            warn!("Sticky debug port fault latched, clearing");
            self.dp.error_clear().map_err(ArmError::from)?;
        }
        Ok(faulted)
    }

    /// Read target memory (the `m` packet).
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.read_memory(dp, address, data)
    }

    /// Write target memory (the `M` packet).
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.write_memory(dp, address, data)
    }

    /// The general register bank (the `g` packet).
    pub fn read_registers(&mut self) -> Result<[u32; 17], Error> {
        let (target, dp) = self.parts();
        Ok(target.core.read_general_regs(dp)?)
    }

    /// One register by its GDB number.
    pub fn read_register(&mut self, number: u16) -> Result<u32, Error> {
        let (target, dp) = self.parts();
        Ok(target.core.read_core_reg(dp, number)?)
    }

    /// Write one register by its GDB number.
    pub fn write_register(&mut self, number: u16, value: u32) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.core.write_core_reg(dp, number, value)?;
        Ok(())
    }

    /// Halt the current target.
    pub fn halt(&mut self) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.core.halt(dp, Duration::from_millis(1000))?;
        Ok(())
    }

    /// Resume the current target (the `c` packet).
    pub fn resume(&mut self) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.core.resume(dp)?;
        Ok(())
    }

    /// Single step (the `s` packet); returns the new program counter.
    pub fn step(&mut self) -> Result<u32, Error> {
        let (target, dp) = self.parts();
        Ok(target.core.step(dp)?)
    }

    /// Sample the run state, classifying a fresh halt.
    pub fn poll_halt(&mut self) -> Result<CoreStatus, Error> {
        let (target, dp) = self.parts();
        Ok(target.core.poll_halt(dp)?)
    }

    /// Reset the current target and leave it halted at the reset vector.
    pub fn reset_and_halt(&mut self) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.core.reset_and_halt(dp)?;
        Ok(())
    }

    /// Install a breakpoint or watchpoint (the `Z` packet).
    pub fn set_breakwatch(
        &mut self,
        kind: BreakwatchKind,
        address: u32,
        size: u8,
    ) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.set_breakwatch(dp, kind, address, size)
    }

    /// Remove a breakpoint or watchpoint (the `z` packet).
    pub fn clear_breakwatch(&mut self, kind: BreakwatchKind, address: u32) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.clear_breakwatch(dp, kind, address)
    }

    /// Erase a flash range (the `vFlashErase` packet).
    pub fn flash_erase(&mut self, address: u32, length: u32) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.flash_erase(dp, address, length)?;
        Ok(())
    }

    /// Buffer a flash write (the `vFlashWrite` packet).
    pub fn flash_write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.flash_write(dp, address, data)?;
        Ok(())
    }

    /// Commit pending flash writes (the `vFlashDone` packet).
    pub fn flash_done(&mut self) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.flash_done(dp)?;
        Ok(())
    }

    /// Dispatch a `monitor` command line.
    pub fn monitor(&mut self, line: &str, out: &mut dyn GdbOutput) -> Result<(), Error> {
        let (target, dp) = self.parts();
        target.monitor(dp, out, line)
    }

    /// The memory map XML served for `qXfer:memory-map:read::`.
    pub fn memory_map_xml(&mut self) -> Result<String, Error> {
        Ok(gdb::memory_map_xml(self.target()))
    }

    /// Detach from every target and let them run.
    pub fn detach(&mut self) -> Result<(), Error> {
        for target in &mut self.targets {
            target.core.detach(self.dp.as_mut())?;
        }
        self.targets.clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::arm::ap::mock::MockDap;
    use crate::gdb::BufferedOutput;
    use pretty_assertions::assert_eq;

    /// Install a component identification block at `base`.
    fn install_component(dap: &mut MockDap, base: u32, class: u32, part: u16) {
        dap.set_reg(base + 0xFF0, 0x0D);
        dap.set_reg(base + 0xFF4, class << 4);
        dap.set_reg(base + 0xFF8, 0x05);
        dap.set_reg(base + 0xFFC, 0xB1);

        // An ARM-designed part: JEP106 id 0x3B, continuation 4.
        let pidr = u64::from(part) | 0x3B_u64 << 12 | 1_u64 << 19 | 4_u64 << 32;
        for i in 0..4 {
            dap.set_reg(base + 0xFE0 + i * 4, (pidr >> (i * 8) & 0xFF) as u32);
            dap.set_reg(base + 0xFD0 + i * 4, (pidr >> (32 + i * 8) & 0xFF) as u32);
        }
    }

    /// A mock wired up to look like an STM32F103: ROM table with an SCS
    /// entry, medium density DBGMCU identification.
    fn f103_dap() -> MockDap {
        let mut dap = MockDap::new(0x2000_0000, 0x5000);
        let rom = 0xE00F_F000;

        install_component(&mut dap, rom, 1, 0x4C3);
        dap.set_reg(rom, 0xFFF0_F003); // SCS at 0xE000E000
        install_component(&mut dap, rom.wrapping_add(0xFFF0_F000), 0xE, 0x000);

        dap.set_reg(0xE004_2000, 0x2000_6410);
        dap
    }

    #[test]
    fn discovery_attaches_an_stm32f103() {
        let session = Session::discover(Box::new(f103_dap()), WireProtocol::Swd).unwrap();
        assert_eq!(session.target_names(), vec!["STM32F103 medium density"]);
        assert_eq!(session.target().part_id, 0x410);
        assert_eq!(session.protocol(), WireProtocol::Swd);
    }

    #[test]
    fn memory_map_xml_matches_the_f103_layout() {
        let mut session = Session::discover(Box::new(f103_dap()), WireProtocol::Swd).unwrap();
        let xml = session.memory_map_xml().unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\"?>"));
        assert!(xml.contains(
            "<memory type=\"flash\" start=\"0x8000000\" length=\"0x20000\">\
             <property name=\"blocksize\">0x400</property></memory>"
        ));
        assert!(xml.contains("<memory type=\"ram\" start=\"0x20000000\" length=\"0x5000\"/>"));
    }

    #[test]
    fn discovery_without_known_silicon_reports_no_targets() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let rom = 0xE00F_F000;
        install_component(&mut dap, rom, 1, 0x4C3);
        dap.set_reg(rom, 0xFFF0_F003);
        install_component(&mut dap, rom.wrapping_add(0xFFF0_F000), 0xE, 0x000);
        // No family identification registers respond.

        assert!(matches!(
            Session::discover(Box::new(dap), WireProtocol::Swd),
            Err(Error::NoTargets)
        ));
    }

    #[test]
    fn session_operations_reach_the_target() {
        let mut session = Session::discover(Box::new(f103_dap()), WireProtocol::Swd).unwrap();

        // The core attached halted; registers and memory are reachable.
        assert!(session.poll_halt().unwrap().is_halted());
        session.write_memory(0x2000_0100, &[1, 2, 3, 4]).unwrap();
        let mut back = [0u8; 4];
        session.read_memory(0x2000_0100, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4]);

        session.write_register(0, 0x42).unwrap();
        assert_eq!(session.read_register(0).unwrap(), 0x42);

        let regs = session.read_registers().unwrap();
        assert_eq!(regs[0], 0x42);

        // An unknown monitor command is rejected with its name.
        let mut out = BufferedOutput::default();
        assert!(matches!(
            session.monitor("frobnicate", &mut out),
            Err(Error::UnknownMonitorCommand(name)) if name == "frobnicate"
        ));

        session.detach().unwrap();
        assert!(session.target_names().is_empty());
    }
}
