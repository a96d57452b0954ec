//! Cortex-M run control.
//!
//! One [`CortexM`] drives one core behind a MEM-AP: halting and
//! resuming, the register file over DCRSR/DCRDR, hardware breakpoints
//! through the FPB, watchpoints through the DWT and local reset through
//! AIRCR. The register file is cached while the core is halted and
//! written back right before it runs again.

pub mod registers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use self::registers::{
    dwt_comp_address, dwt_function_address, dwt_mask_address, fp_comp_address, Aircr, Cpuid, Dcrdr,
    Dcrsr, Demcr, Dfsr, Dhcsr, DwtCtrl, DwtFunction, FpCtrl, FpRev1CompX, FpRev2CompX, Mvfr0,
};
use crate::architecture::arm::ap::MemoryAp;
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::{ArmError, MemoryMappedRegister};

/// The Thumb encoding of `BKPT 0x00`, planted for software breakpoints.
pub const BKPT_INSTRUCTION: u16 = 0xBE00;

/// Register selectors for the DCRSR, shared with the GDB register
/// numbering for the core set.
pub mod regsel {
    /// Stack pointer.
    pub const SP: u16 = 13;
    /// Link register.
    pub const LR: u16 = 14;
    /// Debug return address; the program counter while halted.
    pub const PC: u16 = 15;
    /// Combined program status registers.
    pub const XPSR: u16 = 16;
    /// Main stack pointer.
    pub const MSP: u16 = 17;
    /// Process stack pointer.
    pub const PSP: u16 = 18;
    /// Packed CONTROL/FAULTMASK/BASEPRI/PRIMASK word.
    pub const CONTROL: u16 = 20;
    /// Floating point status and control register.
    pub const FPSCR: u16 = 33;

    /// Selector of the `n`-th single precision register.
    pub fn s(n: u16) -> u16 {
        64 + n
    }
}

/// Why a halted core stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// An external halt request.
    Request,
    /// A hardware breakpoint or a BKPT instruction.
    Breakpoint,
    /// A DWT comparator fired; carries the comparator index when it
    /// could be attributed.
    Watchpoint(Option<usize>),
    /// A vector catch, usually the reset vector.
    VectorCatch,
    /// A single step completed.
    Step,
    /// The halt reason could not be determined.
    Unknown,
}

/// The run state of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    /// No debug session is active on this core.
    Detached,
    /// The core is executing.
    Running,
    /// The core is in Debug state.
    Halted(HaltReason),
    /// The core is locked up on an unrecoverable exception.
    LockedUp,
}

impl CoreStatus {
    /// Whether the core is in Debug state.
    pub fn is_halted(&self) -> bool {
        matches!(self, CoreStatus::Halted(_))
    }
}

/// The kind of a breakpoint or watchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakwatchKind {
    /// Hardware execution breakpoint in the FPB.
    Breakpoint,
    /// Software breakpoint patched into memory.
    SoftBreakpoint,
    /// Watch for reads.
    ReadWatch,
    /// Watch for writes.
    WriteWatch,
    /// Watch for any access.
    AccessWatch,
}

/// Where a breakwatch lives in hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Fpb(usize),
    Dwt(usize),
    Software { original: u16 },
}

/// A breakpoint or watchpoint owned by the target.
#[derive(Debug, Clone, Copy)]
pub struct Breakwatch {
    /// What kind of break or watch this is.
    pub kind: BreakwatchKind,
    /// The watched address.
    pub address: u32,
    /// Access size in bytes for watchpoints.
    pub size: u8,
    slot: Slot,
}

/// Register cache indices: r0-r12, sp, lr, pc, xPSR, MSP, PSP, CONTROL,
/// then FPSCR and s0-s31 when an FPU is present.
const CORE_CACHE_SLOTS: usize = 20;
const FP_CACHE_SLOTS: usize = 33;

#[derive(Debug)]
struct RegisterCache {
    values: Vec<u32>,
    dirty: Vec<bool>,
    valid: bool,
}

impl RegisterCache {
    fn new(fp_present: bool) -> Self {
        let len = CORE_CACHE_SLOTS + if fp_present { FP_CACHE_SLOTS } else { 0 };
        RegisterCache {
            values: vec![0; len],
            dirty: vec![false; len],
            valid: false,
        }
    }
}

/// Run control for one Cortex-M core.
#[derive(Debug)]
pub struct CortexM {
    ap: MemoryAp,
    status: CoreStatus,
    fpb_rev: u8,
    num_breakpoints: usize,
    num_watchpoints: usize,
    fp_present: bool,
    has_vectreset: bool,
    breakwatches: Vec<Breakwatch>,
    cache: RegisterCache,
    interrupt: Arc<AtomicBool>,
}

impl CortexM {
    /// Wrap a MEM-AP; nothing is touched until [`CortexM::attach`].
    ///
    /// `interrupt` is the host break flag: raising it while the
    /// controller waits for a halt injects a halt request.
    pub fn new(ap: MemoryAp, interrupt: Arc<AtomicBool>) -> Self {
        CortexM {
            ap,
            status: CoreStatus::Detached,
            fpb_rev: 0,
            num_breakpoints: 0,
            num_watchpoints: 0,
            fp_present: false,
            has_vectreset: false,
            breakwatches: Vec::new(),
            cache: RegisterCache::new(false),
            interrupt,
        }
    }

    /// The MEM-AP the core sits behind.
    pub fn ap_mut(&mut self) -> &mut MemoryAp {
        &mut self.ap
    }

    /// The current (cached) run state; [`CortexM::poll_halt`] refreshes it.
    pub fn status(&self) -> CoreStatus {
        self.status
    }

    /// Number of hardware breakpoint comparators.
    pub fn available_breakpoint_units(&self) -> usize {
        self.num_breakpoints
    }

    /// Number of watchpoint comparators.
    pub fn available_watchpoint_units(&self) -> usize {
        self.num_watchpoints
    }

    /// Whether the core has a floating point unit.
    pub fn fpu_present(&self) -> bool {
        self.fp_present
    }

    /// Take control of the core.
    ///
    /// Halts it, requests a local reset with the reset vector catch
    /// armed, waits for the catch to land, then discovers and clears the
    /// FPB and DWT comparators and takes the first register snapshot.
    pub fn attach(&mut self, dp: &mut dyn DpAccess) -> Result<(), ArmError> {
        let cpuid = Cpuid::from(self.ap.read_word_32(dp, Cpuid::ADDRESS)?);
        self.has_vectreset = cpuid.is_armv7m();
        debug!(
            "Attaching to core: CPUID = {:#010x} (partno {:#05x})",
            u32::from(cpuid),
            cpuid.partno()
        );

        // Catch the reset vector so the core never runs off without us.
        let mut demcr = Demcr::from(0);
        demcr.set_trcena(true);
        demcr.set_vc_corereset(true);
        self.ap.write_word_32(dp, Demcr::ADDRESS, demcr.into())?;

        self.halt_request(dp)?;

        // The wire may legitimately stall while the reset happens.
        dp.set_allow_timeout(true);
        self.reset_request(dp)?;
        let halted = self.wait_for_halt(dp, Duration::from_millis(1000));
        dp.set_allow_timeout(false);
        halted?;

        let fp_ctrl = FpCtrl::from(self.ap.read_word_32(dp, FpCtrl::ADDRESS)?);
        self.fpb_rev = fp_ctrl.rev();
        self.num_breakpoints = fp_ctrl.num_code() as usize;
        for slot in 0..self.num_breakpoints {
            self.ap.write_word_32(dp, fp_comp_address(slot), 0)?;
        }
        let mut enable = FpCtrl::from(0);
        enable.set_key(true);
        enable.set_enable(true);
        self.ap.write_word_32(dp, FpCtrl::ADDRESS, enable.into())?;

        let dwt_ctrl = DwtCtrl::from(self.ap.read_word_32(dp, DwtCtrl::ADDRESS)?);
        self.num_watchpoints = dwt_ctrl.num_comp() as usize;
        for slot in 0..self.num_watchpoints {
            self.ap.write_word_32(dp, dwt_function_address(slot), 0)?;
        }

        debug!(
            "FPB rev {} with {} comparators, DWT with {} comparators",
            self.fpb_rev + 1,
            self.num_breakpoints,
            self.num_watchpoints
        );

        self.ap
            .write_word_32(dp, Dfsr::ADDRESS, Dfsr::clear_all().into())?;

        self.fp_present = Mvfr0::from(self.ap.read_word_32(dp, Mvfr0::ADDRESS)?).fp_present();
        self.cache = RegisterCache::new(self.fp_present);
        self.refresh_cache(dp)?;

        self.status = CoreStatus::Halted(HaltReason::Request);
        Ok(())
    }

    /// Give the core back: remove every breakpoint and watchpoint, drop
    /// the vector catch and let it run.
    pub fn detach(&mut self, dp: &mut dyn DpAccess) -> Result<(), ArmError> {
        self.clear_all_breakwatches(dp)?;
        self.ap.write_word_32(dp, Demcr::ADDRESS, 0)?;
        if self.status.is_halted() {
            self.resume(dp)?;
        }
        self.status = CoreStatus::Detached;
        Ok(())
    }

    /// Ask the core to halt; does not wait.
    pub fn halt_request(&mut self, dp: &mut dyn DpAccess) -> Result<(), ArmError> {
        let mut dhcsr = Dhcsr::from(0);
        dhcsr.set_c_halt(true);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.ap.write_word_32(dp, Dhcsr::ADDRESS, dhcsr.into())
    }

    /// Halt the core and wait for it.
    pub fn halt(&mut self, dp: &mut dyn DpAccess, timeout: Duration) -> Result<(), ArmError> {
        self.halt_request(dp)?;
        self.wait_for_halt(dp, timeout)?;
        self.poll_halt(dp)?;
        Ok(())
    }

    /// Sample the run state and, on a fresh halt, classify it from DFSR.
    ///
    /// The sticky DFSR bits are cleared after reading, so the reason of
    /// a given halt is reported exactly once; later polls return the
    /// cached status.
    pub fn poll_halt(&mut self, dp: &mut dyn DpAccess) -> Result<CoreStatus, ArmError> {
        let dhcsr = Dhcsr::from(self.ap.read_word_32(dp, Dhcsr::ADDRESS)?);

        if dhcsr.s_lockup() {
            warn!("Core is locked up on an unrecoverable exception");
            self.status = CoreStatus::LockedUp;
            return Ok(self.status);
        }

        if !dhcsr.s_halt() {
            if self.status.is_halted() {
                warn!("Core is running but was expected to be halted");
                self.cache.valid = false;
            }
            self.status = CoreStatus::Running;
            return Ok(self.status);
        }

        let dfsr = Dfsr::from(self.ap.read_word_32(dp, Dfsr::ADDRESS)?);
        self.ap
            .write_word_32(dp, Dfsr::ADDRESS, Dfsr::clear_all().into())?;

        let mut reason = dfsr.halt_reason();
        if let HaltReason::Watchpoint(_) = reason {
            reason = HaltReason::Watchpoint(self.matched_watchpoint(dp)?);
        }

        if self.status.is_halted() && reason == HaltReason::Unknown {
            // Nothing new latched; this is still the halt we reported.
            return Ok(self.status);
        }

        if !self.status.is_halted() {
            self.refresh_cache(dp)?;
        }

        trace!("Core halted: {:?}", reason);
        self.status = CoreStatus::Halted(reason);
        Ok(self.status)
    }

    /// The DWT comparator whose MATCHED bit is set, if any.
    fn matched_watchpoint(&mut self, dp: &mut dyn DpAccess) -> Result<Option<usize>, ArmError> {
        for slot in 0..self.num_watchpoints {
            let function =
                DwtFunction::from(self.ap.read_word_32(dp, dwt_function_address(slot))?);
            if function.matched() {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// The breakwatch record owning a DWT comparator.
    pub fn breakwatch_for_comparator(&self, comparator: usize) -> Option<&Breakwatch> {
        self.breakwatches
            .iter()
            .find(|b| b.slot == Slot::Dwt(comparator))
    }

    /// Release the core, writing back any registers debug clobbered.
    pub fn resume(&mut self, dp: &mut dyn DpAccess) -> Result<(), ArmError> {
        self.flush_cache(dp)?;

        let mut dhcsr = Dhcsr::from(0);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.ap.write_word_32(dp, Dhcsr::ADDRESS, dhcsr.into())?;

        self.cache.valid = false;
        self.status = CoreStatus::Running;
        Ok(())
    }

    /// Execute a single instruction and halt again.
    ///
    /// Returns the program counter after the step.
    pub fn step(&mut self, dp: &mut dyn DpAccess) -> Result<u32, ArmError> {
        if !self.status.is_halted() {
            return Err(ArmError::CoreNotHalted);
        }

        self.flush_cache(dp)?;

        // C_MASKINTS keeps a pending interrupt from hijacking the step;
        // it must change while C_HALT is still set.
        let mut dhcsr = Dhcsr::from(0);
        dhcsr.set_c_halt(true);
        dhcsr.set_c_maskints(true);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.ap.write_word_32(dp, Dhcsr::ADDRESS, dhcsr.into())?;

        let mut dhcsr = Dhcsr::from(0);
        dhcsr.set_c_step(true);
        dhcsr.set_c_maskints(true);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.ap.write_word_32(dp, Dhcsr::ADDRESS, dhcsr.into())?;

        self.wait_for_halt(dp, Duration::from_millis(100))?;

        // Drop the interrupt mask again while halted.
        let mut dhcsr = Dhcsr::from(0);
        dhcsr.set_c_halt(true);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.ap.write_word_32(dp, Dhcsr::ADDRESS, dhcsr.into())?;

        self.ap
            .write_word_32(dp, Dfsr::ADDRESS, Dfsr::clear_all().into())?;

        self.cache.valid = false;
        self.refresh_cache(dp)?;
        self.status = CoreStatus::Halted(HaltReason::Step);

        self.read_core_reg(dp, regsel::PC)
    }

    /// Busy-wait for S_HALT.
    ///
    /// A raised host break flag injects a halt request so a runaway
    /// target cannot hang the probe.
    pub fn wait_for_halt(
        &mut self,
        dp: &mut dyn DpAccess,
        timeout: Duration,
    ) -> Result<(), ArmError> {
        let start = Instant::now();

        loop {
            let dhcsr = Dhcsr::from(self.ap.read_word_32(dp, Dhcsr::ADDRESS)?);
            if dhcsr.s_halt() {
                return Ok(());
            }
            if self.interrupt.swap(false, Ordering::Relaxed) {
                debug!("Host break: injecting halt request");
                self.halt_request(dp)?;
            }
            if start.elapsed() >= timeout {
                return Err(ArmError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Request a local reset: VECTRESET where the core implements it,
    /// SYSRESETREQ otherwise.
    pub fn reset_request(&mut self, dp: &mut dyn DpAccess) -> Result<(), ArmError> {
        let mut aircr = Aircr::from(0);
        aircr.vectkey();
        if self.has_vectreset {
            aircr.set_vectreset(true);
        } else {
            aircr.set_sysresetreq(true);
        }
        self.ap.write_word_32(dp, Aircr::ADDRESS, aircr.into())
    }

    /// Reset and run to the reset vector catch.
    pub fn reset_and_halt(&mut self, dp: &mut dyn DpAccess) -> Result<(), ArmError> {
        let mut demcr = Demcr::from(self.ap.read_word_32(dp, Demcr::ADDRESS)?);
        demcr.set_vc_corereset(true);
        self.ap.write_word_32(dp, Demcr::ADDRESS, demcr.into())?;

        dp.set_allow_timeout(true);
        self.reset_request(dp)?;
        let halted = self.wait_for_halt(dp, Duration::from_millis(1000));
        dp.set_allow_timeout(false);
        halted?;

        self.cache.valid = false;
        self.poll_halt(dp)?;
        Ok(())
    }

    /// Read a core register, from the cache while halted.
    pub fn read_core_reg(&mut self, dp: &mut dyn DpAccess, sel: u16) -> Result<u32, ArmError> {
        if self.cache.valid {
            if let Some(slot) = self.cache_slot(sel) {
                return Ok(self.cache.values[slot]);
            }
        }
        if !self.status.is_halted() {
            return Err(ArmError::CoreNotHalted);
        }
        self.hw_read_reg(dp, sel)
    }

    /// Write a core register. Cached writes reach the hardware before
    /// the core next runs.
    pub fn write_core_reg(
        &mut self,
        dp: &mut dyn DpAccess,
        sel: u16,
        value: u32,
    ) -> Result<(), ArmError> {
        if !self.status.is_halted() {
            return Err(ArmError::CoreNotHalted);
        }
        if self.cache.valid {
            if let Some(slot) = self.cache_slot(sel) {
                self.cache.values[slot] = value;
                self.cache.dirty[slot] = true;
                return Ok(());
            }
        }
        self.hw_write_reg(dp, sel, value)
    }

    /// The register bank a `g` reply is built from: r0-r12, sp, lr, pc
    /// and xPSR.
    pub fn read_general_regs(&mut self, dp: &mut dyn DpAccess) -> Result<[u32; 17], ArmError> {
        let mut regs = [0; 17];
        for (sel, value) in regs.iter_mut().enumerate() {
            *value = self.read_core_reg(dp, sel as u16)?;
        }
        Ok(regs)
    }

    fn cache_slot(&self, sel: u16) -> Option<usize> {
        match sel {
            0..=18 => Some(sel as usize),
            regsel::CONTROL => Some(19),
            regsel::FPSCR if self.fp_present => Some(20),
            64..=95 if self.fp_present => Some(21 + (sel - 64) as usize),
            _ => None,
        }
    }

    fn cached_selectors(&self) -> Vec<u16> {
        let mut sels: Vec<u16> = (0..=18).chain([regsel::CONTROL]).collect();
        if self.fp_present {
            sels.push(regsel::FPSCR);
            sels.extend((0..32).map(regsel::s));
        }
        sels
    }

    fn refresh_cache(&mut self, dp: &mut dyn DpAccess) -> Result<(), ArmError> {
        for sel in self.cached_selectors() {
            let slot = self.cache_slot(sel).expect("selector is cached");
            self.cache.values[slot] = self.hw_read_reg(dp, sel)?;
            self.cache.dirty[slot] = false;
        }
        self.cache.valid = true;
        Ok(())
    }

    fn flush_cache(&mut self, dp: &mut dyn DpAccess) -> Result<(), ArmError> {
        if !self.cache.valid {
            return Ok(());
        }
        for sel in self.cached_selectors() {
            let slot = self.cache_slot(sel).expect("selector is cached");
            if self.cache.dirty[slot] {
                let value = self.cache.values[slot];
                self.hw_write_reg(dp, sel, value)?;
                self.cache.dirty[slot] = false;
            }
        }
        Ok(())
    }

    /// Select the register and poll S_REGRDY, then move the data.
    fn hw_read_reg(&mut self, dp: &mut dyn DpAccess, sel: u16) -> Result<u32, ArmError> {
        let mut dcrsr = Dcrsr::from(0);
        dcrsr.set_regwnr(false);
        dcrsr.set_regsel(u32::from(sel));
        self.ap.write_word_32(dp, Dcrsr::ADDRESS, dcrsr.into())?;

        self.wait_for_reg_transfer(dp, Duration::from_millis(100))?;

        self.ap.read_word_32(dp, Dcrdr::ADDRESS)
    }

    fn hw_write_reg(
        &mut self,
        dp: &mut dyn DpAccess,
        sel: u16,
        value: u32,
    ) -> Result<(), ArmError> {
        self.ap.write_word_32(dp, Dcrdr::ADDRESS, value)?;

        let mut dcrsr = Dcrsr::from(0);
        dcrsr.set_regwnr(true);
        dcrsr.set_regsel(u32::from(sel));
        self.ap.write_word_32(dp, Dcrsr::ADDRESS, dcrsr.into())?;

        self.wait_for_reg_transfer(dp, Duration::from_millis(100))
    }

    fn wait_for_reg_transfer(
        &mut self,
        dp: &mut dyn DpAccess,
        timeout: Duration,
    ) -> Result<(), ArmError> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let dhcsr = Dhcsr::from(self.ap.read_word_32(dp, Dhcsr::ADDRESS)?);
            if dhcsr.s_regrdy() {
                return Ok(());
            }
        }
        Err(ArmError::Timeout)
    }

    /// All breakwatches currently installed.
    pub fn breakwatches(&self) -> &[Breakwatch] {
        &self.breakwatches
    }

    /// Install a breakpoint or watchpoint.
    pub fn set_breakwatch(
        &mut self,
        dp: &mut dyn DpAccess,
        kind: BreakwatchKind,
        address: u32,
        size: u8,
    ) -> Result<(), ArmError> {
        let slot = match kind {
            BreakwatchKind::Breakpoint => {
                let slot = self.free_fpb_slot()?;
                let value = if self.fpb_rev == 0 {
                    FpRev1CompX::breakpoint_configuration(address)?.into()
                } else {
                    FpRev2CompX::breakpoint_configuration(address).into()
                };
                self.ap.write_word_32(dp, fp_comp_address(slot), value)?;
                Slot::Fpb(slot)
            }
            BreakwatchKind::SoftBreakpoint => {
                let original = self.ap.read_word_16(dp, address)?;
                self.ap.write_word_16(dp, address, BKPT_INSTRUCTION)?;
                Slot::Software { original }
            }
            BreakwatchKind::ReadWatch
            | BreakwatchKind::WriteWatch
            | BreakwatchKind::AccessWatch => {
                let slot = self.free_dwt_slot()?;
                let mask = match size {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    other => return Err(ArmError::UnsupportedWatchpointSize(other)),
                };
                let mut function = DwtFunction::from(0);
                function.set_function(match kind {
                    BreakwatchKind::ReadWatch => 5,
                    BreakwatchKind::WriteWatch => 6,
                    _ => 7,
                });

                self.ap.write_word_32(dp, dwt_comp_address(slot), address)?;
                self.ap.write_word_32(dp, dwt_mask_address(slot), mask)?;
                self.ap
                    .write_word_32(dp, dwt_function_address(slot), function.into())?;
                Slot::Dwt(slot)
            }
        };

        self.breakwatches.push(Breakwatch {
            kind,
            address,
            size,
            slot,
        });
        Ok(())
    }

    /// Remove a breakpoint or watchpoint previously installed with the
    /// same kind and address.
    pub fn clear_breakwatch(
        &mut self,
        dp: &mut dyn DpAccess,
        kind: BreakwatchKind,
        address: u32,
    ) -> Result<(), ArmError> {
        let index = self
            .breakwatches
            .iter()
            .position(|b| b.kind == kind && b.address == address)
            .ok_or(ArmError::BreakwatchNotFound(address))?;

        let breakwatch = self.breakwatches.remove(index);
        self.uninstall(dp, &breakwatch)
    }

    fn uninstall(
        &mut self,
        dp: &mut dyn DpAccess,
        breakwatch: &Breakwatch,
    ) -> Result<(), ArmError> {
        match breakwatch.slot {
            Slot::Fpb(slot) => self.ap.write_word_32(dp, fp_comp_address(slot), 0),
            Slot::Dwt(slot) => self.ap.write_word_32(dp, dwt_function_address(slot), 0),
            Slot::Software { original } => {
                self.ap.write_word_16(dp, breakwatch.address, original)
            }
        }
    }

    fn clear_all_breakwatches(&mut self, dp: &mut dyn DpAccess) -> Result<(), ArmError> {
        for breakwatch in std::mem::take(&mut self.breakwatches) {
            self.uninstall(dp, &breakwatch)?;
        }
        Ok(())
    }

    fn free_fpb_slot(&self) -> Result<usize, ArmError> {
        (0..self.num_breakpoints)
            .find(|slot| {
                !self
                    .breakwatches
                    .iter()
                    .any(|b| b.slot == Slot::Fpb(*slot))
            })
            .ok_or(ArmError::NoBreakpointSlots)
    }

    fn free_dwt_slot(&self) -> Result<usize, ArmError> {
        (0..self.num_watchpoints)
            .find(|slot| {
                !self
                    .breakwatches
                    .iter()
                    .any(|b| b.slot == Slot::Dwt(*slot))
            })
            .ok_or(ArmError::NoWatchpointSlots)
    }
}

#[cfg(test)]
mod test {
    use super::registers::{dwt_function_address, dwt_mask_address, fp_comp_address};
    use super::*;
    use crate::architecture::arm::ap::mock::MockDap;
    use crate::architecture::arm::ap::{GenericAp, IDR};

    fn attached(dap: &mut MockDap) -> CortexM {
        let idr = IDR::from(dap.idr);
        let ap = MemoryAp::new(dap, GenericAp { apsel: 0, idr }).unwrap();
        let mut core = CortexM::new(ap, Arc::new(AtomicBool::new(false)));
        core.attach(dap).unwrap();
        core
    }

    #[test]
    fn attach_halts_and_discovers_comparators() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let core = attached(&mut dap);

        assert!(dap.halted());
        assert_eq!(core.status(), CoreStatus::Halted(HaltReason::Request));
        assert_eq!(core.available_breakpoint_units(), 6);
        assert_eq!(core.available_watchpoint_units(), 4);
        assert!(!core.fpu_present());
    }

    #[test]
    fn single_step_advances_pc_by_instruction_length() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        let pc = core.read_core_reg(&mut dap, regsel::PC).unwrap();
        let pc_after_one = core.step(&mut dap).unwrap();
        let pc_after_two = core.step(&mut dap).unwrap();

        assert_eq!(pc_after_one, pc + 2);
        assert_eq!(pc_after_two, pc + 4);
        assert_eq!(dap.steps, 2);
        assert_eq!(core.status(), CoreStatus::Halted(HaltReason::Step));
    }

    #[test]
    fn breakpoint_slots_are_finite() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        for i in 0..6 {
            core.set_breakwatch(&mut dap, BreakwatchKind::Breakpoint, 0x100 + i * 4, 2)
                .unwrap();
        }
        assert!(matches!(
            core.set_breakwatch(&mut dap, BreakwatchKind::Breakpoint, 0x200, 2),
            Err(ArmError::NoBreakpointSlots)
        ));

        // Clearing one frees its comparator for reuse.
        core.clear_breakwatch(&mut dap, BreakwatchKind::Breakpoint, 0x100)
            .unwrap();
        core.set_breakwatch(&mut dap, BreakwatchKind::Breakpoint, 0x200, 2)
            .unwrap();
        assert_eq!(dap.reg(fp_comp_address(0)) & 1, 1);
    }

    #[test]
    fn fpb_rev1_encoding_reaches_the_comparator() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        core.set_breakwatch(&mut dap, BreakwatchKind::Breakpoint, 0x0800_09A4, 2)
            .unwrap();
        assert_eq!(dap.reg(fp_comp_address(0)), 0x4800_09A5);

        // Version 1 comparators cannot reach SRAM.
        assert!(matches!(
            core.set_breakwatch(&mut dap, BreakwatchKind::Breakpoint, 0x2000_0100, 2),
            Err(ArmError::UnsupportedBreakpointAddress(_))
        ));
    }

    #[test]
    fn soft_breakpoint_patches_and_restores_memory() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        let address = 0x2000_0010;
        core.ap_mut()
            .write_word_16(&mut dap, address, 0x4770) // BX LR
            .unwrap();
        core.set_breakwatch(&mut dap, BreakwatchKind::SoftBreakpoint, address, 2)
            .unwrap();
        assert_eq!(
            core.ap_mut().read_word_16(&mut dap, address).unwrap(),
            BKPT_INSTRUCTION
        );

        core.clear_breakwatch(&mut dap, BreakwatchKind::SoftBreakpoint, address)
            .unwrap();
        assert_eq!(
            core.ap_mut().read_word_16(&mut dap, address).unwrap(),
            0x4770
        );
    }

    #[test]
    fn watchpoint_function_and_mask_encoding() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        core.set_breakwatch(&mut dap, BreakwatchKind::ReadWatch, 0x2000_0040, 1)
            .unwrap();
        core.set_breakwatch(&mut dap, BreakwatchKind::WriteWatch, 0x2000_0044, 2)
            .unwrap();
        core.set_breakwatch(&mut dap, BreakwatchKind::AccessWatch, 0x2000_0048, 4)
            .unwrap();

        assert_eq!(dap.reg(dwt_function_address(0)) & 0xF, 5);
        assert_eq!(dap.reg(dwt_mask_address(0)), 0);
        assert_eq!(dap.reg(dwt_function_address(1)) & 0xF, 6);
        assert_eq!(dap.reg(dwt_mask_address(1)), 1);
        assert_eq!(dap.reg(dwt_function_address(2)) & 0xF, 7);
        assert_eq!(dap.reg(dwt_mask_address(2)), 2);

        assert!(matches!(
            core.set_breakwatch(&mut dap, BreakwatchKind::ReadWatch, 0x2000_0050, 8),
            Err(ArmError::UnsupportedWatchpointSize(8))
        ));
    }

    #[test]
    fn watchpoint_hit_is_attributed_to_its_comparator() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        core.set_breakwatch(&mut dap, BreakwatchKind::WriteWatch, 0x2000_0044, 4)
            .unwrap();
        core.resume(&mut dap).unwrap();

        // The store lands, DWT comparator 0 fires.
        dap.dwt_matched = Some(0);
        dap.halt_with(1 << 2);

        let status = core.poll_halt(&mut dap).unwrap();
        assert_eq!(status, CoreStatus::Halted(HaltReason::Watchpoint(Some(0))));

        let hit = core.breakwatch_for_comparator(0).unwrap();
        assert_eq!(hit.kind, BreakwatchKind::WriteWatch);
        assert_eq!(hit.address, 0x2000_0044);
    }

    #[test]
    fn register_writes_are_cached_and_flushed_on_resume() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        core.write_core_reg(&mut dap, regsel::PC, 0x0800_0101).unwrap();
        // Not on the wire yet.
        assert_ne!(dap.regbank[15], 0x0800_0101);

        core.resume(&mut dap).unwrap();
        assert_eq!(dap.regbank[15], 0x0800_0101);
        assert_eq!(core.status(), CoreStatus::Running);
    }

    #[test]
    fn halt_classification_clears_dfsr() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);
        core.resume(&mut dap).unwrap();

        dap.halt_with(1 << 1); // BKPT
        assert_eq!(
            core.poll_halt(&mut dap).unwrap(),
            CoreStatus::Halted(HaltReason::Breakpoint)
        );

        // The sticky bits were cleared; the cached reason persists.
        assert_eq!(
            core.poll_halt(&mut dap).unwrap(),
            CoreStatus::Halted(HaltReason::Breakpoint)
        );
    }

    #[test]
    fn detach_removes_breakwatches_and_resumes() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        core.set_breakwatch(&mut dap, BreakwatchKind::Breakpoint, 0x100, 2)
            .unwrap();
        core.detach(&mut dap).unwrap();

        assert_eq!(dap.reg(fp_comp_address(0)), 0);
        assert!(!dap.halted());
        assert_eq!(core.status(), CoreStatus::Detached);
        assert!(core.breakwatches().is_empty());
    }

    #[test]
    fn host_break_injects_halt_during_wait() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let interrupt = Arc::new(AtomicBool::new(false));

        let idr = IDR::from(dap.idr);
        let ap = MemoryAp::new(&mut dap, GenericAp { apsel: 0, idr }).unwrap();
        let mut core = CortexM::new(ap, interrupt.clone());
        core.attach(&mut dap).unwrap();
        core.resume(&mut dap).unwrap();

        interrupt.store(true, Ordering::Relaxed);
        core.wait_for_halt(&mut dap, Duration::from_millis(100))
            .unwrap();
        assert!(dap.halted());
    }
}
