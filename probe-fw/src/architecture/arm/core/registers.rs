//! Cortex-M debug register definitions.
//!
//! Addresses and bit assignments follow the ARMv7-M Architecture
//! Reference Manual, C1 "System Debug". Everything is expressed as a
//! [`bitfield!`] over the raw word plus a [`MemoryMappedRegister`]
//! address binding.

use bitfield::bitfield;

use super::HaltReason;
use crate::architecture::arm::{ArmError, MemoryMappedRegister};

bitfield! {
    /// Debug Halting Control and Status Register, DHCSR.
    ///
    /// To write this register successfully the debug key has to be placed
    /// in the upper half word via [`Dhcsr::enable_write`] first.
    #[derive(Copy, Clone)]
    pub struct Dhcsr(u32);
    impl Debug;
    /// At least one reset happened since the last read. Clears on read.
    pub s_reset_st, _: 25;
    /// An instruction retired since the last read. Clears on read.
    pub s_retire_st, _: 24;
    /// The processor is locked up on an unrecoverable exception.
    pub s_lockup, _: 19;
    /// The processor is sleeping.
    pub s_sleep, _: 18;
    /// The processor is in Debug state.
    pub s_halt, _: 17;
    /// Handshake flag for DCRSR/DCRDR transfers: a write to DCRSR clears
    /// it, completion of the transfer sets it.
    pub s_regrdy, _: 16;
    /// Mask PendSV, SysTick and external configurable interrupts while
    /// stepping. Must only change together with a halt request.
    pub c_maskints, set_c_maskints: 3;
    /// Single-step enable.
    pub c_step, set_c_step: 2;
    /// Halt request.
    pub c_halt, set_c_halt: 1;
    /// Halting debug enable. Writable from the DAP only.
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Place the debug key; without it the hardware ignores the write.
    pub fn enable_write(&mut self) {
        self.0 &= !(0xffff << 16);
        self.0 |= 0xa05f << 16;
    }
}

impl From<u32> for Dhcsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dhcsr> for u32 {
    fn from(value: Dhcsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dhcsr {
    const ADDRESS: u32 = 0xE000_EDF0;
    const NAME: &'static str = "DHCSR";
}

bitfield! {
    /// Debug Core Register Selector Register, DCRSR.
    #[derive(Copy, Clone)]
    pub struct Dcrsr(u32);
    impl Debug;
    pub _, set_regwnr: 16;
    pub _, set_regsel: 6, 0;
}

impl From<u32> for Dcrsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcrsr> for u32 {
    fn from(value: Dcrsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dcrsr {
    const ADDRESS: u32 = 0xE000_EDF4;
    const NAME: &'static str = "DCRSR";
}

/// Debug Core Register Data Register, DCRDR.
#[derive(Debug, Copy, Clone)]
pub struct Dcrdr(pub u32);

impl From<u32> for Dcrdr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcrdr> for u32 {
    fn from(value: Dcrdr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dcrdr {
    const ADDRESS: u32 = 0xE000_EDF8;
    const NAME: &'static str = "DCRDR";
}

bitfield! {
    /// Debug Fault Status Register, DFSR.
    ///
    /// All bits are sticky and write-one-to-clear.
    #[derive(Copy, Clone)]
    pub struct Dfsr(u32);
    impl Debug;
    /// An external debug request halted the core.
    pub external, set_external: 4;
    /// A vector catch triggered.
    pub vcatch, set_vcatch: 3;
    /// The DWT generated a debug event.
    pub dwttrap, set_dwttrap: 2;
    /// A breakpoint halted the core: an FPB match or a BKPT instruction.
    pub bkpt, set_bkpt: 1;
    /// Halt request or single-step completion.
    pub halted, set_halted: 0;
}

impl Dfsr {
    /// A value that clears every sticky bit when written back.
    pub fn clear_all() -> Self {
        Dfsr(0b11111)
    }

    /// Classify the halt. Only meaningful right after a halt, before the
    /// sticky bits are cleared.
    pub fn halt_reason(&self) -> HaltReason {
        if self.bkpt() {
            HaltReason::Breakpoint
        } else if self.dwttrap() {
            HaltReason::Watchpoint(None)
        } else if self.vcatch() {
            HaltReason::VectorCatch
        } else if self.external() {
            HaltReason::Request
        } else if self.halted() {
            HaltReason::Step
        } else {
            HaltReason::Unknown
        }
    }
}

impl From<u32> for Dfsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dfsr> for u32 {
    fn from(value: Dfsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dfsr {
    const ADDRESS: u32 = 0xE000_ED30;
    const NAME: &'static str = "DFSR";
}

bitfield! {
    /// Debug Exception and Monitor Control Register, DEMCR.
    #[derive(Copy, Clone)]
    pub struct Demcr(u32);
    impl Debug;
    /// Global enable for the DWT and ITM features.
    pub trcena, set_trcena: 24;
    /// Enable halting debug trap on a HardFault exception.
    pub vc_harderr, set_vc_harderr: 10;
    /// Enable Reset Vector Catch.
    pub vc_corereset, set_vc_corereset: 0;
}

impl From<u32> for Demcr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Demcr> for u32 {
    fn from(value: Demcr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Demcr {
    const ADDRESS: u32 = 0xE000_EDFC;
    const NAME: &'static str = "DEMCR";
}

bitfield! {
    /// Application Interrupt and Reset Control Register, AIRCR.
    ///
    /// [`Aircr::vectkey`] must be called before the register is written.
    #[derive(Copy, Clone)]
    pub struct Aircr(u32);
    impl Debug;
    get_vectkeystat, set_vectkey: 31, 16;
    /// Request a system level reset.
    pub sysresetreq, set_sysresetreq: 2;
    /// Request a local core reset. Not implemented on ARMv6-M; writing it
    /// there is UNPREDICTABLE.
    pub vectreset, set_vectreset: 0;
}

impl Aircr {
    /// Place the key that arms the register for writing.
    pub fn vectkey(&mut self) {
        self.set_vectkey(0x05FA);
    }

    /// Whether the key reads back as accepted.
    pub fn vectkeystat(&self) -> bool {
        self.get_vectkeystat() == 0xFA05
    }
}

impl From<u32> for Aircr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Aircr> for u32 {
    fn from(value: Aircr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Aircr {
    const ADDRESS: u32 = 0xE000_ED0C;
    const NAME: &'static str = "AIRCR";
}

bitfield! {
    /// CPUID base register.
    #[derive(Copy, Clone)]
    pub struct Cpuid(u32);
    impl Debug;
    pub u8, implementer, _: 31, 24;
    pub u8, architecture, _: 19, 16;
    pub u16, partno, _: 15, 4;
}

impl Cpuid {
    /// Whether the core implements ARMv7-M, and with it the local
    /// VECTRESET.
    pub fn is_armv7m(&self) -> bool {
        self.architecture() == 0xF
    }
}

impl From<u32> for Cpuid {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Cpuid> for u32 {
    fn from(value: Cpuid) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Cpuid {
    const ADDRESS: u32 = 0xE000_ED00;
    const NAME: &'static str = "CPUID";
}

bitfield! {
    /// Media and VFP Feature Register 0.
    #[derive(Copy, Clone)]
    pub struct Mvfr0(u32);
    impl Debug;
    pub fpdp, _: 11, 8;
    pub fpsp, _: 7, 4;
}

impl Mvfr0 {
    pub fn fp_present(&self) -> bool {
        self.fpdp() != 0 || self.fpsp() != 0
    }
}

impl From<u32> for Mvfr0 {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Mvfr0> for u32 {
    fn from(value: Mvfr0) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Mvfr0 {
    const ADDRESS: u32 = 0xE000_EF40;
    const NAME: &'static str = "MVFR0";
}

bitfield! {
    /// Flash Patch Control Register, FP_CTRL.
    #[derive(Copy, Clone)]
    pub struct FpCtrl(u32);
    impl Debug;
    /// Flash Patch breakpoint architecture revision: 0 for version 1,
    /// 1 for version 2 which supports comparators anywhere in the 4 GiB
    /// range.
    pub u8, rev, _: 31, 28;
    num_code_1, _: 14, 12;
    pub u8, num_lit, _: 11, 8;
    num_code_0, _: 7, 4;
    /// Must be written as one for the write to take effect.
    pub _, set_key: 1;
    /// Enable bit for the FPB.
    pub enable, set_enable: 0;
}

impl FpCtrl {
    /// The number of instruction address comparators.
    pub fn num_code(&self) -> u32 {
        (self.num_code_1() << 4) | self.num_code_0()
    }
}

impl From<u32> for FpCtrl {
    fn from(value: u32) -> Self {
        FpCtrl(value)
    }
}

impl From<FpCtrl> for u32 {
    fn from(value: FpCtrl) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for FpCtrl {
    const ADDRESS: u32 = 0xE000_2000;
    const NAME: &'static str = "FP_CTRL";
}

bitfield! {
    /// Flash Patch Comparator register for FPB version 1.
    #[derive(Copy, Clone)]
    pub struct FpRev1CompX(u32);
    impl Debug;
    /// Which half word of the compared word address breaks: `01` the
    /// lower, `10` the upper, `11` both.
    pub u8, replace, set_replace: 31, 30;
    /// Bits \[28:2\] of the comparison address. The upper three address
    /// bits are zero, limiting version 1 to the code region.
    pub comp, set_comp: 28, 2;
    pub enable, set_enable: 0;
}

impl FpRev1CompX {
    /// The comparator configuration for a breakpoint at `address`.
    pub fn breakpoint_configuration(address: u32) -> Result<Self, ArmError> {
        if address >= 0x2000_0000 {
            return Err(ArmError::UnsupportedBreakpointAddress(address));
        }

        let mut reg = FpRev1CompX(0);
        reg.set_comp((address & 0x1FFF_FFFC) >> 2);
        // Bit 1 of the address selects the upper half word.
        reg.set_replace(if address & 0x2 == 0 { 0b01 } else { 0b10 });
        reg.set_enable(true);
        Ok(reg)
    }

    /// The breakpointed address encoded in the comparator.
    pub fn address(&self) -> u32 {
        let base = self.comp() << 2;
        if self.replace() == 0b10 {
            base | 0x2
        } else {
            base
        }
    }
}

impl From<u32> for FpRev1CompX {
    fn from(value: u32) -> Self {
        FpRev1CompX(value)
    }
}

impl From<FpRev1CompX> for u32 {
    fn from(value: FpRev1CompX) -> Self {
        value.0
    }
}

bitfield! {
    /// Flash Patch Comparator register for FPB version 2.
    #[derive(Copy, Clone)]
    pub struct FpRev2CompX(u32);
    impl Debug;
    /// Breakpoint address bits \[31:1\].
    pub bpaddr, set_bpaddr: 31, 1;
    pub enable, set_enable: 0;
}

impl FpRev2CompX {
    /// The comparator configuration for a breakpoint at `address`.
    pub fn breakpoint_configuration(address: u32) -> Self {
        let mut reg = FpRev2CompX(0);
        reg.set_bpaddr(address >> 1);
        reg.set_enable(true);
        reg
    }
}

impl From<u32> for FpRev2CompX {
    fn from(value: u32) -> Self {
        FpRev2CompX(value)
    }
}

impl From<FpRev2CompX> for u32 {
    fn from(value: FpRev2CompX) -> Self {
        value.0
    }
}

/// Base address of the FP_COMPn register block.
pub const FP_COMP_BASE: u32 = 0xE000_2008;

/// Address of the `n`-th Flash Patch comparator.
pub fn fp_comp_address(n: usize) -> u32 {
    FP_COMP_BASE + 4 * n as u32
}

bitfield! {
    /// DWT Control Register.
    #[derive(Copy, Clone)]
    pub struct DwtCtrl(u32);
    impl Debug;
    /// The number of comparators implemented.
    pub u8, num_comp, _: 31, 28;
    pub cyccntena, set_cyccntena: 0;
}

impl From<u32> for DwtCtrl {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<DwtCtrl> for u32 {
    fn from(value: DwtCtrl) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for DwtCtrl {
    const ADDRESS: u32 = 0xE000_1000;
    const NAME: &'static str = "DWT_CTRL";
}

bitfield! {
    /// A DWT comparator FUNCTION register.
    #[derive(Copy, Clone)]
    pub struct DwtFunction(u32);
    impl Debug;
    /// The comparator matched since the last read. Clears on read.
    pub matched, _: 24;
    /// What the comparator does: 5 watches reads, 6 watches writes,
    /// 7 watches both.
    pub u8, function, set_function: 3, 0;
}

impl From<u32> for DwtFunction {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<DwtFunction> for u32 {
    fn from(value: DwtFunction) -> Self {
        value.0
    }
}

/// Base of the DWT comparator register block; COMP, MASK and FUNCTION
/// repeat with a stride of 16 bytes.
const DWT_COMP_BASE: u32 = 0xE000_1020;

/// Address of the `n`-th DWT comparator value register.
pub fn dwt_comp_address(n: usize) -> u32 {
    DWT_COMP_BASE + 16 * n as u32
}

/// Address of the `n`-th DWT mask register.
pub fn dwt_mask_address(n: usize) -> u32 {
    DWT_COMP_BASE + 4 + 16 * n as u32
}

/// Address of the `n`-th DWT function register.
pub fn dwt_function_address(n: usize) -> u32 {
    DWT_COMP_BASE + 8 + 16 * n as u32
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test]
    fn fpb_rev1_breakpoint_register_value() {
        // See ARMv7-M Architecture Reference Manual, C1.11.5.
        let reg = FpRev1CompX::breakpoint_configuration(0x0800_09A4).unwrap();
        assert_eq!(u32::from(reg), 0x4800_09A5);
        assert_eq!(reg.address(), 0x0800_09A4);

        let reg = FpRev1CompX::breakpoint_configuration(0x0800_09A6).unwrap();
        assert_eq!(reg.replace(), 0b10);
        assert_eq!(reg.address(), 0x0800_09A6);
    }

    #[test]
    fn fpb_rev1_rejects_addresses_above_code_region() {
        assert!(FpRev1CompX::breakpoint_configuration(0x2000_0000).is_err());
    }

    #[test]
    fn fpb_rev2_uses_the_full_address() {
        let reg = FpRev2CompX::breakpoint_configuration(0x2040_0400);
        assert_eq!(u32::from(reg), 0x2040_0401);
    }

    #[test_case(1 << 4, HaltReason::Request ; "external request")]
    #[test_case(1 << 3, HaltReason::VectorCatch ; "vector catch")]
    #[test_case(1 << 2, HaltReason::Watchpoint(None) ; "dwt trap")]
    #[test_case(1 << 1, HaltReason::Breakpoint ; "bkpt")]
    #[test_case(1 << 0, HaltReason::Step ; "step complete")]
    #[test_case(0, HaltReason::Unknown ; "nothing latched")]
    fn dfsr_classification(raw: u32, expected: HaltReason) {
        assert_eq!(Dfsr(raw).halt_reason(), expected);
    }

    #[test]
    fn dhcsr_debug_key() {
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_halt(true);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        assert_eq!(u32::from(dhcsr), 0xA05F_0003);
    }
}
