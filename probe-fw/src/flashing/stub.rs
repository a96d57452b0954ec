//! On-target stub execution.
//!
//! Some families program an order of magnitude faster from code running
//! on the target itself. The runner copies a small machine code blob
//! into target RAM, points the core at it with the arguments in r0-r3,
//! runs it to the trailing `BKPT` and hands back r0. The caller's
//! register file is stashed first and restored afterwards, so run
//! control state survives the excursion.

use std::time::Duration;

use tracing::debug;

use super::FlashError;
use crate::architecture::arm::core::{regsel, BreakwatchKind, CortexM, BKPT_INSTRUCTION};
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::ArmError;

/// Registers stashed around a stub run: r0-r12, sp, lr, pc, xPSR.
const STASHED: u16 = 17;

/// The xPSR value a stub starts with: just the Thumb state bit.
const XPSR_THUMB: u32 = 1 << 24;

/// Copy `stub` to `load_address` in target RAM, run it with `args` in
/// r0-r3 and wait for its trailing `BKPT`.
///
/// The stack pointer is placed at `stack_top` rounded down to 8 bytes;
/// the link register points back at the entry so a stray return also
/// lands on the breakpoint. Returns r0 at the halt; family drivers
/// interpret it together with their status registers.
///
/// A host break during the wait injects a halt request; the run then
/// fails with [`FlashError::Stub`] carrying the partial result.
pub fn run_stub(
    core: &mut CortexM,
    dp: &mut dyn DpAccess,
    stub: &[u8],
    load_address: u32,
    args: [u32; 4],
    stack_top: u32,
    timeout: Duration,
) -> Result<u32, FlashError> {
    let mut saved = [0u32; STASHED as usize];
    for (sel, value) in saved.iter_mut().enumerate() {
        *value = core.read_core_reg(dp, sel as u16)?;
    }

    core.ap_mut().write_8(dp, load_address, stub)?;
    // The blob must arrive intact; a partial copy would run wild.
    let mut read_back = vec![0u8; stub.len()];
    core.ap_mut().read_8(dp, load_address, &mut read_back)?;
    if read_back != stub {
        return Err(FlashError::StubLoad);
    }

    // The trailing breakpoint the stub falls into when done.
    let bkpt_address = load_address + stub.len() as u32;
    core.ap_mut()
        .write_word_16(dp, bkpt_address, BKPT_INSTRUCTION)?;
    let hw_breakpoint = match core.set_breakwatch(dp, BreakwatchKind::Breakpoint, bkpt_address, 2)
    {
        Ok(()) => true,
        // FPBv1 comparators cannot reach RAM; the planted BKPT still
        // halts the core.
        Err(ArmError::UnsupportedBreakpointAddress(_)) => false,
        Err(error) => return Err(error.into()),
    };

    for (i, arg) in args.iter().enumerate() {
        core.write_core_reg(dp, i as u16, *arg)?;
    }
    core.write_core_reg(dp, regsel::SP, stack_top & !7)?;
    core.write_core_reg(dp, regsel::LR, load_address | 1)?;
    core.write_core_reg(dp, regsel::PC, load_address | 1)?;
    core.write_core_reg(dp, regsel::XPSR, XPSR_THUMB)?;

    debug!(
        "Running stub at {load_address:#010x} ({} bytes), args {args:x?}",
        stub.len()
    );

    core.resume(dp)?;
    let waited = core.wait_for_halt(dp, timeout);
    if waited.is_err() {
        // Last resort: drag the core back so we can restore it.
        core.halt(dp, Duration::from_millis(100))?;
    }
    core.poll_halt(dp)?;

    let result = core.read_core_reg(dp, 0)?;

    if hw_breakpoint {
        core.clear_breakwatch(dp, BreakwatchKind::Breakpoint, bkpt_address)?;
    }
    for (sel, value) in saved.iter().enumerate() {
        core.write_core_reg(dp, sel as u16, *value)?;
    }

    waited?;
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::arm::ap::mock::{MockDap, ResumeBehavior};
    use crate::architecture::arm::ap::{GenericAp, MemoryAp, IDR};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn attached(dap: &mut MockDap) -> CortexM {
        let idr = IDR::from(dap.idr);
        let ap = MemoryAp::new(dap, GenericAp { apsel: 0, idr }).unwrap();
        let mut core = CortexM::new(ap, Arc::new(AtomicBool::new(false)));
        core.attach(dap).unwrap();
        core
    }

    #[test]
    fn stub_runs_and_register_file_is_restored() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        // Seed a recognizable register file.
        for sel in 0..13 {
            core.write_core_reg(&mut dap, sel, 0x1000 + u32::from(sel))
                .unwrap();
        }
        core.write_core_reg(&mut dap, regsel::PC, 0x0800_0400).unwrap();
        core.resume(&mut dap).unwrap();
        core.halt(&mut dap, Duration::from_millis(100)).unwrap();

        // The "stub" finishes at its breakpoint with r0 = 0.
        dap.resume_behavior = ResumeBehavior::HaltWith {
            dfsr: 1 << 1,
            set_regs: vec![(0, 0)],
        };

        let stub = [0x00u8, 0xBF, 0x00, 0xBF]; // two NOPs
        let result = run_stub(
            &mut core,
            &mut dap,
            &stub,
            0x2000_0000,
            [0x0800_0000, 0x2000_0400, 64, 0],
            0x2000_1000,
            Duration::from_millis(100),
        )
        .unwrap();
        assert_eq!(result, 0);

        // The blob and its trailing BKPT reached RAM.
        assert_eq!(&dap.ram[0..4], &stub);
        assert_eq!(
            u16::from_le_bytes(dap.ram[4..6].try_into().unwrap()),
            BKPT_INSTRUCTION
        );

        // The register file is back, on the wire, after the next resume.
        for sel in 0..13 {
            assert_eq!(
                core.read_core_reg(&mut dap, sel).unwrap(),
                0x1000 + u32::from(sel)
            );
        }
        assert_eq!(
            core.read_core_reg(&mut dap, regsel::PC).unwrap(),
            0x0800_0400
        );
        assert!(core.status().is_halted());
    }

    #[test]
    fn stub_arguments_reach_the_core() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        dap.resume_behavior = ResumeBehavior::HaltWith {
            dfsr: 1 << 1,
            set_regs: vec![],
        };

        run_stub(
            &mut core,
            &mut dap,
            &[0x00, 0xBF],
            0x2000_0100,
            [1, 2, 3, 4],
            0x2000_0FF4,
            Duration::from_millis(100),
        )
        .unwrap();

        // The mock applied the resume with the argument registers
        // already flushed; r1-r3 survived the stub run unchanged.
        assert_eq!(dap.regbank[1], 2);
        assert_eq!(dap.regbank[2], 3);
        assert_eq!(dap.regbank[3], 4);
        // sp was rounded down to 8 bytes.
        assert_eq!(dap.regbank[13], 0x2000_0FF0);
        // pc and lr both carry the Thumb bit.
        assert_eq!(dap.regbank[15], 0x2000_0101);
        assert_eq!(dap.regbank[14], 0x2000_0101);
    }

    #[test]
    fn timeout_halts_and_reports() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut core = attached(&mut dap);

        // The stub never reaches its breakpoint.
        dap.resume_behavior = ResumeBehavior::Run;

        let result = run_stub(
            &mut core,
            &mut dap,
            &[0x00, 0xBF],
            0x2000_0100,
            [0; 4],
            0x2000_1000,
            Duration::from_millis(10),
        );
        assert!(matches!(result, Err(FlashError::Arm(ArmError::Timeout))));
        // The core was dragged back under control.
        assert!(dap.halted());
        assert!(core.status().is_halted());
    }
}
