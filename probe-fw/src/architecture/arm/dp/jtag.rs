//! The JTAG Debug Port engine.
//!
//! DPACC and APACC are 35-bit shift registers: `RnW` in bit 0, `A[3:2]`
//! in bits 2:1 and the data word in bits 34:3. A captured shift carries
//! `ACK[2:0]` in the low bits and the data of the *previous* transaction
//! above it, so every read is followed by an RDBUFF read that drains the
//! pipeline.

use tracing::{debug, trace, warn};

use super::{
    abort_clear_mask, Ctrl, DebugPortId, DpAccess, RdBuff, Select, DPIDR, WAIT_RETRIES,
};
use crate::architecture::arm::{ArmError, DapError, PortType, Register};
use crate::probe::JtagSequence;

/// JTAG-DP instruction register values.
const IR_ABORT: u64 = 0x8;
const IR_DPACC: u64 = 0xA;
const IR_APACC: u64 = 0xB;
/// ARM JTAG-DP instruction registers are 4 bits long.
const IR_LENGTH: u8 = 4;
/// DPACC/APACC data registers are 35 bits long.
const DR_LENGTH: u8 = 35;

/// JTAG acknowledge codes. Unlike SWD there is no FAULT code on the wire;
/// OK and FAULT share an encoding and faults surface as sticky bits in
/// CTRL/STAT.
const JTAG_ACK_WAIT: u64 = 0b001;
const JTAG_ACK_OK: u64 = 0b010;

/// A Debug Port driven over the scan chain.
#[derive(Debug)]
pub struct JtagDp<W: JtagSequence> {
    wire: W,
    idcode: u32,
    fault: bool,
    allow_timeout: bool,
    select: Option<u32>,
    current_ir: Option<u64>,
}

impl<W: JtagSequence> JtagDp<W> {
    /// Reset the TAP controller and read the identification code.
    pub fn connect(wire: W) -> Result<Self, ArmError> {
        let mut dp = JtagDp {
            wire,
            idcode: 0,
            fault: false,
            allow_timeout: false,
            select: None,
            current_ir: None,
        };

        // Five TMS ones reach Test-Logic-Reset from any state, one zero
        // drops into Run-Test/Idle. The reset also preloads IDCODE into
        // the DR path.
        dp.wire.tms_seq(0x1F, 6);
        dp.idcode = dp.shift_dr(0, 32) as u32;
        debug!(
            "JTAG-DP connected: {:x?}",
            DebugPortId::from(DPIDR(dp.idcode))
        );

        dp.error_clear()?;

        Ok(dp)
    }

    /// Release the wire.
    pub fn release(self) -> W {
        self.wire
    }

    fn write_ir(&mut self, ir: u64) {
        if self.current_ir == Some(ir) {
            return;
        }
        // Run-Test/Idle -> Shift-IR, shift with exit, Update-IR -> idle.
        self.wire.tms_seq(0b0011, 4);
        self.wire.shift(ir, IR_LENGTH, true);
        self.wire.tms_seq(0b01, 2);
        self.current_ir = Some(ir);
    }

    fn shift_dr(&mut self, data: u64, cycles: u8) -> u64 {
        // Run-Test/Idle -> Shift-DR, shift with exit, Update-DR -> idle.
        self.wire.tms_seq(0b001, 3);
        let captured = self.wire.shift(data, cycles, true);
        self.wire.tms_seq(0b01, 2);
        captured
    }

    /// One DPACC/APACC scan, retried on WAIT.
    ///
    /// The returned word is the result of the *previous* transaction.
    fn raw_transfer(
        &mut self,
        port: PortType,
        rnw: bool,
        addr: u8,
        value: u32,
    ) -> Result<u32, DapError> {
        let ir = match port {
            PortType::DebugPort => IR_DPACC,
            PortType::AccessPort => IR_APACC,
        };

        let mut payload = u64::from(value) << 3;
        payload |= u64::from(addr & 0x0C) >> 1;
        payload |= u64::from(rnw);

        self.write_ir(ir);

        for _ in 0..WAIT_RETRIES {
            let captured = self.shift_dr(payload, DR_LENGTH);
            match captured & 0b111 {
                JTAG_ACK_OK => {
                    let result = (captured >> 3) as u32;
                    trace!("JTAG {:?} {:#x} = {:#010x}", port, addr, result);
                    return Ok(result);
                }
                JTAG_ACK_WAIT => continue,
                ack => {
                    warn!("JTAG {:?} {:#x}: protocol error, ACK = {:#05b}", port, addr, ack);
                    return Err(DapError::NoAcknowledge);
                }
            }
        }

        if self.allow_timeout {
            trace!("JTAG {:?} {:#x}: WAIT retries exhausted, allowed", port, addr);
            Ok(0)
        } else {
            Err(DapError::WaitRetriesExceeded)
        }
    }

    fn select_ap_bank(&mut self, ap: u8, addr: u8) -> Result<(), DapError> {
        let mut select = Select(0);
        select.set_ap_sel(ap);
        select.set_ap_bank_sel(addr >> 4);
        let select = u32::from(select);

        if self.select != Some(select) {
            self.raw_transfer(PortType::DebugPort, false, Select::ADDRESS, select)?;
            self.select = Some(select);
        }

        Ok(())
    }

    /// OK/FAULT share an ACK code, so an AP batch is followed by a
    /// CTRL/STAT inspection; a latched sticky error zeroes the batch
    /// result just like a FAULT response does on SWD.
    fn check_sticky(&mut self) -> Result<bool, DapError> {
        self.raw_transfer(PortType::DebugPort, true, Ctrl::ADDRESS, 0)?;
        let ctrl = Ctrl(self.raw_transfer(PortType::DebugPort, true, RdBuff::ADDRESS, 0)?);
        if ctrl.sticky_err() || ctrl.w_data_err() {
            warn!("JTAG transaction faulted, CTRL/STAT = {:#010x}", u32::from(ctrl));
            self.fault = true;
            return Ok(true);
        }
        Ok(false)
    }
}

impl<W: JtagSequence> DpAccess for JtagDp<W> {
    fn read_dp(&mut self, addr: u8) -> Result<u32, DapError> {
        self.raw_transfer(PortType::DebugPort, true, addr, 0)?;
        self.raw_transfer(PortType::DebugPort, true, RdBuff::ADDRESS, 0)
    }

    fn write_dp(&mut self, addr: u8, value: u32) -> Result<(), DapError> {
        if addr == Select::ADDRESS {
            self.select = Some(value);
        }
        self.raw_transfer(PortType::DebugPort, false, addr, value)
            .map(|_| ())
    }

    fn read_ap(&mut self, ap: u8, addr: u8) -> Result<u32, DapError> {
        let mut values = [0];
        self.read_ap_repeated(ap, addr, &mut values)?;
        Ok(values[0])
    }

    fn write_ap(&mut self, ap: u8, addr: u8, value: u32) -> Result<(), DapError> {
        self.write_ap_repeated(ap, addr, &[value])
    }

    fn read_ap_repeated(&mut self, ap: u8, addr: u8, values: &mut [u32]) -> Result<(), DapError> {
        if values.is_empty() {
            return Ok(());
        }
        if self.fault {
            values.fill(0);
            return Ok(());
        }
        self.select_ap_bank(ap, addr)?;

        // Results trail by one transaction.
        self.raw_transfer(PortType::AccessPort, true, addr, 0)?;
        let (last, head) = values.split_last_mut().expect("checked non-empty");
        for value in head {
            *value = self.raw_transfer(PortType::AccessPort, true, addr, 0)?;
        }
        *last = self.raw_transfer(PortType::DebugPort, true, RdBuff::ADDRESS, 0)?;

        if self.check_sticky()? {
            values.fill(0);
        }
        Ok(())
    }

    fn write_ap_repeated(&mut self, ap: u8, addr: u8, values: &[u32]) -> Result<(), DapError> {
        if self.fault {
            return Ok(());
        }
        self.select_ap_bank(ap, addr)?;

        for &value in values {
            self.raw_transfer(PortType::AccessPort, false, addr, value)?;
        }
        self.check_sticky()?;
        Ok(())
    }

    fn error_clear(&mut self) -> Result<(), DapError> {
        let ctrl = Ctrl(self.read_dp(Ctrl::ADDRESS)?);
        let abort = abort_clear_mask(&ctrl);

        if u32::from(abort.clone()) != 0 {
            debug!("Clearing sticky errors, CTRL/STAT = {:#010x}", u32::from(ctrl));
            self.write_ir(IR_ABORT);
            // The ABORT scan ignores the address bits.
            self.shift_dr(u64::from(u32::from(abort)) << 3, DR_LENGTH);
            self.current_ir = Some(IR_ABORT);
        }
        self.fault = false;

        Ok(())
    }

    fn fault(&self) -> bool {
        self.fault
    }

    fn set_allow_timeout(&mut self, allow: bool) {
        self.allow_timeout = allow;
    }

    fn idcode(&self) -> u32 {
        self.idcode
    }
}
