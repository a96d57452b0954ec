//! The Serial Wire Debug Port engine.

use tracing::{debug, trace, warn};

use super::{
    abort_clear_mask, Abort, Ctrl, DebugPortId, DpAccess, RdBuff, Select, ACK_FAULT, ACK_OK,
    ACK_WAIT, DPIDR, WAIT_RETRIES,
};
use crate::architecture::arm::{ArmError, DapError, PortType, Register};
use crate::probe::{parity, SwdSequence};

/// A Debug Port driven over the two-wire serial protocol.
///
/// Owns the wire and the protocol state that must survive between
/// transfers: the cached SELECT value, the sticky fault flag and the
/// timeout-allowed switch.
#[derive(Debug)]
pub struct SwDp<W: SwdSequence> {
    wire: W,
    idcode: u32,
    fault: bool,
    allow_timeout: bool,
    select: Option<u32>,
}

impl<W: SwdSequence> SwDp<W> {
    /// Synchronise with the target and read its identification code.
    ///
    /// Runs the SWJ-DP switch sequence (line reset, JTAG-to-SWD select,
    /// line reset again), flushes the line with idle cycles, reads DPIDR
    /// and clears any sticky errors left from a previous session.
    pub fn connect(wire: W) -> Result<Self, ArmError> {
        let mut dp = SwDp {
            wire,
            idcode: 0,
            fault: false,
            allow_timeout: false,
            select: None,
        };

        dp.line_reset();
        // SWJ-DP switch sequence, JTAG to SWD.
        dp.wire.seq_out(0xE79E, 16);
        dp.line_reset();
        dp.wire.seq_out(0, 8);

        dp.idcode = dp.raw_transfer(PortType::DebugPort, true, DPIDR::ADDRESS, 0)?;
        debug!(
            "SW-DP connected: {:x?}",
            DebugPortId::from(DPIDR(dp.idcode))
        );

        dp.error_clear()?;

        Ok(dp)
    }

    /// Release the wire.
    pub fn release(self) -> W {
        self.wire
    }

    /// Hold SWDIO high for more than 50 cycles.
    fn line_reset(&mut self) {
        self.wire.seq_out(u32::MAX, 32);
        self.wire.seq_out(0x0007_FFFF, 19);
    }

    /// One complete request/ack/data exchange, retried on WAIT.
    fn raw_transfer(
        &mut self,
        port: PortType,
        rnw: bool,
        addr: u8,
        value: u32,
    ) -> Result<u32, DapError> {
        let request = build_request(port, rnw, addr);

        for _ in 0..WAIT_RETRIES {
            self.wire.seq_out(request, 8);

            match self.wire.seq_in(3) {
                ACK_OK => {
                    let result = if rnw {
                        self.wire.seq_in_parity(32)?
                    } else {
                        self.wire.seq_out_parity(value, 32);
                        0
                    };
                    // Eight idle cycles push the transfer through the DP.
                    self.wire.seq_out(0, 8);
                    trace!("SWD {:?} {:#x} = {:#010x}", port, addr, result);
                    return Ok(result);
                }
                // The complete request is retransmitted.
                ACK_WAIT => continue,
                ACK_FAULT => {
                    warn!("SWD {:?} {:#x}: FAULT response latched", port, addr);
                    self.fault = true;
                    return Err(DapError::FaultResponse);
                }
                ack => {
                    warn!("SWD {:?} {:#x}: protocol error, ACK = {:#05b}", port, addr, ack);
                    return Err(DapError::NoAcknowledge);
                }
            }
        }

        if self.allow_timeout {
            trace!("SWD {:?} {:#x}: WAIT retries exhausted, allowed", port, addr);
            Ok(0)
        } else {
            Err(DapError::WaitRetriesExceeded)
        }
    }

    /// Program SELECT for the given AP register, eliding redundant writes.
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

    /// Faulted operations read back as zero; the latch stays until the
    /// caller acknowledges it through [`DpAccess::error_clear`].
    fn faulted_as_zero(result: Result<u32, DapError>) -> Result<u32, DapError> {
        match result {
            Err(DapError::FaultResponse) => Ok(0),
            other => other,
        }
    }
}

/// Assemble the 8-bit request: start, APnDP, RnW, A[3:2], parity over
/// those four, stop, park.
fn build_request(port: PortType, rnw: bool, addr: u8) -> u32 {
    let apndp = port == PortType::AccessPort;

    let mut request = 0x81;
    if apndp {
        request |= 1 << 1;
    }
    if rnw {
        request |= 1 << 2;
    }
    request |= u32::from(addr & 0x0C) << 1;
    if parity(request >> 1, 4) {
        request |= 1 << 5;
    }

    request
}

impl<W: SwdSequence> DpAccess for SwDp<W> {
    fn read_dp(&mut self, addr: u8) -> Result<u32, DapError> {
        Self::faulted_as_zero(self.raw_transfer(PortType::DebugPort, true, addr, 0))
    }

    fn write_dp(&mut self, addr: u8, value: u32) -> Result<(), DapError> {
        if addr == Select::ADDRESS {
            self.select = Some(value);
        }
        Self::faulted_as_zero(self.raw_transfer(PortType::DebugPort, false, addr, value))
            .map(|_| ())
    }

    fn read_ap(&mut self, ap: u8, addr: u8) -> Result<u32, DapError> {
        if self.fault {
            return Ok(0);
        }
        self.select_ap_bank(ap, addr)?;

        // AP reads are posted: the issue returns stale data and RDBUFF
        // delivers the result.
        let result = self
            .raw_transfer(PortType::AccessPort, true, addr, 0)
            .and_then(|_| self.raw_transfer(PortType::DebugPort, true, RdBuff::ADDRESS, 0));
        Self::faulted_as_zero(result)
    }

    fn write_ap(&mut self, ap: u8, addr: u8, value: u32) -> Result<(), DapError> {
        if self.fault {
            return Ok(());
        }
        self.select_ap_bank(ap, addr)?;
        Self::faulted_as_zero(self.raw_transfer(PortType::AccessPort, false, addr, value))
            .map(|_| ())
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

        let result = (|| {
            // Prime the pipeline; each subsequent access returns the data
            // of the one before it.
            self.raw_transfer(PortType::AccessPort, true, addr, 0)?;
            let (last, head) = values.split_last_mut().expect("checked non-empty");
            for value in head {
                *value = self.raw_transfer(PortType::AccessPort, true, addr, 0)?;
            }
            *last = self.raw_transfer(PortType::DebugPort, true, RdBuff::ADDRESS, 0)?;
            Ok(0)
        })();

        if let Err(DapError::FaultResponse) = result {
            values.fill(0);
            return Ok(());
        }
        result.map(|_| ())
    }

    fn write_ap_repeated(&mut self, ap: u8, addr: u8, values: &[u32]) -> Result<(), DapError> {
        if self.fault {
            return Ok(());
        }
        self.select_ap_bank(ap, addr)?;

        for &value in values {
            match self.raw_transfer(PortType::AccessPort, false, addr, value) {
                Err(DapError::FaultResponse) => return Ok(()),
                other => other?,
            };
        }
        Ok(())
    }

    fn error_clear(&mut self) -> Result<(), DapError> {
        let ctrl = Ctrl(self.raw_transfer(PortType::DebugPort, true, Ctrl::ADDRESS, 0)?);
        let abort = abort_clear_mask(&ctrl);

        if u32::from(abort.clone()) != 0 {
            debug!("Clearing sticky errors, CTRL/STAT = {:#010x}", u32::from(ctrl));
            self.raw_transfer(PortType::DebugPort, false, Abort::ADDRESS, abort.into())?;
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
