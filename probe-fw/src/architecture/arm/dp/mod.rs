//! Debug Port register definitions and the DP capability trait.
//!
//! Two transport engines implement [`DpAccess`]: [`swd::SwDp`] over the
//! serial wire and [`jtag::JtagDp`] over the scan chain. Everything above
//! this layer is transport agnostic.

pub mod jtag;
pub mod swd;

use bitfield::bitfield;
use jep106::JEP106Code;
use std::time::{Duration, Instant};

use super::{ArmError, DapError, Register};

/// How often a transfer is retried when the target answers WAIT.
pub(crate) const WAIT_RETRIES: usize = 1000;

/// SWD acknowledge codes, LSB first on the wire.
pub(crate) const ACK_OK: u32 = 0b001;
pub(crate) const ACK_WAIT: u32 = 0b010;
pub(crate) const ACK_FAULT: u32 = 0b100;

/// Register-level access to a Debug Port and the Access Ports behind it.
///
/// The sticky fault state is part of the contract: once a FAULT response
/// or a sticky error bit is latched, Access Port operations short-circuit
/// to zero until [`DpAccess::error_clear`] runs. Callers are expected to
/// consult [`DpAccess::fault`] instead of trusting zero data.
pub trait DpAccess {
    /// Read a DP register.
    fn read_dp(&mut self, addr: u8) -> Result<u32, DapError>;

    /// Write a DP register.
    fn write_dp(&mut self, addr: u8, value: u32) -> Result<(), DapError>;

    /// Read an AP register.
    fn read_ap(&mut self, ap: u8, addr: u8) -> Result<u32, DapError>;

    /// Write an AP register.
    fn write_ap(&mut self, ap: u8, addr: u8, value: u32) -> Result<(), DapError>;

    /// Read the same AP register repeatedly, pipelining the replies.
    fn read_ap_repeated(&mut self, ap: u8, addr: u8, values: &mut [u32]) -> Result<(), DapError>;

    /// Write the same AP register repeatedly.
    fn write_ap_repeated(&mut self, ap: u8, addr: u8, values: &[u32]) -> Result<(), DapError>;

    /// Clear the sticky error bits and reset the cached fault flag.
    fn error_clear(&mut self) -> Result<(), DapError>;

    /// Whether a sticky fault is latched.
    fn fault(&self) -> bool;

    /// Allow WAIT retry exhaustion to read back as zero instead of
    /// raising a wire fault. Used while polling registers that may
    /// legitimately stall, for example across a reset.
    fn set_allow_timeout(&mut self, allow: bool);

    /// The identification code read at connect time.
    fn idcode(&self) -> u32;
}

/// Typed register helpers on top of the raw [`DpAccess`] methods.
pub trait DpRegisterAccess: DpAccess {
    /// Read a DP register as its typed representation.
    fn read_dp_register<R: Register>(&mut self) -> Result<R, DapError> {
        self.read_dp(R::ADDRESS).map(R::from)
    }

    /// Write a typed DP register.
    fn write_dp_register<R: Register>(&mut self, register: R) -> Result<(), DapError> {
        self.write_dp(R::ADDRESS, register.into())
    }
}

impl<T: DpAccess + ?Sized> DpRegisterAccess for T {}

bitfield! {
    /// The ABORT register. Write-only; the `*CLR` bits acknowledge the
    /// matching sticky flags in [`Ctrl`].
    #[derive(Clone)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Abort(raw)
    }
}

impl From<Abort> for u32 {
    fn from(raw: Abort) -> Self {
        raw.0
    }
}

impl Register for Abort {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "ABORT";
}

bitfield! {
    /// The CTRL/STAT register.
    #[derive(Clone)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub c_dbg_rst_req, set_c_dbg_rst_req: 26;
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    pub u8, mask_lane, set_mask_lane: 11, 8;
    pub w_data_err, _ : 7;
    pub read_ok, _ : 6;
    pub sticky_err, _: 5;
    pub sticky_cmp, _: 4;
    pub u8, trn_mode, _: 3, 2;
    pub sticky_orun, _: 1;
    pub orun_detect, set_orun_detect: 0;
}

impl From<u32> for Ctrl {
    fn from(raw: u32) -> Self {
        Ctrl(raw)
    }
}

impl From<Ctrl> for u32 {
    fn from(raw: Ctrl) -> Self {
        raw.0
    }
}

impl Register for Ctrl {
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "CTRL/STAT";
}

bitfield! {
    /// The SELECT register.
    #[derive(Clone)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl From<u32> for Select {
    fn from(raw: u32) -> Self {
        Select(raw)
    }
}

impl From<Select> for u32 {
    fn from(raw: Select) -> Self {
        raw.0
    }
}

impl Register for Select {
    const ADDRESS: u8 = 0x8;
    const NAME: &'static str = "SELECT";
}

bitfield! {
    /// The identification register read at connect.
    #[derive(Clone)]
    pub struct DPIDR(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

impl From<u32> for DPIDR {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<DPIDR> for u32 {
    fn from(raw: DPIDR) -> Self {
        raw.0
    }
}

impl Register for DPIDR {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "DPIDR";
}

/// The read buffer; returns the posted result of the previous AP read
/// without generating a new access.
#[derive(Debug, Clone)]
pub struct RdBuff(pub u32);

impl From<u32> for RdBuff {
    fn from(raw: u32) -> Self {
        RdBuff(raw)
    }
}

impl From<RdBuff> for u32 {
    fn from(raw: RdBuff) -> Self {
        raw.0
    }
}

impl Register for RdBuff {
    const ADDRESS: u8 = 0xC;
    const NAME: &'static str = "RDBUFF";
}

/// Decoded DPIDR contents.
#[derive(Debug)]
pub struct DebugPortId {
    pub revision: u8,
    pub part_no: u8,
    pub version: DebugPortVersion,
    pub min_dp_support: MinDpSupport,
    pub designer: JEP106Code,
}

impl From<DPIDR> for DebugPortId {
    fn from(dpidr: DPIDR) -> DebugPortId {
        DebugPortId {
            revision: dpidr.revision(),
            part_no: dpidr.part_no(),
            version: dpidr.version().into(),
            min_dp_support: dpidr.min().into(),
            designer: JEP106Code::new(dpidr.jep_cc(), dpidr.jep_id()),
        }
    }
}

/// Whether the DP implements the minimal register set.
#[derive(Debug, PartialEq, Eq)]
pub enum MinDpSupport {
    NotImplemented,
    Implemented,
}

impl From<bool> for MinDpSupport {
    fn from(bit_set: bool) -> Self {
        if bit_set {
            MinDpSupport::Implemented
        } else {
            MinDpSupport::NotImplemented
        }
    }
}

/// Debug Port architecture version.
#[derive(Debug, PartialEq, Eq)]
pub enum DebugPortVersion {
    DPv0,
    DPv1,
    DPv2,
    Unsupported,
}

impl From<u8> for DebugPortVersion {
    fn from(value: u8) -> Self {
        match value {
            0 => DebugPortVersion::DPv0,
            1 => DebugPortVersion::DPv1,
            2 => DebugPortVersion::DPv2,
            _ => DebugPortVersion::Unsupported,
        }
    }
}

/// The ABORT value acknowledging exactly the sticky bits currently set in
/// `ctrl`.
pub(crate) fn abort_clear_mask(ctrl: &Ctrl) -> Abort {
    let mut abort = Abort(0);
    abort.set_orunerrclr(ctrl.sticky_orun());
    abort.set_stkcmpclr(ctrl.sticky_cmp());
    abort.set_stkerrclr(ctrl.sticky_err());
    abort.set_wderrclr(ctrl.w_data_err());
    abort
}

/// Power up the debug domain after connect.
///
/// Follows the CMSIS `DebugPortStart` procedure: request CDBGPWRUPREQ and
/// CSYSPWRUPREQ, poll the matching ACK bits, then initialize the byte lane
/// mask for normal transfers.
pub fn power_up(dp: &mut dyn DpAccess) -> Result<(), ArmError> {
    dp.write_dp(Select::ADDRESS, 0)?;

    let ctrl = Ctrl(dp.read_dp(Ctrl::ADDRESS)?);
    if ctrl.csyspwrupack() && ctrl.cdbgpwrupack() {
        return Ok(());
    }

    let mut request = Ctrl(0);
    request.set_cdbgpwrupreq(true);
    request.set_csyspwrupreq(true);
    dp.write_dp(Ctrl::ADDRESS, request.clone().into())?;

    let start = Instant::now();
    loop {
        let ctrl = Ctrl(dp.read_dp(Ctrl::ADDRESS)?);
        if ctrl.csyspwrupack() && ctrl.cdbgpwrupack() {
            break;
        }
        if start.elapsed() > Duration::from_millis(1000) {
            tracing::error!("Debug power request was not acknowledged");
            return Err(ArmError::Timeout);
        }
    }

    // Normal transfer mode, all byte lanes included.
    request.set_mask_lane(0b1111);
    dp.write_dp(Ctrl::ADDRESS, request.into())?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn abort_acknowledges_only_latched_bits() {
        // STICKYERR and WDATAERR set.
        let ctrl = Ctrl(1 << 5 | 1 << 7);
        let abort = abort_clear_mask(&ctrl);
        assert_eq!(u32::from(abort), 1 << 2 | 1 << 3);
    }

    #[test]
    fn dpidr_decodes_designer() {
        // An ARM DPv1 identification code.
        let id = DebugPortId::from(DPIDR(0x1BA0_1477));
        assert_eq!(id.version, DebugPortVersion::DPv1);
        assert_eq!(id.designer.get().unwrap(), "ARM Ltd");
    }
}
