//! Access Port enumeration and the memory access engine.

pub mod memory_ap;
pub mod mock;

use bitfield::bitfield;
use jep106::JEP106Code;
use num_traits::FromPrimitive;
use tracing::debug;

use super::dp::DpAccess;
use super::{ArmError, Register};

pub use memory_ap::MemoryAp;

bitfield! {
    /// The identification register of an Access Port.
    #[derive(Clone, Copy)]
    pub struct IDR(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    u8, jep_cc, _: 27, 24;
    u8, jep_id, _: 23, 17;
    pub u8, class_raw, _: 16, 13;
    pub u8, variant, _: 7, 4;
    pub u8, type_raw, _: 3, 0;
}

impl From<u32> for IDR {
    fn from(raw: u32) -> Self {
        IDR(raw)
    }
}

impl From<IDR> for u32 {
    fn from(raw: IDR) -> Self {
        raw.0
    }
}

impl Register for IDR {
    const ADDRESS: u8 = 0xFC;
    const NAME: &'static str = "IDR";
}

impl IDR {
    /// The designer of the AP implementation.
    pub fn designer(&self) -> JEP106Code {
        JEP106Code::new(self.jep_cc(), self.jep_id())
    }

    /// The AP class, if it is an architected one.
    pub fn class(&self) -> Option<ApClass> {
        ApClass::from_u8(self.class_raw())
    }

    /// The AP type, if it is an architected one.
    pub fn ap_type(&self) -> Option<ApType> {
        ApType::from_u8(self.type_raw())
    }
}

/// The class of an Access Port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, enum_primitive_derive::Primitive)]
pub enum ApClass {
    /// No architected class; typically a JTAG-AP.
    Undefined = 0b0000,
    /// A communications AP.
    ComAp = 0b0001,
    /// A memory AP, exposing a memory bus of the target.
    MemAp = 0b1000,
}

/// The bus type behind a memory AP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, enum_primitive_derive::Primitive)]
pub enum ApType {
    /// JTAG communication AP.
    JtagComAp = 0x0,
    /// AMBA AHB3 bus.
    AmbaAhb3 = 0x1,
    /// AMBA APB2 or APB3 bus.
    AmbaApb2Apb3 = 0x2,
    /// AMBA AXI3 or AXI4 bus.
    AmbaAxi3Axi4 = 0x4,
    /// AMBA AHB5 bus.
    AmbaAhb5 = 0x5,
    /// AMBA APB4 or APB5 bus.
    AmbaApb4Apb5 = 0x6,
    /// AMBA AXI5 bus.
    AmbaAxi5 = 0x7,
    /// AMBA AHB5 bus with enhanced HPROT control.
    AmbaAhb5Hprot = 0x8,
}

/// An enumerated Access Port that has not been classified further.
#[derive(Debug, Clone, Copy)]
pub struct GenericAp {
    /// The AP's index in the DP's SELECT register.
    pub apsel: u8,
    /// The AP's identification register.
    pub idr: IDR,
}

impl GenericAp {
    /// Whether this AP exposes target memory.
    pub fn is_memory_ap(&self) -> bool {
        self.idr.class() == Some(ApClass::MemAp)
    }
}

/// Enumerate the Access Ports behind a Debug Port.
///
/// APs are probed in order; the scan stops at the first index whose IDR
/// reads as zero.
pub fn scan_aps(dp: &mut dyn DpAccess) -> Result<Vec<GenericAp>, ArmError> {
    let mut aps = Vec::new();

    for apsel in 0..=255 {
        let raw = dp.read_ap(apsel, IDR::ADDRESS)?;
        if dp.fault() {
            dp.error_clear()?;
            break;
        }
        if raw == 0 {
            break;
        }

        let idr = IDR(raw);
        debug!("AP {}: {:x?} ({:?})", apsel, idr, idr.class());
        aps.push(GenericAp { apsel, idr });
    }

    Ok(aps)
}

#[cfg(test)]
mod test {
    use super::mock::MockDap;
    use super::*;

    #[test]
    fn scan_stops_at_the_first_empty_ap() {
        let mut dap = MockDap::new(0x2000_0000, 0x100);
        let aps = scan_aps(&mut dap).unwrap();

        // The mock presents a single AHB MEM-AP at index 0.
        assert_eq!(aps.len(), 1);
        assert_eq!(aps[0].apsel, 0);
        assert!(aps[0].is_memory_ap());
        assert_eq!(aps[0].idr.ap_type(), Some(ApType::AmbaAhb3));
        assert_eq!(aps[0].idr.designer().get(), Some("ARM Ltd"));
    }

    #[test]
    fn idr_classifies_non_memory_aps() {
        // An ARM-designed COM-AP: class 1, type 2.
        let idr = IDR(0x0476_2002);
        assert_eq!(idr.class(), Some(ApClass::ComAp));
        assert!(!GenericAp { apsel: 3, idr }.is_memory_ap());
    }
}
