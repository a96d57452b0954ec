//! ROM table parsing and CoreSight component identification.
//!
//! Starting from a MEM-AP's BASE address, the walker reads the 4-byte
//! table entries, follows every present entry to its component, reads the
//! component and peripheral identification registers and recurses into
//! nested class 1 tables. The result is a flattened list of identified
//! components which target probing dispatches on.

use jep106::JEP106Code;
use num_traits::FromPrimitive;
use tracing::{debug, warn};

use crate::architecture::arm::ap::MemoryAp;
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::ArmError;

/// An error to report any errors that are romtable discovery specific.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum RomTableError {
    /// Component is not a valid romtable
    NotARomtable,

    /// The CoreSight Component could not be identified
    CsComponentIdentification,

    /// Could not access romtable
    Memory(#[source] Box<ArmError>),
}

impl RomTableError {
    fn memory(error: ArmError) -> Self {
        RomTableError::Memory(Box::new(error))
    }
}

/// The class of a CoreSight component, from CIDR1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, enum_primitive_derive::Primitive)]
pub enum ComponentClass {
    /// Generic verification component.
    GenericVerificationComponent = 0,
    /// A class 1 ROM table.
    RomTable = 1,
    /// A CoreSight architected component.
    CoreSightComponent = 9,
    /// A peripheral test block.
    PeripheralTestBlock = 0xB,
    /// A generic IP component; Cortex-M system blocks identify as this.
    GenericIpComponent = 0xE,
    /// A CoreLink, PrimeCell or system component.
    CoreLinkOrPrimeCellOrSystemComponent = 0xF,
}

/// The decoded Peripheral ID quintuple of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeripheralId {
    raw: u64,
}

impl PeripheralId {
    /// Build from a raw 64-bit concatenation of PIDR7..PIDR0.
    pub fn from_raw(raw: u64) -> Self {
        PeripheralId { raw }
    }

    /// The raw 64-bit concatenation of PIDR7..PIDR0.
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// The designer-assigned part number.
    pub fn part(&self) -> u16 {
        (self.raw & 0xFFF) as u16
    }

    /// The component revision.
    pub fn revision(&self) -> u8 {
        ((self.raw >> 20) & 0xF) as u8
    }

    /// The designer, when the identity code uses the JEP106 scheme.
    pub fn designer(&self) -> Option<JEP106Code> {
        if self.raw >> 19 & 1 == 0 {
            return None;
        }
        let id = (self.raw >> 12 & 0x7F) as u8;
        let cc = (self.raw >> 32 & 0xF) as u8;
        Some(JEP106Code::new(cc, id))
    }
}

/// What an identified component is, as far as the firmware cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralType {
    /// The System Control Space of a Cortex-M.
    Scs,
    /// Data Watchpoint and Trace unit.
    Dwt,
    /// Flash Patch and Breakpoint unit.
    Fpb,
    /// Instrumentation Trace Macrocell.
    Itm,
    /// Trace Port Interface Unit.
    Tpiu,
    /// Embedded Trace Macrocell.
    Etm,
    /// Anything else.
    Unknown,
}

/// One identified component.
#[derive(Debug, Clone, Copy)]
pub struct CoresightComponent {
    /// Base address of the component's 4 KiB block.
    pub base: u32,
    /// The component class from its CIDR.
    pub class: ComponentClass,
    /// The decoded Peripheral ID.
    pub peripheral_id: PeripheralId,
}

impl CoresightComponent {
    /// Classify ARM-designed debug blocks by their part number.
    pub fn peripheral_type(&self) -> PeripheralType {
        let arm = self
            .peripheral_id
            .designer()
            .map(|d| d.get() == Some("ARM Ltd"))
            .unwrap_or(false);
        if !arm {
            return PeripheralType::Unknown;
        }

        match self.peripheral_id.part() {
            0x000 | 0x008 | 0x00C => PeripheralType::Scs,
            0x002 | 0x00A => PeripheralType::Dwt,
            0x003 | 0x00B => PeripheralType::Fpb,
            0x001 => PeripheralType::Itm,
            0x923 | 0x9A1 => PeripheralType::Tpiu,
            0x924 | 0x925 => PeripheralType::Etm,
            _ => PeripheralType::Unknown,
        }
    }
}

/// A parsed ROM table with all nested entries flattened.
#[derive(Debug)]
pub struct RomTable {
    /// The Peripheral ID of the table itself; family probes match
    /// against it.
    pub peripheral_id: PeripheralId,
    /// All identified components behind the table.
    pub components: Vec<CoresightComponent>,
}

impl RomTable {
    /// Walk the ROM table announced by the AP's BASE register.
    pub fn parse(dp: &mut dyn DpAccess, ap: &mut MemoryAp) -> Result<RomTable, RomTableError> {
        let base = ap.rom_table_base();
        let (class, peripheral_id) = read_component_id(dp, ap, base)?;

        if class != ComponentClass::RomTable {
            return Err(RomTableError::NotARomtable);
        }

        let mut components = Vec::new();
        walk(dp, ap, base, &mut components, 0)?;

        Ok(RomTable {
            peripheral_id,
            components,
        })
    }

    /// The first component of the given type, if any was discovered.
    pub fn find(&self, peripheral: PeripheralType) -> Option<&CoresightComponent> {
        self.components
            .iter()
            .find(|c| c.peripheral_type() == peripheral)
    }
}

/// A ROM table holds up to 960 entries before its identification block.
const MAX_ENTRIES: u32 = 960;

fn walk(
    dp: &mut dyn DpAccess,
    ap: &mut MemoryAp,
    base: u32,
    components: &mut Vec<CoresightComponent>,
    depth: usize,
) -> Result<(), RomTableError> {
    // Nested tables pointing back at an ancestor would never terminate.
    if depth > 4 {
        warn!("ROM table nesting deeper than 4 levels, stopping at {base:#010x}");
        return Ok(());
    }

    for index in 0..MAX_ENTRIES {
        let entry = ap
            .read_word_32(dp, base + index * 4)
            .map_err(RomTableError::memory)?;

        // The table ends at the first all-zero entry.
        if entry == 0 {
            break;
        }
        if entry & 1 == 0 {
            continue;
        }

        // The offset is 4 KiB aligned and signed; two's complement
        // wrapping addition is the sign extension.
        let component_base = base.wrapping_add(entry & 0xFFFF_F000);
        debug!("ROM table entry {index}: {entry:#010x} -> {component_base:#010x}");

        let (class, peripheral_id) = match read_component_id(dp, ap, component_base) {
            Ok(id) => id,
            Err(RomTableError::CsComponentIdentification) => {
                warn!("Skipping unidentifiable component at {component_base:#010x}");
                continue;
            }
            Err(error) => return Err(error),
        };

        if class == ComponentClass::RomTable {
            walk(dp, ap, component_base, components, depth + 1)?;
        } else {
            components.push(CoresightComponent {
                base: component_base,
                class,
                peripheral_id,
            });
        }
    }

    Ok(())
}

/// Read and validate the CIDR/PIDR block at the top of a component's
/// 4 KiB window.
fn read_component_id(
    dp: &mut dyn DpAccess,
    ap: &mut MemoryAp,
    base: u32,
) -> Result<(ComponentClass, PeripheralId), RomTableError> {
    let mut cidr = [0u32; 4];
    ap.read_32(dp, base + 0xFF0, &mut cidr)
        .map_err(RomTableError::memory)?;

    // The preamble bytes spell 0xB105_000D with the class nibble blanked.
    let preamble_ok = cidr[0] & 0xFF == 0x0D
        && cidr[1] & 0x0F == 0x00
        && cidr[2] & 0xFF == 0x05
        && cidr[3] & 0xFF == 0xB1;
    if !preamble_ok {
        warn!("Component at {base:#010x}: invalid CIDR preamble {cidr:x?}");
        return Err(RomTableError::CsComponentIdentification);
    }

    let class = ComponentClass::from_u32(cidr[1] >> 4 & 0xF)
        .ok_or(RomTableError::CsComponentIdentification)?;

    let mut pidr_hi = [0u32; 4];
    ap.read_32(dp, base + 0xFD0, &mut pidr_hi)
        .map_err(RomTableError::memory)?;
    let mut pidr_lo = [0u32; 4];
    ap.read_32(dp, base + 0xFE0, &mut pidr_lo)
        .map_err(RomTableError::memory)?;

    let mut raw = 0u64;
    for (i, part) in pidr_lo.iter().chain(pidr_hi.iter()).enumerate() {
        raw |= u64::from(*part & 0xFF) << (i * 8);
    }

    Ok((class, PeripheralId { raw }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::arm::ap::mock::MockDap;
    use crate::architecture::arm::ap::{GenericAp, IDR};

    /// Install a component identification block at `base`.
    ///
    /// `pidr` is the raw 64-bit quintuple, `class` the CIDR1 class
    /// nibble.
    fn install_component(dap: &mut MockDap, base: u32, class: u32, pidr: u64) {
        dap.set_reg(base + 0xFF0, 0x0D);
        dap.set_reg(base + 0xFF4, class << 4);
        dap.set_reg(base + 0xFF8, 0x05);
        dap.set_reg(base + 0xFFC, 0xB1);
        for i in 0..4 {
            dap.set_reg(base + 0xFE0 + i * 4, (pidr >> (i * 8) & 0xFF) as u32);
            dap.set_reg(base + 0xFD0 + i * 4, (pidr >> (32 + i * 8) & 0xFF) as u32);
        }
    }

    /// The PIDR of an ARM-designed part: JEP106 id 0x3B, continuation 4.
    fn arm_pidr(part: u16) -> u64 {
        u64::from(part) | 0x3B_u64 << 12 | 1_u64 << 19 | 4_u64 << 32
    }

    fn memory_ap(dap: &mut MockDap) -> MemoryAp {
        let ap = GenericAp {
            apsel: 0,
            idr: IDR::from(dap.idr),
        };
        MemoryAp::new(dap, ap).unwrap()
    }

    #[test]
    fn walk_identifies_cortex_m_blocks() {
        let mut dap = MockDap::new(0x2000_0000, 0x100);
        let rom = 0xE00F_F000;

        install_component(&mut dap, rom, 1, arm_pidr(0x4C4));
        dap.set_reg(rom, 0xFFF0_F003); // SCS at rom - 0xF1000 + ... (negative offset)
        dap.set_reg(rom + 4, 0x0000_2003); // DWT at rom + 0x2000
        dap.set_reg(rom + 8, 0); // end

        install_component(&mut dap, rom.wrapping_add(0xFFF0_F000), 0xE, arm_pidr(0x000));
        install_component(&mut dap, rom + 0x2000, 0xE, arm_pidr(0x002));

        let mut ap = memory_ap(&mut dap);
        let table = RomTable::parse(&mut dap, &mut ap).unwrap();

        assert_eq!(table.components.len(), 2);
        let scs = table.find(PeripheralType::Scs).unwrap();
        assert_eq!(scs.base, rom.wrapping_add(0xFFF0_F000));
        assert!(table.find(PeripheralType::Dwt).is_some());
        assert!(table.find(PeripheralType::Fpb).is_none());
    }

    #[test]
    fn nested_tables_are_flattened() {
        let mut dap = MockDap::new(0x2000_0000, 0x100);
        let rom = 0xE00F_F000;

        install_component(&mut dap, rom, 1, arm_pidr(0x4C4));
        dap.set_reg(rom, 0x0000_1003); // nested table at +0x1000
        install_component(&mut dap, rom + 0x1000, 1, arm_pidr(0x4C3));
        dap.set_reg(rom + 0x1000, 0x0000_1003); // FPB at +0x2000
        install_component(&mut dap, rom + 0x2000, 0xE, arm_pidr(0x003));

        let mut ap = memory_ap(&mut dap);
        let table = RomTable::parse(&mut dap, &mut ap).unwrap();

        assert_eq!(table.components.len(), 1);
        assert_eq!(
            table.components[0].peripheral_type(),
            PeripheralType::Fpb
        );
    }

    #[test]
    fn non_table_base_is_rejected() {
        let mut dap = MockDap::new(0x2000_0000, 0x100);
        install_component(&mut dap, 0xE00F_F000, 0xE, arm_pidr(0x000));

        let mut ap = memory_ap(&mut dap);
        assert!(matches!(
            RomTable::parse(&mut dap, &mut ap),
            Err(RomTableError::NotARomtable)
        ));
    }

    #[test]
    fn designer_and_part_decode() {
        let id = PeripheralId {
            raw: arm_pidr(0x00C),
        };
        assert_eq!(id.part(), 0x00C);
        assert_eq!(id.designer().unwrap().get(), Some("ARM Ltd"));
    }
}
