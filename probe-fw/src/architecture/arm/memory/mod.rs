//! CoreSight component discovery.

pub mod romtable;

pub use romtable::{ComponentClass, CoresightComponent, PeripheralId, PeripheralType, RomTable};
