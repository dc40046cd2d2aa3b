//! Platform device drivers the crash path quiesces.

pub mod hpet;
pub mod ioapic;
pub mod pci;
