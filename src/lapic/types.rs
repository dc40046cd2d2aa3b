//! Local APIC register layout and addressing-mode definitions.
//!
//! The same logical registers are reachable two ways: through the legacy
//! memory-mapped window (xAPIC) or through the MSR range at 0x800 (x2APIC).
//! The two modes are mutually exclusive; `IA32_APIC_BASE` says which one is
//! active.

/// IA32_APIC_BASE MSR and its control bits
pub const IA32_APIC_BASE: u32 = 0x1B;
pub const APIC_BASE_ENABLE: u64 = 1 << 11;
pub const APIC_BASE_EXTD: u64 = 1 << 10;
pub const APIC_BASE_MASK: u64 = 0xFFFF_F000;

/// MMIO register offsets (xAPIC)
pub const REG_ID: u32 = 0x20;
pub const REG_EOI: u32 = 0x0B0;
pub const REG_SVR: u32 = 0x0F0;
pub const REG_ICR_LOW: u32 = 0x300;
pub const REG_ICR_HIGH: u32 = 0x310;
pub const REG_LVT_PC: u32 = 0x340;

/// MSR numbers (x2APIC); each MMIO offset maps to 0x800 + (offset >> 4)
pub const X2APIC_MSR_BASE: u32 = 0x800;
pub const X2APIC_ID: u32 = 0x802;
pub const X2APIC_SVR: u32 = 0x80F;
pub const X2APIC_ICR: u32 = 0x830;
pub const X2APIC_LVT_PC: u32 = 0x834;

/// Spurious vector register bits
pub const SVR_SW_ENABLE: u32 = 1 << 8;
pub const DEFAULT_SPURIOUS_VECTOR: u8 = 0xFF;

/// LVT entry bits
pub const LVT_MASKED: u32 = 1 << 16;
pub const LVT_DM_NMI: u32 = 0x400;

/// Interrupt command register bits
pub const ICR_DM_NMI: u32 = 0x400;
pub const ICR_DEST_PHYSICAL: u32 = 0;
pub const ICR_BUSY: u32 = 1 << 12;
pub const ICR_DEST_ALL_BUT_SELF: u32 = 0xC_0000;

/// xAPIC destination field lives in ICR_HIGH bits 24..32
pub const ICR_XAPIC_DEST_SHIFT: u32 = 24;
/// x2APIC destination field lives in ICR bits 32..64
pub const ICR_X2APIC_DEST_SHIFT: u64 = 32;

/// Register addressing mode of the local interrupt controller.
///
/// Closed variant: the two architected modes plus a catch-all for a
/// controller that is hardware-disabled or in a state we do not recognize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApicMode {
    /// Legacy memory-mapped register window
    XApic,
    /// MSR-based register access
    X2Apic,
    /// Disabled or unrecognized; callers must treat accessors as no-ops
    Unknown,
}

/// Decode the addressing mode from a raw IA32_APIC_BASE value.
pub fn mode_from_apic_base(value: u64) -> ApicMode {
    if value & APIC_BASE_EXTD != 0 {
        ApicMode::X2Apic
    } else if value & APIC_BASE_ENABLE != 0 {
        ApicMode::XApic
    } else {
        ApicMode::Unknown
    }
}
