//! Interrupt/DMA remapping units.
//!
//! Units register their MMIO base at boot. The crash path only ever turns
//! them off: some secondary dump kernels hang on boot when translation or
//! interrupt remapping is still live, so both `crash_shutdown` and `quiesce`
//! are best-effort disables with no failure signal.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const MAX_UNITS: usize = 8;

const REG_GCMD: u64 = 0x18;
const REG_GSTS: u64 = 0x1C;
const REG_FSTS: u64 = 0x34;

// Clearing GCMD drops the translation-enable (bit 31), queued-invalidation
// (bit 26) and interrupt-remapping (bit 25) enables in one write.
const GCMD_DISABLE_ALL: u32 = 0;

const ZERO: AtomicU64 = AtomicU64::new(0);
static UNIT_BASES: [AtomicU64; MAX_UNITS] = [ZERO; MAX_UNITS];
static UNIT_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn register_unit(base: u64) -> Result<(), &'static str> {
    let index = UNIT_COUNT.fetch_add(1, Ordering::SeqCst);
    if index >= MAX_UNITS {
        UNIT_COUNT.store(MAX_UNITS, Ordering::SeqCst);
        return Err("too many remapping units");
    }
    UNIT_BASES[index].store(base, Ordering::SeqCst);
    crate::kinfo!("IOMMU: remapping unit {} at {:#x}", index, base);
    Ok(())
}

pub fn unit_count() -> usize {
    UNIT_COUNT.load(Ordering::SeqCst).min(MAX_UNITS)
}

/// Disable translation and interrupt remapping on every unit. Called with
/// other CPUs possibly frozen mid-operation; touches only per-unit MMIO,
/// no locks.
pub fn crash_shutdown() {
    for index in 0..unit_count() {
        let base = UNIT_BASES[index].load(Ordering::SeqCst);
        if base == 0 {
            continue;
        }
        unsafe {
            write_volatile((base + REG_GCMD) as *mut u32, GCMD_DISABLE_ALL);
        }
    }
}

/// Device-level quiesce: re-assert the disables and acknowledge any faults
/// the shootdown left latched.
pub fn quiesce() {
    for index in 0..unit_count() {
        let base = UNIT_BASES[index].load(Ordering::SeqCst);
        if base == 0 {
            continue;
        }
        unsafe {
            write_volatile((base + REG_GCMD) as *mut u32, GCMD_DISABLE_ALL);
            // GSTS read confirms the write landed; faults are write-1-to-clear
            let _ = read_volatile((base + REG_GSTS) as *const u32);
            let faults = read_volatile((base + REG_FSTS) as *const u32);
            if faults != 0 {
                write_volatile((base + REG_FSTS) as *mut u32, faults);
            }
        }
    }
}
