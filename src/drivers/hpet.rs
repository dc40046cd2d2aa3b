//! HPET control.
//!
//! Only the pieces the crash path needs: locating the register block and
//! turning the main counter and legacy replacement routing off so the dump
//! kernel inherits a silent timer.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_BASE: u64 = 0xFED0_0000;

const REG_GENERAL_CONFIG: u64 = 0x10;

const CFG_ENABLE: u64 = 1 << 0;
const CFG_LEGACY_ROUTE: u64 = 1 << 1;

static HPET_BASE: AtomicU64 = AtomicU64::new(0);

pub fn init(base: u64) {
    HPET_BASE.store(base, Ordering::SeqCst);
    crate::kinfo!("HPET: register block at {:#x}", base);
}

pub fn is_present() -> bool {
    HPET_BASE.load(Ordering::SeqCst) != 0
}

/// Halt the main counter and detach the legacy IRQ routing. Best-effort; a
/// missing HPET is fine.
pub fn disable() {
    let base = HPET_BASE.load(Ordering::SeqCst);
    if base == 0 {
        return;
    }

    unsafe {
        let cfg_ptr = (base + REG_GENERAL_CONFIG) as *mut u64;
        let cfg = read_volatile(cfg_ptr);
        write_volatile(cfg_ptr, cfg & !(CFG_ENABLE | CFG_LEGACY_ROUTE));
    }
}
