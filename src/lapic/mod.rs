//! Local APIC driver.
//!
//! Normal operation uses whichever accessor family matches the mode the BSP
//! booted in. The crash path additionally needs the raw command-register
//! interface: after a CPU software-disables its APIC the usual wrappers can
//! no longer be trusted (the controller may have reverted from x2APIC to
//! xAPIC), but the ICR and APIC ID stay architecturally valid, so a
//! self-targeted NMI can still be queued through them.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use x86_64::registers::model_specific::Msr;

pub mod types;

pub use types::ApicMode;
use types::*;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);
static LAPIC_READY: AtomicBool = AtomicBool::new(false);

pub fn init(lapic_base: u64) {
    LAPIC_BASE.store(lapic_base & APIC_BASE_MASK, Ordering::SeqCst);
    enable_apic();
    LAPIC_READY.store(true, Ordering::SeqCst);
    crate::kinfo!(
        "LAPIC: enabled at {:#x} (ID {:#x}, {:?} mode)",
        lapic_base,
        current_apic_id(),
        current_mode()
    );
}

pub fn base() -> Option<u64> {
    if !LAPIC_READY.load(Ordering::SeqCst) {
        return None;
    }
    Some(LAPIC_BASE.load(Ordering::SeqCst))
}

/// Addressing mode currently programmed into IA32_APIC_BASE.
pub fn current_mode() -> ApicMode {
    let value = unsafe { Msr::new(IA32_APIC_BASE).read() };
    types::mode_from_apic_base(value)
}

pub fn current_apic_id() -> u32 {
    match current_mode() {
        ApicMode::X2Apic => unsafe { Msr::new(X2APIC_ID).read() as u32 },
        ApicMode::XApic => unsafe { read_register(REG_ID) >> 24 },
        ApicMode::Unknown => 0,
    }
}

pub fn send_eoi() {
    unsafe {
        write_register(REG_EOI, 0);
    }
}

/// Broadcast an NMI to every CPU except the sender.
///
/// NMI delivery ignores the interrupt-flag state on the targets; this is the
/// only cross-CPU signal the crash path may rely on.
pub fn send_nmi_allbutself() {
    match current_mode() {
        ApicMode::X2Apic => unsafe {
            Msr::new(X2APIC_ICR).write((ICR_DEST_ALL_BUT_SELF | ICR_DM_NMI) as u64);
        },
        ApicMode::XApic => unsafe {
            wait_for_icr();
            write_register(REG_ICR_LOW, ICR_DEST_ALL_BUT_SELF | ICR_DM_NMI);
        },
        ApicMode::Unknown => {}
    }
}

/// Queue an NMI aimed at this CPU's own APIC id through the raw ICR.
///
/// Used with the NMI latch still asserted: the queued interrupt does not
/// fire now, but the moment the latch clears the CPU is yanked back into the
/// NMI handler instead of resuming whatever it was running. Physical
/// destination with the explicit ID is used because NMI delivery combined
/// with the self shorthand is undefined.
pub fn queue_self_nmi(mode: ApicMode) {
    match mode {
        ApicMode::X2Apic => unsafe {
            let apic_id = Msr::new(X2APIC_ID).read() as u32;
            Msr::new(X2APIC_ICR).write(
                (ICR_DM_NMI | ICR_DEST_PHYSICAL) as u64
                    | ((apic_id as u64) << ICR_X2APIC_DEST_SHIFT),
            );
        },
        ApicMode::XApic => unsafe {
            let apic_id = read_register(REG_ID) >> 24;
            wait_for_icr();
            write_register(REG_ICR_HIGH, apic_id << ICR_XAPIC_DEST_SHIFT);
            write_register(REG_ICR_LOW, ICR_DM_NMI | ICR_DEST_PHYSICAL);
        },
        ApicMode::Unknown => {}
    }
}

/// Mask the performance-counter LVT entry (the NMI watchdog source).
pub fn mask_perf_counter_lvt() {
    match current_mode() {
        ApicMode::X2Apic => unsafe {
            Msr::new(X2APIC_LVT_PC).write(LVT_MASKED as u64);
        },
        ApicMode::XApic => unsafe {
            write_register(REG_LVT_PC, LVT_MASKED);
        },
        ApicMode::Unknown => {}
    }
}

/// Program the performance-counter LVT entry to deliver NMIs.
pub fn arm_perf_counter_nmi() {
    match current_mode() {
        ApicMode::X2Apic => unsafe {
            Msr::new(X2APIC_LVT_PC).write(LVT_DM_NMI as u64);
        },
        ApicMode::XApic => unsafe {
            write_register(REG_LVT_PC, LVT_DM_NMI);
        },
        ApicMode::Unknown => {}
    }
}

/// Software-disable the local APIC, reverting it towards its boot state.
///
/// After this the mode reported by `current_mode` may no longer match what
/// running code assumed; only the raw ICR interface remains dependable.
pub fn disable() {
    match current_mode() {
        ApicMode::X2Apic => unsafe {
            let svr = Msr::new(X2APIC_SVR).read();
            Msr::new(X2APIC_SVR).write(svr & !(SVR_SW_ENABLE as u64));
        },
        ApicMode::XApic => unsafe {
            let svr = read_register(REG_SVR);
            write_register(REG_SVR, svr & !SVR_SW_ENABLE);
        },
        ApicMode::Unknown => {}
    }
    LAPIC_READY.store(false, Ordering::SeqCst);
}

unsafe fn wait_for_icr() {
    while (read_register(REG_ICR_LOW) & ICR_BUSY) != 0 {
        core::hint::spin_loop();
    }
}

unsafe fn read_register(offset: u32) -> u32 {
    let base = LAPIC_BASE.load(Ordering::SeqCst);
    let ptr = (base + offset as u64) as *const u32;
    read_volatile(ptr)
}

unsafe fn write_register(offset: u32, value: u32) {
    let base = LAPIC_BASE.load(Ordering::SeqCst);
    let ptr = (base + offset as u64) as *mut u32;
    write_volatile(ptr, value);
}

fn enable_apic() {
    unsafe {
        let mut msr = Msr::new(IA32_APIC_BASE);
        let mut value = msr.read();
        let base = LAPIC_BASE.load(Ordering::SeqCst);
        value &= !APIC_BASE_MASK;
        value |= base & APIC_BASE_MASK;
        value |= APIC_BASE_ENABLE;
        msr.write(value);

        let mut svr = read_register(REG_SVR);
        svr &= !0xFF;
        svr |= DEFAULT_SPURIOUS_VECTOR as u32;
        svr |= SVR_SW_ENABLE;
        write_register(REG_SVR, svr);
    }
}
