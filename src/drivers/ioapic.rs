//! IO-APIC access and crash-time teardown.
//!
//! Registers are reached indirectly: write the register index to IOREGSEL,
//! then read or write the value through IOWIN.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

pub const DEFAULT_BASE: u64 = 0xFEC0_0000;

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;

const REG_VER: u32 = 0x01;
const REG_REDTBL_BASE: u32 = 0x10;

const REDIR_MASKED: u32 = 1 << 16;

const PIC_1_DATA: u16 = 0x21;
const PIC_2_DATA: u16 = 0xA1;

static IOAPIC_BASE: AtomicU64 = AtomicU64::new(0);

pub fn init(base: u64) {
    IOAPIC_BASE.store(base, Ordering::SeqCst);
    let entries = unsafe { max_redirection_entries() };
    crate::kinfo!("IOAPIC: {} redirection entries at {:#x}", entries, base);
}

/// Stop the IO-APIC from delivering anything.
///
/// Masks every redirection entry and leaves the 8259 pair fully masked so a
/// secondary dump kernel starts from quiet legacy interrupt hardware. Safe
/// to call with other CPUs frozen: only port and MMIO writes, no locks.
pub fn disable() {
    let base = IOAPIC_BASE.load(Ordering::SeqCst);
    if base == 0 {
        return;
    }

    unsafe {
        let entries = max_redirection_entries();
        for entry in 0..entries {
            let low = REG_REDTBL_BASE + entry * 2;
            let high = low + 1;
            write_register(low, REDIR_MASKED);
            write_register(high, 0);
        }

        Port::<u8>::new(PIC_1_DATA).write(0xFF);
        Port::<u8>::new(PIC_2_DATA).write(0xFF);
    }
}

unsafe fn max_redirection_entries() -> u32 {
    ((read_register(REG_VER) >> 16) & 0xFF) + 1
}

unsafe fn read_register(reg: u32) -> u32 {
    let base = IOAPIC_BASE.load(Ordering::SeqCst);
    write_volatile((base + IOREGSEL) as *mut u32, reg);
    read_volatile((base + IOWIN) as *const u32)
}

unsafe fn write_register(reg: u32, value: u32) {
    let base = IOAPIC_BASE.load(Ordering::SeqCst);
    write_volatile((base + IOREGSEL) as *mut u32, reg);
    write_volatile((base + IOWIN) as *mut u32, value);
}
