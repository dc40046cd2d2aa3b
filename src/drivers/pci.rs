//! PCI configuration access.
//!
//! Enumeration walks the legacy 0xCF8/0xCFC mechanism. The device list is
//! guarded by a flag-style lock so the crash path can attempt a non-blocking
//! acquire: if some frozen CPU died holding it, the MSI teardown is skipped
//! rather than deadlocked on.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use x86_64::instructions::port::Port;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const VENDOR_INVALID: u16 = 0xFFFF;

const OFFSET_VENDOR: u8 = 0x00;
const OFFSET_STATUS_COMMAND: u8 = 0x04;
const OFFSET_HEADER_TYPE: u8 = 0x0C;
const OFFSET_CAP_PTR: u8 = 0x34;

const STATUS_CAP_LIST: u32 = 1 << 20;
const HEADER_MULTIFUNCTION: u32 = 1 << 23;

const CAP_ID_MSI: u8 = 0x05;
const CAP_ID_MSIX: u8 = 0x11;

const MSI_CONTROL_ENABLE: u16 = 1 << 0;
const MSIX_CONTROL_ENABLE: u16 = 1 << 15;

// Capability lists are bounded; a loop past this is a corrupt chain.
const MAX_CAP_WALK: u8 = 48;

static DEVICE_LIST_LOCKED: AtomicBool = AtomicBool::new(false);
static DEVICE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Non-blocking acquire of the device-list lock.
pub fn pcidevs_trylock() -> bool {
    DEVICE_LIST_LOCKED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

pub fn pcidevs_lock() {
    while !pcidevs_trylock() {
        core::hint::spin_loop();
    }
}

pub fn pcidevs_unlock() {
    DEVICE_LIST_LOCKED.store(false, Ordering::SeqCst);
}

fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32 & 0x1F) << 11)
        | ((function as u32 & 0x07) << 8)
        | ((offset as u32) & 0xFC)
}

unsafe fn read_config32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    Port::<u32>::new(CONFIG_ADDRESS).write(config_address(bus, device, function, offset));
    Port::<u32>::new(CONFIG_DATA).read()
}

unsafe fn write_config32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    Port::<u32>::new(CONFIG_ADDRESS).write(config_address(bus, device, function, offset));
    Port::<u32>::new(CONFIG_DATA).write(value);
}

fn vendor_id(bus: u8, device: u8, function: u8) -> u16 {
    (unsafe { read_config32(bus, device, function, OFFSET_VENDOR) } & 0xFFFF) as u16
}

/// Count the functions present on the bus. Boot-time only; takes the device
/// list lock properly.
pub fn scan() {
    pcidevs_lock();
    let mut count = 0usize;
    for_each_function(|_, _, _| count += 1);
    DEVICE_COUNT.store(count, Ordering::SeqCst);
    pcidevs_unlock();
    crate::kinfo!("PCI: {} functions present", count);
}

pub fn device_count() -> usize {
    DEVICE_COUNT.load(Ordering::SeqCst)
}

fn for_each_function(mut visit: impl FnMut(u8, u8, u8)) {
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            if vendor_id(bus, device, 0) == VENDOR_INVALID {
                continue;
            }
            visit(bus, device, 0);

            let header = unsafe { read_config32(bus, device, 0, OFFSET_HEADER_TYPE) };
            if header & HEADER_MULTIFUNCTION != 0 {
                for function in 1..8u8 {
                    if vendor_id(bus, device, function) != VENDOR_INVALID {
                        visit(bus, device, function);
                    }
                }
            }
        }
    }
}

/// Clear the MSI and MSI-X enable bits on every function.
///
/// Caller must hold the device-list lock. In-flight message-signaled
/// interrupts aimed at dead CPUs would otherwise wedge a secondary kernel
/// that re-enables translation.
pub fn disable_msi_all() {
    for_each_function(|bus, device, function| {
        disable_msi_on(bus, device, function);
    });
}

fn disable_msi_on(bus: u8, device: u8, function: u8) {
    let status = unsafe { read_config32(bus, device, function, OFFSET_STATUS_COMMAND) };
    if status & STATUS_CAP_LIST == 0 {
        return;
    }

    let mut cap_offset =
        (unsafe { read_config32(bus, device, function, OFFSET_CAP_PTR) } & 0xFC) as u8;
    let mut walked = 0u8;

    while cap_offset != 0 && walked < MAX_CAP_WALK {
        let header = unsafe { read_config32(bus, device, function, cap_offset) };
        let cap_id = (header & 0xFF) as u8;
        // Message control sits in the upper half of the capability header
        let control = (header >> 16) as u16;

        let new_control = match cap_id {
            CAP_ID_MSI => Some(control & !MSI_CONTROL_ENABLE),
            CAP_ID_MSIX => Some(control & !MSIX_CONTROL_ENABLE),
            _ => None,
        };

        if let Some(new_control) = new_control {
            if new_control != control {
                let new_header = (header & 0x0000_FFFF) | ((new_control as u32) << 16);
                unsafe { write_config32(bus, device, function, cap_offset, new_header) };
            }
        }

        cap_offset = ((header >> 8) & 0xFC) as u8;
        walked += 1;
    }
}
