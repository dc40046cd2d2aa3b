//! ACPI processor topology discovery.
//!
//! The crash core only needs two facts from the firmware tables: how many
//! logical processors exist and where the local APIC window lives. Both come
//! from the MADT, located through the legacy RSDP scan.

use core::ptr;
use core::slice;
use core::sync::atomic::{AtomicBool, Ordering};

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const MADT_SIGNATURE: &[u8; 4] = b"APIC";
const EBDA_PTR: usize = 0x40E;
const EBDA_SEARCH_SIZE: usize = 1024;
const BIOS_SEARCH_START: usize = 0xE0000;
const BIOS_SEARCH_END: usize = 0x100000;
const MADT_ENTRY_LAPIC: u8 = 0;
const MADT_LAPIC_ENABLED: u32 = 1;

/// Maximum number of logical processors the hypervisor supports.
pub const MAX_CPUS: usize = 256;

#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[repr(C, packed)]
struct Madt {
    header: SdtHeader,
    lapic_address: u32,
    flags: u32,
}

#[repr(C, packed)]
struct MadtLocalApic {
    entry_type: u8,
    length: u8,
    acpi_processor_id: u8,
    apic_id: u8,
    flags: u32,
}

/// One logical processor as reported by the MADT.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuDescriptor {
    pub acpi_processor_id: u8,
    pub apic_id: u8,
}

impl CpuDescriptor {
    const fn empty() -> Self {
        Self {
            acpi_processor_id: 0,
            apic_id: 0,
        }
    }
}

static INIT_DONE: AtomicBool = AtomicBool::new(false);
static mut LAPIC_BASE: u64 = 0;
static mut CPU_COUNT: usize = 0;
static mut CPU_LIST: [CpuDescriptor; MAX_CPUS] = [CpuDescriptor::empty(); MAX_CPUS];

pub fn init() -> Result<(), &'static str> {
    if INIT_DONE.load(Ordering::SeqCst) {
        return Ok(());
    }

    unsafe {
        let rsdp = find_rsdp().ok_or("RSDP not found")?;
        let madt = locate_madt(rsdp).ok_or("MADT not found")?;
        parse_madt(madt)?;
        crate::kinfo!(
            "ACPI: MADT reports LAPIC window at {:#x}, {} usable CPUs",
            LAPIC_BASE,
            CPU_COUNT
        );
    }

    INIT_DONE.store(true, Ordering::SeqCst);
    Ok(())
}

pub fn lapic_base() -> Option<u64> {
    if !INIT_DONE.load(Ordering::SeqCst) {
        return None;
    }
    Some(unsafe { LAPIC_BASE })
}

pub fn cpus() -> &'static [CpuDescriptor] {
    if !INIT_DONE.load(Ordering::SeqCst) {
        return &[];
    }
    unsafe { slice::from_raw_parts(ptr::addr_of!(CPU_LIST) as *const CpuDescriptor, CPU_COUNT) }
}

unsafe fn find_rsdp() -> Option<&'static Rsdp> {
    let ebda = ((ptr::read::<u16>(EBDA_PTR as *const u16) as usize) << 4) as usize;
    if ebda >= 0x80000 {
        if let Some(rsdp) = search_rsdp(ebda, ebda + EBDA_SEARCH_SIZE) {
            return Some(rsdp);
        }
    }
    search_rsdp(BIOS_SEARCH_START, BIOS_SEARCH_END)
}

unsafe fn search_rsdp(start: usize, end: usize) -> Option<&'static Rsdp> {
    // ACPI requires the RSDP signature to be 16-byte aligned
    let mut addr = start & !0xF;
    while addr < end {
        let candidate = addr as *const u8;
        if slice::from_raw_parts(candidate, 8) == RSDP_SIGNATURE {
            return Some(&*(candidate as *const Rsdp));
        }
        addr += 16;
    }
    None
}

unsafe fn locate_madt(rsdp: &Rsdp) -> Option<&'static Madt> {
    let rsdt = rsdp.rsdt_address as usize as *const SdtHeader;
    if rsdt.is_null() {
        return None;
    }
    let rsdt_len = (*rsdt).length as usize;
    let entries = rsdt_len.saturating_sub(core::mem::size_of::<SdtHeader>()) / 4;
    let table_ptrs = (rsdt as usize + core::mem::size_of::<SdtHeader>()) as *const u32;

    for i in 0..entries {
        let table = ptr::read_unaligned(table_ptrs.add(i)) as usize as *const SdtHeader;
        if table.is_null() {
            continue;
        }
        if &(*table).signature == MADT_SIGNATURE {
            return Some(&*(table as *const Madt));
        }
    }
    None
}

unsafe fn parse_madt(madt: &Madt) -> Result<(), &'static str> {
    LAPIC_BASE = madt.lapic_address as u64;

    let total_len = madt.header.length as usize;
    let mut offset = core::mem::size_of::<Madt>();
    let base = madt as *const Madt as *const u8;
    let mut count = 0usize;

    while offset + 2 <= total_len {
        let entry_type = base.add(offset).read();
        let entry_len = base.add(offset + 1).read() as usize;
        if entry_len < 2 || offset + entry_len > total_len {
            return Err("malformed MADT entry");
        }

        if entry_type == MADT_ENTRY_LAPIC {
            let lapic = &*(base.add(offset) as *const MadtLocalApic);
            let flags = ptr::read_unaligned(ptr::addr_of!(lapic.flags));
            if flags & MADT_LAPIC_ENABLED != 0 {
                if count >= MAX_CPUS {
                    crate::kwarn!(
                        "ACPI: more than {} CPUs reported, ignoring extras",
                        MAX_CPUS
                    );
                    break;
                }
                CPU_LIST[count] = CpuDescriptor {
                    acpi_processor_id: lapic.acpi_processor_id,
                    apic_id: lapic.apic_id,
                };
                count += 1;
            }
        }
        offset += entry_len;
    }

    if count == 0 {
        return Err("MADT lists no enabled processors");
    }
    CPU_COUNT = count;
    Ok(())
}
