#![no_std]
#![feature(abi_x86_interrupt)]

pub mod acpi;
pub mod crash;
pub mod drivers;
pub mod gdt;
pub mod interrupts;
pub mod iommu;
pub mod kexec;
pub mod lapic;
pub mod logger;
pub mod serial;
pub mod smp;
pub mod watchdog;

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};
use multiboot2::{BootInformation, BootInformationHeader};

pub const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36d76289;

/// Conventional load address when the bootloader does not report one.
const DEFAULT_PHYS_BASE: u64 = 0x10_0000;

static CRASHING: AtomicBool = AtomicBool::new(false);

pub fn kernel_main(multiboot_info_address: u64, magic: u32) -> ! {
    let freq_hz = logger::init();
    let boot_info = match unsafe {
        BootInformation::load(multiboot_info_address as *const BootInformationHeader)
    } {
        Ok(info) => info,
        Err(_) => kpanic!("Invalid multiboot info structure"),
    };

    let cmdline = boot_info
        .command_line_tag()
        .and_then(|tag| tag.cmdline().ok())
        .unwrap_or("");

    if let Some(level) = logger::parse_level_directive(cmdline) {
        logger::set_max_level(level);
    }

    kinfo!("Kernel log level set to {}", logger::max_level().as_str());

    kinfo!("==========================================================");
    kinfo!("HeliosHV Bootstrap");
    kinfo!("==========================================================");
    kdebug!("Multiboot magic: {:#x}", magic);
    kdebug!("Multiboot info struct at: {:#x}", multiboot_info_address);

    if logger::tsc_frequency_is_guessed() {
        kwarn!(
            "Falling back to default TSC frequency: {}.{:03} MHz",
            freq_hz / 1_000_000,
            (freq_hz % 1_000_000) / 1_000
        );
    } else {
        kinfo!(
            "Detected invariant TSC frequency: {}.{:03} MHz",
            freq_hz / 1_000_000,
            (freq_hz % 1_000_000) / 1_000
        );
    }

    if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
        kpanic!("Invalid Multiboot magic value: {:#x}", magic);
    }

    // The dump kernel needs to know where our image sits in physical memory.
    // Relocating loaders pass phys_start= on the command line; otherwise the
    // conventional base applies.
    let phys_base = parse_phys_start(cmdline).unwrap_or(DEFAULT_PHYS_BASE);
    crash::set_hypervisor_phys_start(phys_base);
    kinfo!("Image physical base: {:#x}", phys_base);

    gdt::init();
    interrupts::init();

    if let Err(e) = acpi::init() {
        kpanic!("ACPI discovery failed: {}", e);
    }

    match acpi::lapic_base() {
        Some(base) => lapic::init(base),
        None => kpanic!("No local APIC reported by ACPI"),
    }

    if let Err(e) = smp::init() {
        kpanic!("CPU topology setup failed: {}", e);
    }
    kinfo!("{} CPU(s) online", smp::cpu_count());

    drivers::ioapic::init(drivers::ioapic::DEFAULT_BASE);
    drivers::hpet::init(drivers::hpet::DEFAULT_BASE);
    drivers::pci::scan();

    watchdog::setup();

    x86_64::instructions::interrupts::enable();
    kinfo!("CPU interrupts enabled");

    let elapsed_us = logger::boot_time_us();
    kinfo!(
        "Initialization completed in {}.{:03} ms",
        elapsed_us / 1_000,
        elapsed_us % 1_000
    );

    smp::halt_loop()
}

/// Terminal path shared by the panic handler and `kpanic!`.
///
/// The first caller runs the full machine shutdown; anyone arriving after
/// that (including a fault inside the shutdown itself) just parks.
pub fn fatal_shutdown() -> ! {
    if CRASHING.swap(true, Ordering::SeqCst) {
        smp::halt_loop();
    }

    let report = crash::machine_crash_shutdown();
    if !report.all_stopped() {
        kwarn!(
            "Proceeding with {} CPU(s) still running",
            report.stragglers().count()
        );
    }
    kinfo!("Machine shutdown complete, metadata recorded");

    smp::halt_loop()
}

pub fn panic(info: &PanicInfo) -> ! {
    kpanic!("{}", info);
}

fn parse_phys_start(cmdline: &str) -> Option<u64> {
    for arg in cmdline.split_whitespace() {
        if let Some(value) = arg.strip_prefix("phys_start=") {
            let value = value.strip_prefix("0x").unwrap_or(value);
            if let Ok(addr) = u64::from_str_radix(value, 16) {
                return Some(addr);
            }
        }
    }
    None
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => { $crate::serial_print!("\n") };
    ($($arg:tt)*) => {{
        $crate::serial::_print(format_args!($($arg)*));
        $crate::serial::_print(format_args!("\n"));
    }};
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {{
        use core::arch::asm;
        let loc = core::panic::Location::caller();
        let message = format_args!($($arg)*);

        let cpu_id: u32 = unsafe {
            #[cfg(target_arch = "x86_64")]
            {
                use core::arch::x86_64::__cpuid;
                (__cpuid(1).ebx >> 24) as u32
            }
            #[cfg(not(target_arch = "x86_64"))]
            {
                0
            }
        };

        $crate::klog!(
            $crate::logger::LogLevel::PANIC,
            "------------[ cut here ]------------"
        );

        $crate::logger::log(
            $crate::logger::LogLevel::PANIC,
            format_args!("Kernel panic - not syncing: {}", message)
        );

        $crate::klog!(
            $crate::logger::LogLevel::PANIC,
            "CPU: {cpu} Comm: hypervisor Tainted: N/A",
            cpu = cpu_id
        );

        $crate::klog!(
            $crate::logger::LogLevel::PANIC,
            "Call Trace: <panic> at {file}:{line}:{column}",
            file = loc.file(),
            line = loc.line(),
            column = loc.column(),
        );

        unsafe {
            let cr0: u64;
            let cr2: u64;
            let cr3: u64;
            let cr4: u64;
            asm!("mov {0}, cr0", out(reg) cr0);
            asm!("mov {0}, cr2", out(reg) cr2);
            asm!("mov {0}, cr3", out(reg) cr3);
            asm!("mov {0}, cr4", out(reg) cr4);
            $crate::klog!(
                $crate::logger::LogLevel::PANIC,
                "Control: CR0={cr0:#018x} CR2={cr2:#018x} CR3={cr3:#018x} CR4={cr4:#018x}",
                cr0 = cr0,
                cr2 = cr2,
                cr3 = cr3,
                cr4 = cr4,
            );
        }

        {
            let (rip, rsp, rbp, rflags): (u64, u64, u64, u64);
            unsafe {
                asm!("lea {0}, [rip + 0]", out(reg) rip);
                asm!("mov {0}, rsp", out(reg) rsp);
                asm!("mov {0}, rbp", out(reg) rbp);
                asm!("pushf; pop {0}", out(reg) rflags);
            }
            let interrupt_enabled = (rflags & (1 << 9)) != 0;
            $crate::klog!(
                $crate::logger::LogLevel::PANIC,
                "RIP: {rip:#018x} RSP: {rsp:#018x} RBP: {rbp:#018x} RFLAGS: {rflags:#018x} (IF={})",
                interrupt_enabled,
                rip = rip,
                rsp = rsp,
                rbp = rbp,
                rflags = rflags,
            );
        }

        $crate::klog!(
            $crate::logger::LogLevel::PANIC,
            "------------[ end Kernel panic ]------------"
        );
        $crate::fatal_shutdown()
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::FATAL, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
