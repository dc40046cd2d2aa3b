//! Online-CPU bookkeeping and per-CPU shutdown primitives.
//!
//! CPU indices are assigned in MADT order at boot; index 0 is the BSP. The
//! APIC-id-to-index mapping is kept here so interrupt-time code can name the
//! CPU it runs on without touching firmware tables.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use x86_64::instructions::hlt;

use crate::{acpi, lapic};

pub mod types;

pub use types::{CpuMask, CpuSet, MAX_CPUS};

static CPU_ONLINE: CpuMask = CpuMask::new();
static CPU_TOTAL: AtomicUsize = AtomicUsize::new(1);

const ZERO_U32: AtomicU32 = AtomicU32::new(0);
static APIC_TO_CPU: [AtomicU32; MAX_CPUS] = [ZERO_U32; MAX_CPUS];
static IRQ_NESTING: [AtomicU32; MAX_CPUS] = [ZERO_U32; MAX_CPUS];

/// Record the boot topology and mark every reported CPU online.
pub fn init() -> Result<(), &'static str> {
    let cpus = acpi::cpus();
    if cpus.is_empty() {
        return Err("no processors enumerated");
    }

    for (index, desc) in cpus.iter().enumerate() {
        APIC_TO_CPU[desc.apic_id as usize].store(index as u32, Ordering::SeqCst);
        CPU_ONLINE.set(index);
    }
    CPU_TOTAL.store(cpus.len(), Ordering::SeqCst);

    crate::kinfo!(
        "SMP: {} logical CPUs online (BSP APIC {:#x})",
        cpus.len(),
        lapic::current_apic_id()
    );
    Ok(())
}

pub fn cpu_count() -> usize {
    CPU_TOTAL.load(Ordering::SeqCst)
}

pub fn cpu_online(cpu: usize) -> bool {
    CPU_ONLINE.contains(cpu)
}

pub fn online_map() -> CpuSet {
    CPU_ONLINE.snapshot()
}

pub fn mark_offline(cpu: usize) {
    CPU_ONLINE.clear(cpu);
}

/// Index of the CPU this code is running on.
pub fn current_cpu() -> usize {
    let apic_id = lapic::current_apic_id() as usize;
    if apic_id < MAX_CPUS {
        APIC_TO_CPU[apic_id].load(Ordering::SeqCst) as usize
    } else {
        0
    }
}

pub fn irq_enter(cpu: usize) {
    IRQ_NESTING[cpu].fetch_add(1, Ordering::SeqCst);
}

pub fn irq_exit(cpu: usize) {
    IRQ_NESTING[cpu].fetch_sub(1, Ordering::SeqCst);
}

pub fn irq_nesting(cpu: usize) -> u32 {
    IRQ_NESTING[cpu].load(Ordering::SeqCst)
}

/// Forget any in-flight interrupt accounting for `cpu`.
///
/// The crash coordinator may have preempted an interrupt handler that will
/// never run to completion; later code queries the nesting depth and must
/// see a consistent value.
pub fn irq_nesting_reset(cpu: usize) {
    IRQ_NESTING[cpu].store(0, Ordering::SeqCst);
}

/// Take this CPU out of service: local APIC off, routing bit cleared.
pub fn stop_this_cpu(cpu: usize) {
    lapic::disable();
    mark_offline(cpu);
}

pub fn halt_loop() -> ! {
    loop {
        hlt();
    }
}
