//! Hardware binding for the crash shutdown sequence.
//!
//! [`HwPlatform`] maps every capability the sequence needs onto the real
//! drivers. The statics below are filled in at boot, long before anything
//! can go wrong, so the crash path itself only ever reads them.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::crash::core::{
    crash_nmi_handler, machine_crash_shutdown as core_machine_crash_shutdown, CrashContext,
    CrashInfoRecord, CrashPlatform, ShootdownReport,
};
use crate::drivers::{hpet, ioapic, pci};
use crate::lapic::types::ApicMode;
use crate::{interrupts, iommu, kexec, lapic, logger, serial, smp, watchdog};

static CRASH_CTX: CrashContext = CrashContext::new();

static HV_PHYS_START: AtomicU64 = AtomicU64::new(0);
static DOM0_FRAME_LIST: AtomicU64 = AtomicU64::new(0);
static X2APIC_ENABLED: AtomicBool = AtomicBool::new(false);

/// The shared crash state. Mostly interesting to diagnostics.
pub fn context() -> &'static CrashContext {
    &CRASH_CTX
}

/// Record where the hypervisor image was loaded. Set once during early boot
/// from the relocation data.
pub fn set_hypervisor_phys_start(phys: u64) {
    HV_PHYS_START.store(phys, Ordering::SeqCst);
}

/// Record the privileged domain's frame-list-of-lists address. Updated
/// whenever the domain republishes it.
pub fn set_dom0_frame_list(mfn: u64) {
    DOM0_FRAME_LIST.store(mfn, Ordering::SeqCst);
}

/// Whether the coordinator observed x2APIC addressing during shutdown.
pub fn x2apic_enabled() -> bool {
    X2APIC_ENABLED.load(Ordering::SeqCst)
}

/// Crash-time busy wait. The TSC keeps counting no matter how broken the
/// interrupt plumbing is.
fn tsc_mdelay(ms: u64) {
    let hz = logger::tsc_frequency_hz();
    let end = unsafe { core::arch::x86_64::_rdtsc() } + (hz / 1000) * ms;
    while unsafe { core::arch::x86_64::_rdtsc() } < end {
        core::hint::spin_loop();
    }
}

pub struct HwPlatform;

impl CrashPlatform for HwPlatform {
    fn current_cpu(&self) -> usize {
        smp::current_cpu()
    }

    fn online_cpus(&self) -> crate::smp::types::CpuSet {
        smp::online_map()
    }

    fn cpu_online(&self, cpu: usize) -> bool {
        smp::cpu_online(cpu)
    }

    fn disable_nmi_watchdog(&self) {
        watchdog::disable();
    }

    fn disable_local_irqs(&self) {
        x86_64::instructions::interrupts::disable();
    }

    fn reset_irq_nesting(&self, cpu: usize) {
        smp::irq_nesting_reset(cpu);
    }

    fn knock_out_nmi_vector(&self) {
        interrupts::knock_out_nmi_vector();
    }

    fn disable_mce_ist(&self, _cpu: usize) {
        // One shared IDT, so the rebind covers every CPU at once.
        interrupts::disable_mce_ist();
    }

    fn install_nmi_crash_handler(&self) {
        interrupts::set_nmi_callback(hw_crash_nmi);
    }

    fn broadcast_nmi_all_but_self(&self) {
        lapic::send_nmi_allbutself();
    }

    fn mdelay(&self, ms: u64) {
        tsc_mdelay(ms);
    }

    fn save_processor_state(&self, cpu: usize) {
        kexec::crash_save_cpu(cpu);
    }

    fn stop_local_cpu(&self, cpu: usize) {
        smp::stop_this_cpu(cpu);
    }

    fn local_apic_mode(&self) -> ApicMode {
        lapic::current_mode()
    }

    fn record_x2apic_mode(&self, enabled: bool) {
        X2APIC_ENABLED.store(enabled, Ordering::SeqCst);
    }

    fn queue_self_nmi(&self, _cpu: usize, mode: ApicMode) {
        lapic::queue_self_nmi(mode);
    }

    fn console_force_unlock(&self) {
        serial::force_unlock();
    }

    fn iommu_crash_shutdown(&self) {
        iommu::crash_shutdown();
    }

    fn iommu_quiesce(&self) {
        iommu::quiesce();
    }

    fn pcidevs_trylock(&self) -> bool {
        pci::pcidevs_trylock()
    }

    fn pcidevs_unlock(&self) {
        pci::pcidevs_unlock();
    }

    fn pci_disable_msi_all(&self) {
        pci::disable_msi_all();
    }

    fn disable_ioapic(&self) {
        ioapic::disable();
    }

    fn disable_hpet(&self) {
        hpet::disable();
    }

    fn crash_info(&self) -> &CrashInfoRecord {
        kexec::crash_info()
    }

    fn hypervisor_phys_start(&self) -> u64 {
        HV_PHYS_START.load(Ordering::SeqCst)
    }

    fn dom0_frame_list(&self) -> u64 {
        DOM0_FRAME_LIST.load(Ordering::SeqCst)
    }

    fn halt(&self, _cpu: usize) {
        x86_64::instructions::hlt();
    }
}

/// NMI callback installed for the shootdown; runs on every CPU the
/// broadcast reaches.
fn hw_crash_nmi(cpu: usize) -> ! {
    crash_nmi_handler(&CRASH_CTX, cpu, &HwPlatform)
}

/// Entry point for the fatal-error path: stop the machine and hand off to
/// the secondary kernel's metadata.
pub fn machine_crash_shutdown() -> ShootdownReport {
    core_machine_crash_shutdown(&CRASH_CTX, &HwPlatform)
}
