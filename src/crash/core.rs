//! Crash shutdown core.
//!
//! When a fatal fault is detected, one CPU becomes the coordinator: it stops
//! every other CPU with a broadcast NMI, waits a bounded time for them to
//! report in, then quiesces shared hardware and fills in the metadata the
//! secondary dump kernel needs. The remote side runs on every other CPU as
//! an NMI handler: save state once, shut down, re-arm against spurious
//! wakeups, halt forever.
//!
//! Everything here must keep working after the normal safety nets are gone:
//! no locks are taken (the one exception is a non-blocking try), no step may
//! fault, and partial failure is reported rather than escalated. Hardware is
//! reached exclusively through [`CrashPlatform`] so the same logic runs on
//! bare metal and under the hosted test harness.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::lapic::types::ApicMode;
use crate::smp::types::{CpuSet, CpuMask, MAX_CPUS};

/// Wait at most a second for the other CPUs to stop.
pub const SHOOTDOWN_TIMEOUT_MS: u64 = 1000;
/// Poll granularity while waiting.
pub const SHOOTDOWN_POLL_MS: u64 = 1;

const COORDINATOR_UNSET: usize = usize::MAX;

/// Metadata record consumed by the secondary-kernel loader.
///
/// Populated exactly once, by the coordinator, at the end of the sequence.
pub struct CrashInfoRecord {
    hv_phys_start: AtomicU64,
    dom0_frame_list: AtomicU64,
    populated: AtomicBool,
}

impl CrashInfoRecord {
    pub const fn new() -> Self {
        Self {
            hv_phys_start: AtomicU64::new(0),
            dom0_frame_list: AtomicU64::new(0),
            populated: AtomicBool::new(false),
        }
    }

    pub fn record(&self, hv_phys_start: u64, dom0_frame_list: u64) {
        // Write-once; a second writer would mean the sequence ran twice,
        // which the panic latch already rules out.
        if self.populated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.hv_phys_start.store(hv_phys_start, Ordering::SeqCst);
        self.dom0_frame_list.store(dom0_frame_list, Ordering::SeqCst);
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::SeqCst)
    }

    pub fn hv_phys_start(&self) -> u64 {
        self.hv_phys_start.load(Ordering::SeqCst)
    }

    pub fn dom0_frame_list(&self) -> u64 {
        self.dom0_frame_list.load(Ordering::SeqCst)
    }
}

impl Default for CrashInfoRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide crash state, created once and never torn down.
///
/// Passed by reference into both the coordinator and the remote handler so
/// the contract between them stays explicit.
pub struct CrashContext {
    coordinator: AtomicUsize,
    /// CPUs that have not yet completed their local shutdown. Each member
    /// clears only its own bit; the coordinator is the only reader.
    pending: CpuMask,
    /// One monotonic flag per CPU guarding the save-and-stop step.
    save_done: [AtomicBool; MAX_CPUS],
}

impl CrashContext {
    pub const fn new() -> Self {
        const FLAG: AtomicBool = AtomicBool::new(false);
        Self {
            coordinator: AtomicUsize::new(COORDINATOR_UNSET),
            pending: CpuMask::new(),
            save_done: [FLAG; MAX_CPUS],
        }
    }

    pub fn coordinator(&self) -> Option<usize> {
        match self.coordinator.load(Ordering::SeqCst) {
            COORDINATOR_UNSET => None,
            cpu => Some(cpu),
        }
    }

    pub fn pending(&self) -> &CpuMask {
        &self.pending
    }

    pub fn save_done(&self, cpu: usize) -> bool {
        self.save_done[cpu].load(Ordering::SeqCst)
    }
}

/// Hardware and collaborator surface the crash sequence runs against.
///
/// Every method is terminal-context: implementations must not fault, must
/// not block (except `mdelay`, which sleeps the stated time) and must treat
/// "nothing to do" as success.
pub trait CrashPlatform {
    fn current_cpu(&self) -> usize;
    fn online_cpus(&self) -> CpuSet;
    fn cpu_online(&self, cpu: usize) -> bool;

    /// Disarm the periodic NMI source so it cannot masquerade as the
    /// shootdown signal.
    fn disable_nmi_watchdog(&self);
    fn disable_local_irqs(&self);
    fn reset_irq_nesting(&self, cpu: usize);

    /// Rebind the calling CPU's NMI vector to a no-op gate.
    fn knock_out_nmi_vector(&self);
    /// Strip the dedicated-stack attribute from `cpu`'s machine-check gate.
    fn disable_mce_ist(&self, cpu: usize);
    /// Make the remote shutdown handler the global target for NMIs.
    fn install_nmi_crash_handler(&self);
    /// Fire-and-forget broadcast; the pending set is the only ack channel.
    fn broadcast_nmi_all_but_self(&self);
    fn mdelay(&self, ms: u64);

    /// Serialize `cpu`'s register set into the pending crash image.
    /// At-most-once per CPU, guaranteed by the caller.
    fn save_processor_state(&self, cpu: usize);
    /// Disable `cpu`'s local interrupt controller and take it out of
    /// service.
    fn stop_local_cpu(&self, cpu: usize);

    fn local_apic_mode(&self) -> ApicMode;
    /// Record whether the coordinator ended up in x2APIC mode, for the
    /// benefit of later addressing-mode-dependent code.
    fn record_x2apic_mode(&self, enabled: bool);
    /// Queue an NMI at `cpu`'s own interrupt controller through the raw
    /// command-register interface for the given mode.
    fn queue_self_nmi(&self, cpu: usize, mode: ApicMode);

    fn console_force_unlock(&self);
    fn iommu_crash_shutdown(&self);
    fn iommu_quiesce(&self);
    fn pcidevs_trylock(&self) -> bool;
    fn pcidevs_unlock(&self);
    /// Only called while the device-list lock is held.
    fn pci_disable_msi_all(&self);
    fn disable_ioapic(&self);
    fn disable_hpet(&self);

    fn crash_info(&self) -> &CrashInfoRecord;
    fn hypervisor_phys_start(&self) -> u64;
    fn dom0_frame_list(&self) -> u64;

    /// One low-power wait. The remote handler loops over this forever.
    fn halt(&self, cpu: usize);
}

/// Outcome of the shootdown, for the status report and for tests.
#[derive(Clone, Copy, Debug)]
pub struct ShootdownReport {
    stragglers: CpuSet,
    waited_ms: u64,
}

impl ShootdownReport {
    pub fn all_stopped(&self) -> bool {
        self.stragglers.is_empty()
    }

    pub fn stragglers(&self) -> &CpuSet {
        &self.stragglers
    }

    pub fn waited_ms(&self) -> u64 {
        self.waited_ms
    }
}

/// Stop every other CPU, then quiesce shared hardware.
///
/// Called exactly once, on the faulting CPU, with interrupts already
/// disabled and no intention of ever returning to normal execution.
pub fn nmi_shootdown_cpus<P: CrashPlatform>(ctx: &CrashContext, platform: &P) -> ShootdownReport {
    // The watchdog NMI would be indistinguishable from the signal we are
    // about to repurpose.
    platform.disable_nmi_watchdog();
    platform.disable_local_irqs();

    let cpu = platform.current_cpu();
    ctx.coordinator.store(cpu, Ordering::SeqCst);
    platform.reset_irq_nesting(cpu);

    ctx.pending.reset_to(&platform.online_cpus().without(cpu));

    // This CPU must not wander into the remote handler through its own
    // vector, and its MCE gate must lose the dedicated stack before the
    // watchdog that would catch a fault loop goes away for good.
    platform.knock_out_nmi_vector();
    platform.disable_mce_ist(cpu);

    platform.install_nmi_crash_handler();
    platform.broadcast_nmi_all_but_self();

    let mut msecs = SHOOTDOWN_TIMEOUT_MS;
    while !ctx.pending.is_empty() && msecs > 0 {
        platform.mdelay(SHOOTDOWN_POLL_MS);
        msecs -= SHOOTDOWN_POLL_MS;
    }
    let waited_ms = SHOOTDOWN_TIMEOUT_MS - msecs;

    // We may have NMI'd a CPU while it was holding the console lock. It is
    // in no position to release it.
    platform.console_force_unlock();

    let stragglers = ctx.pending.snapshot();
    if stragglers.is_empty() {
        crate::kinfo!("Shot down all CPUs");
    } else {
        crate::kwarn!("Failed to shoot down CPUs {{{}}}", stragglers);
    }

    // Always attempted: some dump kernels will not boot with interrupt/DMA
    // remapping left active.
    platform.iommu_crash_shutdown();

    if platform.cpu_online(cpu) {
        // Sample the addressing mode while the local APIC still answers;
        // stopping it first can revert the controller and stale the answer.
        let mode = platform.local_apic_mode();
        platform.stop_local_cpu(cpu);
        platform.record_x2apic_mode(mode == ApicMode::X2Apic);

        if platform.pcidevs_trylock() {
            platform.pci_disable_msi_all();
            platform.pcidevs_unlock();
        }
        // Lock held elsewhere: a frozen CPU died mid-update. Assume the
        // device list was consistent when the crash hit and move on.

        platform.disable_ioapic();
        platform.disable_hpet();
        platform.iommu_quiesce();
    }

    ShootdownReport {
        stragglers,
        waited_ms,
    }
}

/// Full crash shutdown: shootdown plus metadata handoff.
pub fn machine_crash_shutdown<P: CrashPlatform>(
    ctx: &CrashContext,
    platform: &P,
) -> ShootdownReport {
    let report = nmi_shootdown_cpus(ctx, platform);

    platform.crash_info().record(
        platform.hypervisor_phys_start(),
        platform.dom0_frame_list(),
    );

    report
}

/// Remote shutdown handler, run as the NMI handler on every non-coordinator
/// CPU once the crash sequence begins.
pub fn crash_nmi_handler<P: CrashPlatform>(ctx: &CrashContext, cpu: usize, platform: &P) -> ! {
    // The coordinator's own vector was rebound before the broadcast, and
    // the broadcast never targets self.
    debug_assert_ne!(Some(cpu), ctx.coordinator());

    // Save crash information and shut down. Attempt only once; the
    // self-latched NMI below can bring us back here at any time.
    if !ctx.save_done[cpu].load(Ordering::SeqCst) {
        // Same race as on the coordinator: clearing MCIP vs. a new #MC.
        // Without this, a second #MC clobbers the live exception frame and
        // the CPU spins in a fault loop nothing will ever break.
        platform.disable_mce_ist(cpu);

        platform.save_processor_state(cpu);
        platform.stop_local_cpu(cpu);

        ctx.save_done[cpu].store(true, Ordering::SeqCst);
        ctx.pending.clear(cpu);
    }

    // Local shutdown reverted the interrupt controller towards its boot
    // state, so the usual accessors may be lying about the mode. The raw
    // command-register interface stays valid even software-disabled, and
    // the NMI latch is still asserted: queue another NMI at ourselves so
    // that if the latch ever clears (say, a non-fatal machine check), we
    // land straight back here instead of resuming arbitrary code.
    match platform.local_apic_mode() {
        mode @ (ApicMode::X2Apic | ApicMode::XApic) => platform.queue_self_nmi(cpu, mode),
        // Unrecognized mode: lose the re-arm protection, accepted risk.
        ApicMode::Unknown => {}
    }

    loop {
        platform.halt(cpu);
    }
}
