//! Thread-backed `CrashPlatform` implementation.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::crash::core::{crash_nmi_handler, CrashContext, CrashInfoRecord, CrashPlatform};
use crate::lapic::types::ApicMode;
use crate::smp::types::CpuSet;

/// How a mocked CPU reacts to the broadcast NMI.
#[derive(Clone, Copy, Debug)]
pub enum CpuBehavior {
    /// Enters the remote handler after `delay_ms` of real time.
    Responsive { delay_ms: u64 },
    /// Never takes the NMI (interrupts wedged, firmware limbo, etc.).
    Hung,
}

struct Inner {
    ctx: &'static CrashContext,
    coordinator: usize,
    num_cpus: usize,
    behavior: Mutex<Vec<CpuBehavior>>,
    apic_mode: Mutex<ApicMode>,
    /// Model the controller reverting towards its boot state when the
    /// coordinator stops it.
    revert_mode_on_stop: AtomicBool,
    /// Deliver the broadcast twice to every responsive CPU.
    double_nmi: AtomicBool,
    pcidevs_frozen: AtomicBool,
    pcidevs_locked: AtomicBool,
    hv_phys_start: AtomicU64,
    dom0_frame_list: AtomicU64,
    crash_info: CrashInfoRecord,
    calls: Mutex<Vec<String>>,
    stopped: Vec<AtomicBool>,
    halted: Vec<AtomicBool>,
    save_count: Vec<AtomicUsize>,
    self_nmi_count: Vec<AtomicUsize>,
    x2apic_recorded: Mutex<Option<bool>>,
    handler_installed: AtomicBool,
}

/// The machine under test. Cloning shares the same state, so remote-CPU
/// threads observe and mutate the same machine as the coordinator.
#[derive(Clone)]
pub struct MockPlatform {
    inner: Arc<Inner>,
}

impl MockPlatform {
    /// A machine of `num_cpus` responsive CPUs, with CPU 0 as the one the
    /// fatal error hits. Each test leaks one small `CrashContext`, which is
    /// exactly the lifetime the real one has.
    pub fn new(num_cpus: usize) -> Self {
        let ctx: &'static CrashContext = Box::leak(Box::new(CrashContext::new()));
        Self {
            inner: Arc::new(Inner {
                ctx,
                coordinator: 0,
                num_cpus,
                behavior: Mutex::new(vec![CpuBehavior::Responsive { delay_ms: 0 }; num_cpus]),
                apic_mode: Mutex::new(ApicMode::XApic),
                revert_mode_on_stop: AtomicBool::new(false),
                double_nmi: AtomicBool::new(false),
                pcidevs_frozen: AtomicBool::new(false),
                pcidevs_locked: AtomicBool::new(false),
                hv_phys_start: AtomicU64::new(0),
                dom0_frame_list: AtomicU64::new(0),
                crash_info: CrashInfoRecord::new(),
                calls: Mutex::new(Vec::new()),
                stopped: (0..num_cpus).map(|_| AtomicBool::new(false)).collect(),
                halted: (0..num_cpus).map(|_| AtomicBool::new(false)).collect(),
                save_count: (0..num_cpus).map(|_| AtomicUsize::new(0)).collect(),
                self_nmi_count: (0..num_cpus).map(|_| AtomicUsize::new(0)).collect(),
                x2apic_recorded: Mutex::new(None),
                handler_installed: AtomicBool::new(false),
            }),
        }
    }

    pub fn ctx(&self) -> &'static CrashContext {
        self.inner.ctx
    }

    pub fn set_behavior(&self, cpu: usize, behavior: CpuBehavior) {
        self.inner.behavior.lock().unwrap()[cpu] = behavior;
    }

    pub fn set_apic_mode(&self, mode: ApicMode) {
        *self.inner.apic_mode.lock().unwrap() = mode;
    }

    pub fn set_revert_mode_on_stop(&self, revert: bool) {
        self.inner.revert_mode_on_stop.store(revert, Ordering::SeqCst);
    }

    pub fn set_double_nmi(&self, double: bool) {
        self.inner.double_nmi.store(double, Ordering::SeqCst);
    }

    /// Leave the device-list lock permanently held, as if its owner froze.
    pub fn freeze_pcidevs(&self) {
        self.inner.pcidevs_frozen.store(true, Ordering::SeqCst);
    }

    pub fn set_metadata(&self, hv_phys_start: u64, dom0_frame_list: u64) {
        self.inner.hv_phys_start.store(hv_phys_start, Ordering::SeqCst);
        self.inner
            .dom0_frame_list
            .store(dom0_frame_list, Ordering::SeqCst);
    }

    pub fn info(&self) -> &CrashInfoRecord {
        &self.inner.crash_info
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }

    /// Position of the first call matching `name` in the call log.
    pub fn call_index(&self, name: &str) -> Option<usize> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .iter()
            .position(|c| c == name)
    }

    pub fn was_halted(&self, cpu: usize) -> bool {
        self.inner.halted[cpu].load(Ordering::SeqCst)
    }

    pub fn was_stopped(&self, cpu: usize) -> bool {
        self.inner.stopped[cpu].load(Ordering::SeqCst)
    }

    pub fn save_count(&self, cpu: usize) -> usize {
        self.inner.save_count[cpu].load(Ordering::SeqCst)
    }

    pub fn self_nmi_count(&self, cpu: usize) -> usize {
        self.inner.self_nmi_count[cpu].load(Ordering::SeqCst)
    }

    pub fn x2apic_recorded(&self) -> Option<bool> {
        *self.inner.x2apic_recorded.lock().unwrap()
    }

    pub fn handler_installed(&self) -> bool {
        self.inner.handler_installed.load(Ordering::SeqCst)
    }

    fn log(&self, entry: String) {
        self.inner.calls.lock().unwrap().push(entry);
    }
}

impl CrashPlatform for MockPlatform {
    fn current_cpu(&self) -> usize {
        self.inner.coordinator
    }

    fn online_cpus(&self) -> CpuSet {
        let mut set = CpuSet::empty();
        for cpu in 0..self.inner.num_cpus {
            set.set(cpu);
        }
        set
    }

    fn cpu_online(&self, cpu: usize) -> bool {
        cpu < self.inner.num_cpus && !self.inner.stopped[cpu].load(Ordering::SeqCst)
    }

    fn disable_nmi_watchdog(&self) {
        self.log("disable_nmi_watchdog".into());
    }

    fn disable_local_irqs(&self) {
        self.log("disable_local_irqs".into());
    }

    fn reset_irq_nesting(&self, cpu: usize) {
        self.log(format!("reset_irq_nesting({})", cpu));
    }

    fn knock_out_nmi_vector(&self) {
        self.log("knock_out_nmi_vector".into());
    }

    fn disable_mce_ist(&self, cpu: usize) {
        self.log(format!("disable_mce_ist({})", cpu));
    }

    fn install_nmi_crash_handler(&self) {
        self.inner.handler_installed.store(true, Ordering::SeqCst);
        self.log("install_nmi_crash_handler".into());
    }

    fn broadcast_nmi_all_but_self(&self) {
        self.log("broadcast_nmi_all_but_self".into());
        assert!(
            self.handler_installed(),
            "broadcast sent before the crash handler was installed"
        );

        let rounds = if self.inner.double_nmi.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        let behavior = self.inner.behavior.lock().unwrap().clone();
        for cpu in 0..self.inner.num_cpus {
            if cpu == self.inner.coordinator {
                continue;
            }
            let delay_ms = match behavior[cpu] {
                CpuBehavior::Hung => continue,
                CpuBehavior::Responsive { delay_ms } => delay_ms,
            };
            for round in 0..rounds {
                let platform = self.clone();
                let ctx = self.inner.ctx;
                // A latched NMI is only redelivered once the first handler
                // entry has finished; concurrent entries on one CPU cannot
                // happen on hardware.
                let after_first = round > 0;
                thread::spawn(move || {
                    if delay_ms > 0 {
                        thread::sleep(Duration::from_millis(delay_ms));
                    }
                    if after_first {
                        while ctx.pending().contains(cpu) {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                    crash_nmi_handler(ctx, cpu, &platform);
                });
            }
        }
    }

    fn mdelay(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn save_processor_state(&self, cpu: usize) {
        self.inner.save_count[cpu].fetch_add(1, Ordering::SeqCst);
        self.log(format!("save_processor_state({})", cpu));
    }

    fn stop_local_cpu(&self, cpu: usize) {
        self.inner.stopped[cpu].store(true, Ordering::SeqCst);
        if cpu == self.inner.coordinator && self.inner.revert_mode_on_stop.load(Ordering::SeqCst) {
            *self.inner.apic_mode.lock().unwrap() = ApicMode::Unknown;
        }
        self.log(format!("stop_local_cpu({})", cpu));
    }

    fn local_apic_mode(&self) -> ApicMode {
        *self.inner.apic_mode.lock().unwrap()
    }

    fn record_x2apic_mode(&self, enabled: bool) {
        *self.inner.x2apic_recorded.lock().unwrap() = Some(enabled);
        self.log("record_x2apic_mode".into());
    }

    fn queue_self_nmi(&self, cpu: usize, _mode: ApicMode) {
        self.inner.self_nmi_count[cpu].fetch_add(1, Ordering::SeqCst);
    }

    fn console_force_unlock(&self) {
        self.log("console_force_unlock".into());
    }

    fn iommu_crash_shutdown(&self) {
        self.log("iommu_crash_shutdown".into());
    }

    fn iommu_quiesce(&self) {
        self.log("iommu_quiesce".into());
    }

    fn pcidevs_trylock(&self) -> bool {
        if self.inner.pcidevs_frozen.load(Ordering::SeqCst) {
            return false;
        }
        self.inner
            .pcidevs_locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn pcidevs_unlock(&self) {
        self.inner.pcidevs_locked.store(false, Ordering::SeqCst);
    }

    fn pci_disable_msi_all(&self) {
        self.log("pci_disable_msi_all".into());
    }

    fn disable_ioapic(&self) {
        self.log("disable_ioapic".into());
    }

    fn disable_hpet(&self) {
        self.log("disable_hpet".into());
    }

    fn crash_info(&self) -> &CrashInfoRecord {
        &self.inner.crash_info
    }

    fn hypervisor_phys_start(&self) -> u64 {
        self.inner.hv_phys_start.load(Ordering::SeqCst)
    }

    fn dom0_frame_list(&self) -> u64 {
        self.inner.dom0_frame_list.load(Ordering::SeqCst)
    }

    fn halt(&self, cpu: usize) {
        self.inner.halted[cpu].store(true, Ordering::SeqCst);
        // Remote handlers loop over this forever; keep their threads parked
        // without burning a core.
        if cpu != self.inner.coordinator {
            thread::sleep(Duration::from_millis(50));
        }
    }
}
