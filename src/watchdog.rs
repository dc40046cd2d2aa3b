//! LAPIC NMI watchdog.
//!
//! A performance counter is programmed to overflow periodically and deliver
//! an NMI, proving each CPU still takes interrupts. The crash path disarms
//! it first thing: its heartbeat NMIs would be indistinguishable from the
//! shootdown signal about to be repurposed on the same vector.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::lapic;
use crate::smp::MAX_CPUS;

static ENABLED: AtomicBool = AtomicBool::new(false);

const ZERO: AtomicU64 = AtomicU64::new(0);
static HEARTBEATS: [AtomicU64; MAX_CPUS] = [ZERO; MAX_CPUS];

pub fn setup() {
    lapic::arm_perf_counter_nmi();
    ENABLED.store(true, Ordering::SeqCst);
    crate::kinfo!("Watchdog: LAPIC NMI watchdog armed");
}

/// Disarm the watchdog on the local CPU.
pub fn disable() {
    lapic::mask_perf_counter_lvt();
    ENABLED.store(false, Ordering::SeqCst);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

pub fn nmi_heartbeat(cpu: usize) {
    if ENABLED.load(Ordering::SeqCst) {
        HEARTBEATS[cpu].fetch_add(1, Ordering::Relaxed);
    }
}

pub fn heartbeat_count(cpu: usize) -> u64 {
    HEARTBEATS[cpu].load(Ordering::Relaxed)
}
