//! Crash shutdown sequence tests.
//!
//! The mock platform runs every non-coordinator CPU on a real thread, so
//! these exercise the genuine coordinator/remote-handler interplay including
//! the wall-clock shootdown timeout. Timing-sensitive tests are serialized
//! to keep thread scheduling honest.

use std::thread;
use std::time::Duration;

use serial_test::serial;

use crate::crash::core::{
    machine_crash_shutdown, nmi_shootdown_cpus, CrashInfoRecord, CrashPlatform,
    SHOOTDOWN_TIMEOUT_MS,
};
use crate::lapic::types::ApicMode;
use crate::mock::{CpuBehavior, MockPlatform};

/// Poll until `cond` holds, for conditions the remote threads satisfy just
/// after they clear their pending bit.
fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for: {}", what);
}

// =============================================================================
// Shootdown: pending set and timeout
// =============================================================================

#[test]
#[serial]
fn test_shootdown_stops_all_responsive_cpus() {
    let p = MockPlatform::new(4);
    let report = machine_crash_shutdown(p.ctx(), &p);

    assert!(report.all_stopped());
    assert!(report.waited_ms() < SHOOTDOWN_TIMEOUT_MS);
    assert!(p.ctx().pending().is_empty());

    for cpu in 1..4 {
        assert_eq!(p.save_count(cpu), 1, "CPU {} state saved once", cpu);
        assert!(p.was_stopped(cpu), "CPU {} stopped", cpu);
        assert!(p.ctx().save_done(cpu));
    }
    // The coordinator never runs the remote handler
    assert_eq!(p.save_count(0), 0);
    assert!(!p.ctx().save_done(0));
}

#[test]
#[serial]
fn test_hung_cpu_times_out_and_is_reported() {
    let p = MockPlatform::new(3);
    p.set_behavior(2, CpuBehavior::Hung);

    let report = machine_crash_shutdown(p.ctx(), &p);

    assert!(!report.all_stopped());
    assert!(report.stragglers().contains(2));
    assert!(!report.stragglers().contains(1));
    assert_eq!(report.stragglers().count(), 1);
    // Full timeout burned waiting for the hung CPU
    assert_eq!(report.waited_ms(), SHOOTDOWN_TIMEOUT_MS);
    assert!(p.ctx().pending().contains(2));

    // Shared-device teardown proceeds regardless of stragglers
    assert!(p.call_index("iommu_crash_shutdown").is_some());
    assert!(p.call_index("disable_ioapic").is_some());
    assert!(p.call_index("disable_hpet").is_some());
    assert!(p.call_index("iommu_quiesce").is_some());
    // ...and so does the metadata handoff
    assert!(p.info().is_populated());
}

#[test]
#[serial]
fn test_slow_cpu_is_waited_for() {
    let p = MockPlatform::new(2);
    p.set_behavior(1, CpuBehavior::Responsive { delay_ms: 200 });

    let report = machine_crash_shutdown(p.ctx(), &p);

    assert!(report.all_stopped());
    assert!(report.waited_ms() >= 50, "poll loop actually waited");
    assert!(report.waited_ms() < SHOOTDOWN_TIMEOUT_MS);
    assert_eq!(p.save_count(1), 1);
}

#[test]
#[serial]
fn test_duplicate_nmi_saves_state_once() {
    let p = MockPlatform::new(3);
    p.set_double_nmi(true);

    let report = machine_crash_shutdown(p.ctx(), &p);

    assert!(report.all_stopped());
    // The redelivered NMI reaches the handler tail (it queues another
    // self-NMI) but must skip the save-and-stop step.
    wait_until("redelivered NMIs handled", || {
        p.self_nmi_count(1) >= 2 && p.self_nmi_count(2) >= 2
    });
    assert_eq!(p.save_count(1), 1);
    assert_eq!(p.save_count(2), 1);
}

// =============================================================================
// Remote handler tail: halt and self-NMI re-arm
// =============================================================================

#[test]
#[serial]
fn test_remote_cpus_rearm_and_halt() {
    let p = MockPlatform::new(3);

    let report = machine_crash_shutdown(p.ctx(), &p);
    assert!(report.all_stopped());

    wait_until("remote CPUs halted", || p.was_halted(1) && p.was_halted(2));
    assert!(p.self_nmi_count(1) >= 1, "CPU 1 queued a self-NMI");
    assert!(p.self_nmi_count(2) >= 1, "CPU 2 queued a self-NMI");
}

#[test]
#[serial]
fn test_unknown_mode_skips_self_nmi_but_still_halts() {
    let p = MockPlatform::new(2);
    p.set_apic_mode(ApicMode::Unknown);

    let report = machine_crash_shutdown(p.ctx(), &p);
    assert!(report.all_stopped());

    wait_until("remote CPU halted", || p.was_halted(1));
    assert_eq!(p.self_nmi_count(1), 0);
    assert_eq!(p.x2apic_recorded(), Some(false));
}

// =============================================================================
// Coordinator: addressing-mode sampling and teardown ordering
// =============================================================================

#[test]
fn test_apic_mode_sampled_before_local_stop() {
    let p = MockPlatform::new(1);
    p.set_apic_mode(ApicMode::X2Apic);
    // Stopping the local APIC reverts the controller; the sample must
    // predate that.
    p.set_revert_mode_on_stop(true);

    machine_crash_shutdown(p.ctx(), &p);

    assert_eq!(p.x2apic_recorded(), Some(true));
    assert_eq!(p.local_apic_mode(), ApicMode::Unknown);
}

#[test]
fn test_teardown_ordering() {
    let p = MockPlatform::new(1);
    let report = nmi_shootdown_cpus(p.ctx(), &p);
    assert!(report.all_stopped());

    let order = [
        "disable_nmi_watchdog",
        "disable_local_irqs",
        "knock_out_nmi_vector",
        "disable_mce_ist(0)",
        "install_nmi_crash_handler",
        "broadcast_nmi_all_but_self",
        "console_force_unlock",
        "iommu_crash_shutdown",
        "stop_local_cpu(0)",
        "record_x2apic_mode",
        "pci_disable_msi_all",
        "disable_ioapic",
        "disable_hpet",
        "iommu_quiesce",
    ];
    let mut last = 0;
    for name in order {
        let index = p
            .call_index(name)
            .unwrap_or_else(|| panic!("{} was never called", name));
        assert!(index >= last, "{} called out of order", name);
        last = index;
    }
}

#[test]
fn test_frozen_device_lock_skips_msi_teardown() {
    let p = MockPlatform::new(1);
    p.freeze_pcidevs();

    nmi_shootdown_cpus(p.ctx(), &p);

    assert!(p.call_index("pci_disable_msi_all").is_none());
    // The rest of the quiesce still happens
    assert!(p.call_index("disable_ioapic").is_some());
    assert!(p.call_index("disable_hpet").is_some());
    assert!(p.call_index("iommu_quiesce").is_some());
}

// =============================================================================
// Metadata record
// =============================================================================

#[test]
fn test_metadata_recorded_from_platform() {
    let p = MockPlatform::new(1);
    p.set_metadata(0x0020_0000, 0x1234);

    machine_crash_shutdown(p.ctx(), &p);

    assert!(p.info().is_populated());
    assert_eq!(p.info().hv_phys_start(), 0x0020_0000);
    assert_eq!(p.info().dom0_frame_list(), 0x1234);
}

#[test]
fn test_crash_info_record_is_write_once() {
    let record = CrashInfoRecord::new();
    assert!(!record.is_populated());

    record.record(0x1000, 0x2000);
    assert!(record.is_populated());
    assert_eq!(record.hv_phys_start(), 0x1000);
    assert_eq!(record.dom0_frame_list(), 0x2000);

    // Second writer loses
    record.record(0xDEAD, 0xBEEF);
    assert_eq!(record.hv_phys_start(), 0x1000);
    assert_eq!(record.dom0_frame_list(), 0x2000);
}

#[test]
fn test_shootdown_report_accessors() {
    let p = MockPlatform::new(1);
    let report = nmi_shootdown_cpus(p.ctx(), &p);

    assert!(report.all_stopped());
    assert!(report.stragglers().is_empty());
    assert_eq!(report.waited_ms(), 0);
}
