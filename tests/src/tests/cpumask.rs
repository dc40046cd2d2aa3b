//! CPU set type tests.

use crate::smp::types::{CpuMask, CpuSet, MAX_CPUS};

#[test]
fn test_included_sources_share_cpu_limit() {
    // The included hypervisor files and the local acpi stub must agree,
    // and the crash core's context must be sized to match.
    assert_eq!(MAX_CPUS, crate::acpi::MAX_CPUS);
    let ctx = crate::crash::core::CrashContext::new();
    assert!(!ctx.save_done(MAX_CPUS - 1));
    assert_eq!(
        crate::lapic::types::mode_from_apic_base(0),
        crate::lapic::types::ApicMode::Unknown
    );
}

#[test]
fn test_cpuset_empty() {
    let set = CpuSet::empty();
    assert!(set.is_empty());
    assert_eq!(set.count(), 0);
    assert!(!set.contains(0));
}

#[test]
fn test_cpuset_set_and_clear() {
    let mut set = CpuSet::empty();
    set.set(0);
    set.set(5);
    set.set(63);
    set.set(64);

    assert_eq!(set.count(), 4);
    assert!(set.contains(0));
    assert!(set.contains(5));
    assert!(set.contains(63));
    assert!(set.contains(64));
    assert!(!set.contains(1));

    set.clear(5);
    assert_eq!(set.count(), 3);
    assert!(!set.contains(5));
}

#[test]
fn test_cpuset_without() {
    let mut set = CpuSet::empty();
    set.set(0);
    set.set(1);
    set.set(2);

    let trimmed = set.without(1);
    assert!(trimmed.contains(0));
    assert!(!trimmed.contains(1));
    assert!(trimmed.contains(2));
    // The original is a value type and is unaffected
    assert!(set.contains(1));
}

#[test]
fn test_cpuset_iter_order() {
    let mut set = CpuSet::empty();
    set.set(64);
    set.set(3);
    set.set(1);

    let cpus: Vec<usize> = set.iter().collect();
    assert_eq!(cpus, vec![1, 3, 64]);
}

#[test]
fn test_cpuset_display() {
    let mut set = CpuSet::empty();
    set.set(1);
    set.set(3);
    set.set(64);
    assert_eq!(format!("{}", set), "1,3,64");

    assert_eq!(format!("{}", CpuSet::empty()), "");
}

#[test]
fn test_cpuset_highest_cpu() {
    let mut set = CpuSet::empty();
    set.set(MAX_CPUS - 1);
    assert!(set.contains(MAX_CPUS - 1));
    assert_eq!(set.count(), 1);
}

#[test]
fn test_cpumask_set_clear_contains() {
    let mask = CpuMask::new();
    assert!(mask.is_empty());

    mask.set(2);
    mask.set(70);
    assert!(mask.contains(2));
    assert!(mask.contains(70));
    assert_eq!(mask.count(), 2);

    mask.clear(2);
    assert!(!mask.contains(2));
    assert_eq!(mask.count(), 1);
}

#[test]
fn test_cpumask_reset_to() {
    let mask = CpuMask::new();
    mask.set(0);
    mask.set(1);

    let mut replacement = CpuSet::empty();
    replacement.set(5);
    replacement.set(130);

    mask.reset_to(&replacement);
    assert!(!mask.contains(0));
    assert!(!mask.contains(1));
    assert!(mask.contains(5));
    assert!(mask.contains(130));
    assert_eq!(mask.count(), 2);
}

#[test]
fn test_cpumask_snapshot_is_detached() {
    let mask = CpuMask::new();
    mask.set(7);

    let snap = mask.snapshot();
    mask.clear(7);

    assert!(snap.contains(7));
    assert!(!mask.contains(7));
}
