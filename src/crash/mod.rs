//! Fatal-error machine shutdown.

pub mod core;
pub mod platform;

pub use self::core::{
    CrashContext, CrashInfoRecord, CrashPlatform, ShootdownReport, SHOOTDOWN_POLL_MS,
    SHOOTDOWN_TIMEOUT_MS,
};
pub use self::platform::{
    context, machine_crash_shutdown, set_dom0_frame_list, set_hypervisor_phys_start,
    x2apic_enabled,
};
