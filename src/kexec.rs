//! Crash dump handoff state.
//!
//! Holds what the secondary capture kernel needs: one register snapshot per
//! stopped CPU and the metadata record telling it where the hypervisor image
//! and the privileged domain's frame-list-of-lists live. Encoding the dump
//! image itself is the loader's problem, not ours.

use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::crash::CrashInfoRecord;
use crate::smp::MAX_CPUS;

/// Register snapshot taken on a CPU as it stops.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CrashRegs {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

impl CrashRegs {
    const fn zeroed() -> Self {
        Self {
            rip: 0,
            rsp: 0,
            rbp: 0,
            rflags: 0,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
        }
    }
}

static mut CRASH_REGS: [CrashRegs; MAX_CPUS] = [CrashRegs::zeroed(); MAX_CPUS];

const FLAG: AtomicBool = AtomicBool::new(false);
static REGS_VALID: [AtomicBool; MAX_CPUS] = [FLAG; MAX_CPUS];

static CRASH_INFO: CrashInfoRecord = CrashInfoRecord::new();

/// The metadata record read later by the secondary-kernel loader.
pub fn crash_info() -> &'static CrashInfoRecord {
    &CRASH_INFO
}

/// Snapshot this CPU's state into the pending crash image.
///
/// Caller guarantees at-most-once invocation per CPU; the slot is owned
/// exclusively by that CPU.
pub fn crash_save_cpu(cpu: usize) {
    if cpu >= MAX_CPUS {
        return;
    }

    let mut regs = CrashRegs::zeroed();
    unsafe {
        asm!("lea {0}, [rip + 0]", out(reg) regs.rip);
        asm!("mov {0}, rsp", out(reg) regs.rsp);
        asm!("mov {0}, rbp", out(reg) regs.rbp);
        asm!("pushf; pop {0}", out(reg) regs.rflags);
        asm!("mov {0}, cr0", out(reg) regs.cr0);
        asm!("mov {0}, cr2", out(reg) regs.cr2);
        asm!("mov {0}, cr3", out(reg) regs.cr3);
        asm!("mov {0}, cr4", out(reg) regs.cr4);

        core::ptr::addr_of_mut!(CRASH_REGS[cpu]).write(regs);
    }
    REGS_VALID[cpu].store(true, Ordering::SeqCst);
}

pub fn cpu_state(cpu: usize) -> Option<CrashRegs> {
    if cpu >= MAX_CPUS || !REGS_VALID[cpu].load(Ordering::SeqCst) {
        return None;
    }
    Some(unsafe { core::ptr::addr_of!(CRASH_REGS[cpu]).read() })
}
