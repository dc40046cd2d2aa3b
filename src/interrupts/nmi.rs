//! NMI dispatch.
//!
//! NMIs normally carry the watchdog heartbeat. During a crash the shootdown
//! code registers a diverging callback here; every NMI arriving after that
//! point funnels the receiving CPU into the crash handler and never returns.

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use x86_64::structures::idt::InterruptStackFrame;

/// Crash-time NMI callback. Once installed it owns every NMI in the system
/// and must not return.
pub type NmiCrashCallback = fn(cpu: usize) -> !;

static NMI_CALLBACK: AtomicUsize = AtomicUsize::new(0);

pub fn set_nmi_callback(callback: NmiCrashCallback) {
    NMI_CALLBACK.store(callback as usize, Ordering::SeqCst);
}

pub(crate) extern "x86-interrupt" fn nmi_handler(_frame: InterruptStackFrame) {
    let raw = NMI_CALLBACK.load(Ordering::SeqCst);
    if raw != 0 {
        let callback: NmiCrashCallback = unsafe { mem::transmute(raw) };
        callback(crate::smp::current_cpu());
    }
    crate::watchdog::nmi_heartbeat(crate::smp::current_cpu());
}

/// No-op NMI gate.
///
/// The crash coordinator binds this over its own NMI vector so that a stray
/// NMI cannot divert it into the remote shutdown handler meant for the other
/// CPUs.
pub(crate) extern "x86-interrupt" fn nmi_nop_handler(_frame: InterruptStackFrame) {}
