//! Interrupt handling: IDT setup, NMI dispatch, crash-time rewiring.

pub mod idt;
pub mod nmi;

pub use idt::{disable_mce_ist, init, is_idt_initialized, knock_out_nmi_vector};
pub use nmi::{set_nmi_callback, NmiCrashCallback};
