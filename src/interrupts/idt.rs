//! IDT initialization and crash-time vector rewiring.
//!
//! The table itself is the usual lazy_static (an
//! `InterruptDescriptorTable` is ~4KB and would overflow the boot stack if
//! built inline). Two entries matter to the crash path: the NMI gate, which
//! the coordinator rebinds to a no-op on its own CPU, and the machine-check
//! gate, whose IST attribute is stripped on every CPU before shutdown.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::gdt;
use crate::interrupts::nmi;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

static IDT_INITIALIZED: AtomicBool = AtomicBool::new(false);

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::kinfo!("BREAKPOINT: {:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    crate::kerror!("PAGE FAULT");
    crate::kerror!("Accessed Address: {:?}", Cr2::read());
    crate::kerror!("Error Code: {:?}", error_code);
    crate::kerror!("{:#?}", stack_frame);
    crate::smp::halt_loop();
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    crate::kerror!("GENERAL PROTECTION FAULT");
    crate::kerror!("Error Code: {:#x}", error_code);
    crate::kerror!("{:#?}", stack_frame);
    crate::smp::halt_loop();
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    panic!("EXCEPTION: DIVIDE ERROR\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    panic!("EXCEPTION: INVALID OPCODE\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!(
        "EXCEPTION: DOUBLE FAULT (error: {})\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    panic!("EXCEPTION: MACHINE CHECK\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn spurious_irq_handler(_stack_frame: InterruptStackFrame) {
    let cpu = crate::smp::current_cpu();
    crate::smp::irq_enter(cpu);
    crate::lapic::send_eoi();
    crate::smp::irq_exit(cpu);
}

/// The live IDT. Kept behind an `UnsafeCell` because the crash path rewrites
/// two gates in place after the table has been loaded; mutation goes through
/// the cell, never through a reference derived from a shared borrow.
struct IdtStore(UnsafeCell<InterruptDescriptorTable>);

// All post-load mutation is funneled through the single-rewriter paths below.
unsafe impl Sync for IdtStore {}

lazy_static! {
    static ref IDT: IdtStore = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);

        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            idt.non_maskable_interrupt
                .set_handler_fn(nmi::nmi_handler)
                .set_stack_index(gdt::NMI_IST_INDEX);
            idt.machine_check
                .set_handler_fn(machine_check_handler)
                .set_stack_index(gdt::MCE_IST_INDEX);
        }

        // Anything that still arrives through the masked 8259 pair
        for vector in PIC_1_OFFSET..PIC_2_OFFSET + 8 {
            idt[vector].set_handler_fn(spurious_irq_handler);
        }

        IdtStore(UnsafeCell::new(idt))
    };
}

/// Load the IDT and mask the legacy PICs; external interrupts are routed
/// through the IO-APIC.
pub fn init() {
    // The table lives in a static, so its address is stable for the
    // lifetime the CPU needs.
    unsafe {
        (*IDT.0.get()).load_unsafe();
    }
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.disable();
    }
    IDT_INITIALIZED.store(true, Ordering::SeqCst);
    crate::kinfo!("IDT loaded (NMI/MC on dedicated stacks, legacy PICs masked)");
}

pub fn is_idt_initialized() -> bool {
    IDT_INITIALIZED.load(Ordering::SeqCst)
}

// The IDT is referenced live by the CPU; rewriting an entry in place takes
// effect on the next delivery of that vector, no reload needed.

static MCE_IST_DISABLED: AtomicBool = AtomicBool::new(false);

/// Strip the IST attribute from the machine-check gate.
///
/// Clearing MCIP and receiving a fresh #MC race; with a dedicated stack the
/// new exception frame would clobber the one still in use and wedge the CPU
/// in a fault loop the (soon to be disarmed) watchdog can no longer break.
/// Rebinding the handler resets the gate options, dropping the IST index.
/// The table is shared, so the first caller rewrites it and the rest are
/// no-ops; CPU-side reads of the gate do not participate in Rust aliasing.
pub fn disable_mce_ist() {
    if MCE_IST_DISABLED.swap(true, Ordering::SeqCst) {
        return;
    }
    unsafe {
        (*IDT.0.get())
            .machine_check
            .set_handler_fn(machine_check_handler);
    }
}

/// Rebind the NMI gate to a no-op handler.
///
/// The coordinator must not be dragged into the remote shutdown handler by
/// its own vector once the crash callback is registered globally. Only the
/// coordinator calls this, and it does so before the broadcast.
pub fn knock_out_nmi_vector() {
    unsafe {
        (*IDT.0.get())
            .non_maskable_interrupt
            .set_handler_fn(nmi::nmi_nop_handler);
    }
}
