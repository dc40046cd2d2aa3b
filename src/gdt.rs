//! Global Descriptor Table and TSS setup.
//!
//! Three faults get dedicated IST stacks: #DF (stack corruption must not
//! cascade into a triple fault), #NMI (the shootdown signal can land while
//! any stack is live) and #MC. The crash path later strips the #MC entry —
//! see `interrupts::idt::disable_mce_ist` for why.

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SS;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST slot for the double fault handler
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
/// IST slot for the NMI handler
pub const NMI_IST_INDEX: u16 = 1;
/// IST slot for the machine check handler
pub const MCE_IST_INDEX: u16 = 2;

const STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct AlignedStack {
    bytes: [u8; STACK_SIZE],
}

static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack {
    bytes: [0; STACK_SIZE],
};
static mut NMI_STACK: AlignedStack = AlignedStack {
    bytes: [0; STACK_SIZE],
};
static mut MCE_STACK: AlignedStack = AlignedStack {
    bytes: [0; STACK_SIZE],
};

fn stack_top(stack: *const AlignedStack) -> VirtAddr {
    VirtAddr::new(stack as u64 + STACK_SIZE as u64)
}

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            stack_top(core::ptr::addr_of!(DOUBLE_FAULT_STACK));
        tss.interrupt_stack_table[NMI_IST_INDEX as usize] =
            stack_top(core::ptr::addr_of!(NMI_STACK));
        tss.interrupt_stack_table[MCE_IST_INDEX as usize] =
            stack_top(core::ptr::addr_of!(MCE_STACK));
        tss
    };
}

pub struct Selectors {
    pub code: SegmentSelector,
    pub data: SegmentSelector,
    pub tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code = gdt.append(Descriptor::kernel_code_segment());
        let data = gdt.append(Descriptor::kernel_data_segment());
        let tss = gdt.append(Descriptor::tss_segment(&TSS));
        (gdt, Selectors { code, data, tss })
    };
}

pub fn init() {
    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.code);
        SS::set_reg(GDT.1.data);
        load_tss(GDT.1.tss);
    }
    crate::kinfo!("GDT loaded with IST stacks for #DF/#NMI/#MC");
}
