use crate::memory::cpu_local_data::get_local;
use crate::memory::guarded_stack::{EXCEPTION_HANDLER_STACK_SIZE, GuardedStack};
use core::cell::UnsafeCell;
use num_enum::IntoPrimitive;
use x86_64::instructions::segmentation::{CS, SS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

/// IST (Interrupt Stack Table) slots. Every CPU runs entirely in ring 0, so
/// the only reason to switch stacks on entry is a genuinely exceptional
/// fault — one that may have interrupted a thread with a corrupt or
/// exhausted stack of its own.
#[derive(Debug, IntoPrimitive)]
#[repr(u8)]
pub enum IstStackIndexes {
    Exception,
}

pub struct Gdt {
    gdt: GlobalDescriptorTable,
    kernel_code_selector: SegmentSelector,
    kernel_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

pub fn init() {
    let local = get_local();
    let tss_cell = local.tss.call_once(|| {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[u8::from(IstStackIndexes::Exception) as usize] =
            GuardedStack::new(EXCEPTION_HANDLER_STACK_SIZE).top();
        UnsafeCell::new(tss)
    });

    // Safety: shared reference only, for building the TSS descriptor below.
    let tss = unsafe { &*tss_cell.get() };

    let gdt = local.gdt.call_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code_selector = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(tss));
        Gdt {
            gdt,
            kernel_code_selector,
            kernel_data_selector,
            tss_selector,
        }
    });

    gdt.gdt.load();

    unsafe { CS::set_reg(gdt.kernel_code_selector) };
    unsafe { SS::set_reg(gdt.kernel_data_selector) };
    unsafe { load_tss(gdt.tss_selector) };
}
