use core::sync::atomic::Ordering;
use x86_64::VirtAddr;
use x86_64::structures::idt::InterruptDescriptorTable;
use crate::gdt::IstStackIndexes;
use crate::interrupt::handlers::{
    breakpoint_handler, double_fault_handler, drop_interrupt_handler,
    general_protection_fault_handler, handle_panic_from_other_cpu, nmi_handler,
    page_fault_handler, park_interrupt_handler, reschedule_handler, spurious_interrupt_handler,
    timer_interrupt_handler, yield_interrupt_handler,
};
use crate::interrupt::InterruptVector;
use crate::interrupt::nmi_handler_state::{NmiHandlerState, NMI_HANDLER_STATES};
use crate::memory::cpu_local_data::get_local;

pub fn init() {
    let idt = get_local().idt.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        unsafe {
            idt.page_fault
                .set_handler_fn(page_fault_handler)
                .set_stack_index(u8::from(IstStackIndexes::Exception).into())
        };
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(u8::from(IstStackIndexes::Exception).into())
        };
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);

        idt[u8::from(InterruptVector::Reschedule)].set_handler_fn(reschedule_handler);
        idt[u8::from(InterruptVector::LocalApicSpurious)].set_handler_fn(spurious_interrupt_handler);

        // The scheduler's trap vectors are naked trampolines, not
        // `extern "x86-interrupt"` functions — they manage the iretq frame
        // themselves, so they're wired in by raw address rather than
        // `set_handler_fn`.
        idt[u8::from(InterruptVector::LocalApicTimer)]
            .set_handler_addr(VirtAddr::new(timer_interrupt_handler as u64));
        idt[u8::from(InterruptVector::Yield)]
            .set_handler_addr(VirtAddr::new(yield_interrupt_handler as u64));
        idt[u8::from(InterruptVector::Park)]
            .set_handler_addr(VirtAddr::new(park_interrupt_handler as u64));
        idt[u8::from(InterruptVector::Drop)]
            .set_handler_addr(VirtAddr::new(drop_interrupt_handler as u64));

        idt
    });
    idt.load();

    // Update state to available to receive NMIs
    let local = get_local();
    if NMI_HANDLER_STATES.get().unwrap()[local.kernel_id as usize]
        .compare_exchange(
            NmiHandlerState::NmiHandlerNotSet,
            NmiHandlerState::NmiHandlerSet,
            Ordering::Relaxed,
            Ordering::Relaxed,
        )
        .is_err()
    {
        // Kernel already panicked
        handle_panic_from_other_cpu()
    }
}
