use crate::memory::cpu_local_data::{get_local, local_apic_id_of, try_get_local, CURRENT_CONTEXT_PTR_OFFSET};
use crate::sched::scheduler;
use crate::sched::thread::{
    CpuContext, CTX_CS, CTX_R10, CTX_R11, CTX_R12, CTX_R13, CTX_R14, CTX_R15, CTX_R8, CTX_R9,
    CTX_RAX, CTX_RBP, CTX_RBX, CTX_RCX, CTX_RDI, CTX_RDX, CTX_RFLAGS, CTX_RIP, CTX_RSI, CTX_RSP,
    CTX_SS,
};
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

use crate::interrupt::nmi_handler_state::{NmiHandlerState, NMI_HANDLER_STATES};

pub static TIMER_INTERRUPT_COUNT: AtomicU64 = AtomicU64::new(0);

pub extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let accessed_address = Cr2::read_raw();
    panic!(
        "Page fault at {:#x}, error: {error_code:#?}, ip: {:#x}. Stack frame: {stack_frame:#?}",
        accessed_address,
        stack_frame.instruction_pointer.as_u64()
    );
}

pub extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!("General Protection Fault! Stack frame: {stack_frame:#?}. Error code: {error_code}.")
}

pub extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!("Double Fault! Stack frame: {stack_frame:#?}. Error code: {error_code}.")
}

pub extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::info!("Breakpoint! Stack frame: {stack_frame:#?}");
}

pub extern "x86-interrupt" fn nmi_handler(_stack_frame: InterruptStackFrame) {
    handle_panic_from_other_cpu()
}

/// Fired to break a CPU out of the `hlt` in `find_runnable`'s idle loop.
/// Carries no payload — the idle loop just re-polls both run queues once
/// it returns.
pub extern "x86-interrupt" fn reschedule_handler(_stack_frame: InterruptStackFrame) {
    let cpu = get_local();
    unsafe { (&mut *cpu.local_apic.get().unwrap().get()).end_of_interrupt() };
}

/// The LAPIC's configured spurious vector: raised when the local APIC
/// sampled for an interrupt to deliver and found none still pending. Per
/// the APIC spec this never needs an EOI.
pub extern "x86-interrupt" fn spurious_interrupt_handler(_stack_frame: InterruptStackFrame) {}

/// Sends EOI and runs the scheduler's tick handler, which either returns
/// the still-running thread's own context (spurious/no-op) or the next
/// thread to dispatch.
extern "C" fn timer_tick_inner() -> *mut CpuContext {
    let cpu = get_local();
    crate::time::on_timer_tick();
    unsafe { (&mut *cpu.local_apic.get().unwrap().get()).end_of_interrupt() };
    TIMER_INTERRUPT_COUNT.fetch_add(1, Ordering::Relaxed);
    scheduler::on_tick(cpu)
}

extern "C" fn yield_inner() -> *mut CpuContext {
    scheduler::on_yield(get_local())
}

extern "C" fn park_inner() -> *mut CpuContext {
    scheduler::on_park(get_local())
}

extern "C" fn drop_inner() -> *mut CpuContext {
    scheduler::on_drop(get_local())
}

/// Generates a naked trampoline that saves the full GPR + iretq frame of
/// whatever is running into its `CpuContext`, calls `$inner` (which
/// returns the next thread's `CpuContext` pointer, possibly the same
/// one), and restores that context before `iretq`.
///
/// If no thread has ever been dispatched on this CPU yet
/// (`current_context_ptr` is still null — true only the first time the
/// timer fires on a freshly started CPU), the save is skipped and `$inner`
/// is trusted to pick a first thread to run with nothing of its own to
/// save.
macro_rules! context_switch_trampoline {
    ($name:ident, $inner:path) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                // Preserve the caller's r11 on the stack before using it as
                // the context-pointer scratch register. Frame is now
                // [r11][rip][cs][rflags][rsp][ss].
                "push r11",
                "mov r11, gs:[{ctx_ptr_offset}]",
                "test r11, r11",
                "jz 2f",

                "mov [r11 + {CTX_RAX}], rax",
                "mov [r11 + {CTX_R15}], r15",
                "mov [r11 + {CTX_R14}], r14",
                "mov [r11 + {CTX_R13}], r13",
                "mov [r11 + {CTX_R12}], r12",
                "mov rax, [rsp]",
                "mov [r11 + {CTX_R11}], rax",
                "mov [r11 + {CTX_R10}], r10",
                "mov [r11 + {CTX_R9}], r9",
                "mov [r11 + {CTX_R8}], r8",
                "mov [r11 + {CTX_RDI}], rdi",
                "mov [r11 + {CTX_RSI}], rsi",
                "mov [r11 + {CTX_RBP}], rbp",
                "mov [r11 + {CTX_RBX}], rbx",
                "mov [r11 + {CTX_RDX}], rdx",
                "mov [r11 + {CTX_RCX}], rcx",

                // iretq frame, now at rsp+8: [8]=rip [16]=cs [24]=rflags [32]=rsp [40]=ss
                "mov rax, [rsp + 8]",
                "mov [r11 + {CTX_RIP}], rax",
                "mov rax, [rsp + 16]",
                "mov [r11 + {CTX_CS}], rax",
                "mov rax, [rsp + 24]",
                "mov [r11 + {CTX_RFLAGS}], rax",
                "mov rax, [rsp + 32]",
                "mov [r11 + {CTX_RSP}], rax",
                "mov rax, [rsp + 40]",
                "mov [r11 + {CTX_SS}], rax",

                "2:",
                "call {inner}",
                // rax = next context pointer
                "mov gs:[{ctx_ptr_offset}], rax",
                "mov r11, rax",

                "mov rax, [r11 + {CTX_RIP}]",
                "mov [rsp + 8], rax",
                "mov rax, [r11 + {CTX_CS}]",
                "mov [rsp + 16], rax",
                "mov rax, [r11 + {CTX_RFLAGS}]",
                "mov [rsp + 24], rax",
                "mov rax, [r11 + {CTX_RSP}]",
                "mov [rsp + 32], rax",
                "mov rax, [r11 + {CTX_SS}]",
                "mov [rsp + 40], rax",

                "mov r15, [r11 + {CTX_R15}]",
                "mov r14, [r11 + {CTX_R14}]",
                "mov r13, [r11 + {CTX_R13}]",
                "mov r12, [r11 + {CTX_R12}]",
                "mov r10, [r11 + {CTX_R10}]",
                "mov r9, [r11 + {CTX_R9}]",
                "mov r8, [r11 + {CTX_R8}]",
                "mov rdi, [r11 + {CTX_RDI}]",
                "mov rsi, [r11 + {CTX_RSI}]",
                "mov rbp, [r11 + {CTX_RBP}]",
                "mov rbx, [r11 + {CTX_RBX}]",
                "mov rdx, [r11 + {CTX_RDX}]",
                "mov rcx, [r11 + {CTX_RCX}]",
                "mov rax, [r11 + {CTX_RAX}]",
                "mov r11, [r11 + {CTX_R11}]",

                "add rsp, 8",
                "iretq",

                inner = sym $inner,
                ctx_ptr_offset = const CURRENT_CONTEXT_PTR_OFFSET,
                CTX_R15 = const CTX_R15,
                CTX_R14 = const CTX_R14,
                CTX_R13 = const CTX_R13,
                CTX_R12 = const CTX_R12,
                CTX_R11 = const CTX_R11,
                CTX_R10 = const CTX_R10,
                CTX_R9 = const CTX_R9,
                CTX_R8 = const CTX_R8,
                CTX_RDI = const CTX_RDI,
                CTX_RSI = const CTX_RSI,
                CTX_RBP = const CTX_RBP,
                CTX_RBX = const CTX_RBX,
                CTX_RDX = const CTX_RDX,
                CTX_RCX = const CTX_RCX,
                CTX_RAX = const CTX_RAX,
                CTX_RIP = const CTX_RIP,
                CTX_CS = const CTX_CS,
                CTX_RFLAGS = const CTX_RFLAGS,
                CTX_RSP = const CTX_RSP,
                CTX_SS = const CTX_SS,
            );
        }
    };
}

context_switch_trampoline!(timer_interrupt_handler, timer_tick_inner);
context_switch_trampoline!(yield_interrupt_handler, yield_inner);
context_switch_trampoline!(park_interrupt_handler, park_inner);
context_switch_trampoline!(drop_interrupt_handler, drop_inner);

// -- NMI ---
pub fn handle_panic_from_other_cpu() -> ! {
    if let Some(local) = try_get_local()
        && let Some(nmi_handler_states) = NMI_HANDLER_STATES.get()
    {
        let local_apic = unsafe {
            &mut *local
                .local_apic
                .get()
                .expect("local APIC not initialized")
                .get()
        };

        for (cpu_id, nmi_handler_state) in nmi_handler_states
            .iter()
            .enumerate()
            .filter(|(cpu_id, _)| *cpu_id as u32 != local.kernel_id)
        {
            if nmi_handler_state.swap(
                NmiHandlerState::KernelPanicked,
                Ordering::Release,
            ) == NmiHandlerState::NmiHandlerSet
            {
                unsafe {
                    local_apic.send_nmi(local_apic_id_of(cpu_id as u32));
                }
            }
        }
    }

    crate::hlt_loop()
}
