use num_enum::IntoPrimitive;

pub mod idt;
pub mod nmi_handler_state;
mod handlers;

pub use handlers::{handle_panic_from_other_cpu, TIMER_INTERRUPT_COUNT};

#[derive(Debug, Clone, Copy, IntoPrimitive)]
#[repr(u8)]
pub enum InterruptVector {
    /// The preemption tick. Fixed at 0x20, the first vector past the CPU
    /// exception range.
    LocalApicTimer = 0x20,
    LocalApicError,
    /// IPI sent to wake a CPU parked in `find_runnable`'s `hlt` once work
    /// lands on its local or the global run queue. Carries no work of its
    /// own — the `hlt` simply returns and the idle loop re-polls.
    Reschedule = 0x30,
    /// Software interrupts a thread traps into to leave the CPU
    /// voluntarily. Each has its own trampoline that saves the full
    /// register file before handing off to the matching `scheduler::on_*`.
    Yield = 0xf1,
    Park,
    Drop,
    /// The LAPIC's own spurious vector, fixed at the top of the range per
    /// the APIC spec's convention of reserving the lowest 4 bits as 1111.
    LocalApicSpurious = 0xff,
}
