use crate::gdt::Gdt;
use crate::limine_requests::MP_REQUEST;
use crate::sched::run_queue::LocalRunQueue;
use crate::sched::thread::{CpuContext, Thread};
use crate::sched::timer::TimerHeap;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::{Cell, UnsafeCell};
use core::mem::offset_of;
use core::ptr::NonNull;
use atomic_enum::atomic_enum;
use core::sync::atomic::{AtomicPtr, AtomicU64};
use force_send_sync::SendSync;
use limine::mp::Cpu;
use limine::response::MpResponse;
use spin::{Lazy, Mutex, Once};
use x2apic::lapic::LocalApic;
use x86_64::VirtAddr;
use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::structures::tss::TaskStateSegment;

#[atomic_enum]
#[derive(PartialEq)]
pub enum CpuState {
    /// Hardware init in progress (GDT/IDT/APIC/run-queue not all done yet).
    Initializing,
    /// Fully initialized — timer armed, interrupts about to be / are enabled.
    /// Threads may be dispatched to this CPU.
    Ready,
    /// This CPU has panicked and should be ignored by the scheduler.
    Crashed,
}

pub struct CpuLocalData {
    pub kernel_id: u32,
    pub local_apic_id: u32,

    pub tss: Once<UnsafeCell<TaskStateSegment>>,
    pub gdt: Once<Gdt>,
    pub idt: Once<InterruptDescriptorTable>,

    pub local_apic: Once<UnsafeCell<SendSync<LocalApic>>>,

    /// This CPU's run queue and timer wheel.
    pub local_run_queue: LocalRunQueue,
    pub timers: TimerHeap,

    /// The thread currently running on this CPU, if any.
    pub current_thread: Mutex<Option<Arc<Thread>>>,
    /// Mirror of `current_thread`'s context pointer, readable from the
    /// interrupt trampolines without touching `current_thread`'s lock.
    pub current_context_ptr: AtomicPtr<CpuContext>,
    /// Number of times this CPU has entered `schedule()`, used to decide
    /// when to sample the global run queue ahead of the local one.
    pub schedule_count: AtomicU64,
    /// Closure stashed by `park_with` just before trapping into `on_park`,
    /// which runs it once the parking thread is safely marked `Waiting`.
    /// A raw trait-object pointer, not a boxed one: the closure usually
    /// borrows a lock guard with a non-`'static` lifetime living on the
    /// parking thread's own stack, which stays valid while it's suspended.
    pending_unlock: Cell<Option<*mut dyn FnMut()>>,

    /// Nesting depth of `scheduler::preempt_disable` on this CPU. While
    /// nonzero, the timer tick still fires (it has to, to keep the clock
    /// running) but must not switch threads out from under code that asked
    /// not to be preempted — e.g. a GC safepoint poll or a spinlock's
    /// critical section.
    preempt_depth: Cell<u32>,
    /// Set by the tick handler when it skipped a reschedule because
    /// `preempt_depth` was nonzero. `preempt_enable` checks this on the
    /// transition back to zero and yields immediately instead of waiting
    /// for the next tick.
    resched_deferred: Cell<bool>,

    /// wyrand state driving this CPU's work-stealing iteration order. Only
    /// ever touched by the CPU that owns it, from inside `schedule()`.
    pub steal_rand: Cell<u64>,

    /// Lifecycle state — guards thread dispatch and crash handling.
    pub state: AtomicCpuState,
}

/// Offset of current_context_ptr in CpuLocalData for assembly access
pub const CURRENT_CONTEXT_PTR_OFFSET: usize = offset_of!(CpuLocalData, current_context_ptr);

impl CpuLocalData {
    /// Stashes `f` for `on_park` to run after marking the parking thread
    /// `Waiting`. Overwrites (does not queue) any previous value — at most
    /// one thread can be parking on a given CPU at a time.
    pub fn set_pending_unlock(&self, f: *mut dyn FnMut()) {
        self.pending_unlock.set(Some(f));
    }

    /// Takes and runs the stashed unlock closure, if any. No-op if `park_with`
    /// wasn't the reason this CPU trapped (e.g. on_yield, on_drop).
    ///
    /// # Safety
    /// Must only be called from `on_park`, on the same CPU that stashed the
    /// closure, after the parking thread has been marked `Waiting`.
    pub unsafe fn run_pending_unlock(&self) {
        if let Some(f) = self.pending_unlock.take() {
            unsafe { (&mut *f)() };
        }
    }

    pub fn enter_preempt_disable(&self) {
        self.preempt_depth.set(self.preempt_depth.get() + 1);
    }

    /// Returns `true` if the depth just dropped to zero while a tick had
    /// deferred a reschedule, meaning the caller should yield right away.
    pub fn exit_preempt_disable(&self) -> bool {
        let depth = self.preempt_depth.get();
        debug_assert!(depth > 0, "preempt_enable without matching preempt_disable");
        self.preempt_depth.set(depth - 1);
        depth == 1 && self.resched_deferred.take()
    }

    pub fn is_preempt_disabled(&self) -> bool {
        self.preempt_depth.get() > 0
    }

    pub fn defer_reschedule(&self) {
        self.resched_deferred.set(true);
    }
}

// Safety:
// - Per-CPU data
// - Accessed only via GS base
// - No cross-CPU access
unsafe impl Sync for CpuLocalData {}

fn mp_response() -> &'static MpResponse {
    MP_REQUEST.get_response().expect("expected MP response")
}

static CPU_LOCAL_DATA: Lazy<Box<[Once<CpuLocalData>]>> =
    Lazy::new(|| mp_response().cpus().iter().map(|_| Once::new()).collect());

fn write_gs_base(ptr: &'static CpuLocalData) {
    let vaddr = VirtAddr::from_ptr(ptr);
    unsafe {
        // GS.Base = kernel ptr, read back by get_local() via GS-relative
        // addressing everywhere, including inside the naked-asm trampolines.
        GsBase::write(vaddr);
        KernelGsBase::write(VirtAddr::new(0));
    }
}

/// Initializes the item in 'CPU_LOCAL_DATA' and GS.Base
fn init_cpu(kernel_id: u32, local_apic_id: u32) {
    write_gs_base(
        CPU_LOCAL_DATA[kernel_id as usize].call_once(|| CpuLocalData {
            kernel_id,
            local_apic_id,
            tss: Once::new(),
            gdt: Once::new(),
            idt: Once::new(),
            local_apic: Once::new(),
            local_run_queue: LocalRunQueue::new(),
            timers: TimerHeap::new(),
            current_thread: Mutex::new(None),
            current_context_ptr: AtomicPtr::new(core::ptr::null_mut()),
            schedule_count: AtomicU64::new(0),
            pending_unlock: Cell::new(None),
            preempt_depth: Cell::new(0),
            resched_deferred: Cell::new(false),
            // Distinct, nonzero-ish per CPU so two CPUs don't draw the same
            // steal order; the wyrand mixing step washes out the seed's own
            // structure within the first few draws regardless.
            steal_rand: Cell::new((kernel_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ 0xD1B5_4A32_D192_ED03),
            state: AtomicCpuState::new(CpuState::Initializing),
        }),
    )
}

pub fn cpus_count() -> usize {
    mp_response().cpus().len()
}

pub fn local_apic_id_of(kernel_assigned_id: u32) -> u32 {
    CPU_LOCAL_DATA[kernel_assigned_id as usize]
        .get()
        .unwrap()
        .local_apic_id
}

pub fn try_get_local() -> Option<&'static CpuLocalData> {
    let ptr = NonNull::new(GsBase::read().as_mut_ptr::<CpuLocalData>())?;
    // Safety: we only wrote to GsBase using `write_gs_base`, which ensures that the pointer is `&'static CpuLocalData`
    unsafe { Some(ptr.as_ref()) }
}

pub fn get_local() -> &'static CpuLocalData {
    try_get_local().unwrap()
}

pub fn get_cpu(id: u32) -> &'static CpuLocalData {
    CPU_LOCAL_DATA[id as usize].get().unwrap()
}

/// Mark the current CPU as fully initialized and ready to accept threads.
pub fn mark_current_cpu_ready() {
    get_local().state.store(CpuState::Ready, core::sync::atomic::Ordering::Release);
}

/// Mark the current CPU as crashed so the scheduler stops dispatching to it.
pub fn mark_current_cpu_crashed() {
    if let Some(cpu) = try_get_local() {
        cpu.state.store(CpuState::Crashed, core::sync::atomic::Ordering::Release);
    }
}

/// Returns `Some` only if the CPU is fully initialized and accepting threads.
pub fn try_get_ready_cpu(id: u32) -> Option<&'static CpuLocalData> {
    let cpu = CPU_LOCAL_DATA.get(id as usize)?.get()?;
    if cpu.state.load(core::sync::atomic::Ordering::Acquire) != CpuState::Ready {
        return None;
    }
    Some(cpu)
}

/// Iterates every CPU that has finished `init_cpu` (regardless of Ready
/// state), for the scheduler's work-stealing scan.
pub fn all_initialized_cpus() -> impl Iterator<Item = &'static CpuLocalData> {
    CPU_LOCAL_DATA.iter().filter_map(|c| c.get())
}

/// Initialize CPU local data for the BSP
///
/// # Safety:
/// Must be called on the AP
pub unsafe fn init_bsp() {
    // Always assign 0 to BSP
    init_cpu(0, mp_response().bsp_lapic_id())
}

pub unsafe fn init_ap(cpu: &Cpu) {
    let local_apic_id = cpu.lapic_id;
    init_cpu(
        // Get the position within the array (0 is BSP)
        mp_response()
            .cpus()
            .iter()
            .filter(|cpu| cpu.lapic_id != mp_response().bsp_lapic_id())
            .position(|cpu| cpu.lapic_id == local_apic_id)
            .expect("CPUs array should contain this AP") as u32
            + 1,
        local_apic_id,
    )
}
