//! Thread objects and the machine state a context switch saves and restores.

use crate::memory::guarded_stack::GuardedStack;
use crate::sched::fpu::FpuState;
use crate::sched::timer::TimerHandle;
use crate::sync::waitable::Waitable;
use alloc::string::String;
use alloc::sync::Arc;
use atomic_enum::atomic_enum;
use core::cell::UnsafeCell;
use core::mem::offset_of;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

/// Identifies a thread for its whole lifetime. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A thread's lifecycle state.
#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum ThreadStatus {
    Idle = 0,
    Runnable = 1,
    Running = 2,
    Waiting = 3,
    Preempted = 4,
    Dead = 5,
}

/// Full callee- and caller-saved integer register file, plus the hardware
/// `iretq` frame. Saved by the interrupt trampolines in
/// [`crate::interrupt::handlers`] and consumed by the scheduler to restore a
/// thread onto the CPU.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,

    // Hardware iretq frame.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub const CTX_R15: usize = offset_of!(CpuContext, r15);
pub const CTX_R14: usize = offset_of!(CpuContext, r14);
pub const CTX_R13: usize = offset_of!(CpuContext, r13);
pub const CTX_R12: usize = offset_of!(CpuContext, r12);
pub const CTX_R11: usize = offset_of!(CpuContext, r11);
pub const CTX_R10: usize = offset_of!(CpuContext, r10);
pub const CTX_R9: usize = offset_of!(CpuContext, r9);
pub const CTX_R8: usize = offset_of!(CpuContext, r8);
pub const CTX_RDI: usize = offset_of!(CpuContext, rdi);
pub const CTX_RSI: usize = offset_of!(CpuContext, rsi);
pub const CTX_RBP: usize = offset_of!(CpuContext, rbp);
pub const CTX_RBX: usize = offset_of!(CpuContext, rbx);
pub const CTX_RDX: usize = offset_of!(CpuContext, rdx);
pub const CTX_RCX: usize = offset_of!(CpuContext, rcx);
pub const CTX_RAX: usize = offset_of!(CpuContext, rax);
pub const CTX_RIP: usize = offset_of!(CpuContext, rip);
pub const CTX_CS: usize = offset_of!(CpuContext, cs);
pub const CTX_RFLAGS: usize = offset_of!(CpuContext, rflags);
pub const CTX_RSP: usize = offset_of!(CpuContext, rsp);
pub const CTX_SS: usize = offset_of!(CpuContext, ss);

pub const KERNEL_CS: u64 = 0x08;
pub const KERNEL_SS: u64 = 0x10;

pub type ThreadFn = fn(usize) -> !;

/// Thread control block installed at this thread's FS base.
///
/// Follows the ELF TLS variant-II convention of a self-referential first
/// word (`mov rax, fs:0` is how generated code finds its own TCB), plus two
/// slots a future managed-runtime collaborator (GC, loader) can use without
/// the scheduler needing to know anything about what lives behind them.
#[repr(C)]
pub struct Tcb {
    /// Self-pointer, per the ELF TLS ABI: `%fs:0` always reads the TCB's
    /// own address.
    self_ptr: *mut Tcb,
    /// Opaque slot for a garbage collector to hang its per-thread
    /// allocation/scan state off of. Null until something sets it.
    pub gc_thread_data: *mut (),
    /// Opaque handle for a managed-runtime thread object wrapping this one.
    /// Zero until something sets it.
    pub managed_thread_handle: usize,
}

impl Default for Tcb {
    fn default() -> Self {
        Tcb {
            self_ptr: core::ptr::null_mut(),
            gc_thread_data: core::ptr::null_mut(),
            managed_thread_handle: 0,
        }
    }
}

// Safety: raw pointers here are opaque handles for an external collaborator,
// never dereferenced by this crate.
unsafe impl Send for Tcb {}

/// One node in a thread's intrusive wait list. A thread parked on N
/// waitables (via `select`) owns N of these, chained through `wait_link`.
///
/// Mirrors `waiting_thread_t`: the same struct also does double duty as a
/// node in a `Waitable`'s own FIFO queue (via `qnext`/`qprev`) and in a
/// semaphore's LIFO/FIFO waiter stack (via `wait_link`/`wait_tail`).
pub struct WaitingThread {
    pub thread: Arc<Thread>,
    /// Ticket protocol used by semaphores: 0 = still queued, 1 = handed off,
    /// -1 = timed out.
    pub ticket: core::sync::atomic::AtomicI64,
    /// Next waiter in whichever intrusive structure currently owns this node.
    pub wait_link: Mutex<Option<Arc<WaitingThread>>>,
    /// Tail pointer, valid only on the head node of a semaphore wait list.
    pub wait_tail: Mutex<Option<Arc<WaitingThread>>>,
    /// Set when this node is one leg of a multi-way `select`.
    pub is_select: bool,
    /// Set by the waker before readying the thread, so the woken thread
    /// knows which leg of a `select` actually fired.
    pub success: AtomicBool,
    /// Doubly-linked queue pointers used by `Waitable`'s own send/wait queues.
    pub qnext: Mutex<Option<Arc<WaitingThread>>>,
    pub qprev: Mutex<Option<Arc<WaitingThread>>>,
    pub waitable: Option<Arc<Waitable>>,
}

impl WaitingThread {
    pub fn new(thread: Arc<Thread>) -> Arc<Self> {
        Self::with_select(thread, false)
    }

    /// As [`Self::new`], but marked as one leg of a `select`: the dequeuing
    /// side must win a CAS on `thread.select_done` before it may hand this
    /// node a value, since some other leg may already have woken the thread.
    pub fn new_select(thread: Arc<Thread>) -> Arc<Self> {
        Self::with_select(thread, true)
    }

    fn with_select(thread: Arc<Thread>, is_select: bool) -> Arc<Self> {
        Arc::new(Self {
            thread,
            ticket: core::sync::atomic::AtomicI64::new(0),
            wait_link: Mutex::new(None),
            wait_tail: Mutex::new(None),
            is_select,
            success: AtomicBool::new(false),
            qnext: Mutex::new(None),
            qprev: Mutex::new(None),
            waitable: None,
        })
    }
}

/// A schedulable thread of execution: the kernel's unit of concurrency.
///
/// Threads are reference counted (`Arc`) because they are simultaneously
/// reachable from a run queue, the all-threads registry, and possibly a
/// `Waitable`'s wait queue — there is no single owner.
pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    pub status: AtomicThreadStatus,
    /// Saved machine state, valid whenever the thread is not `Running`.
    ///
    /// Not a `Mutex`: the interrupt trampolines address its fields directly
    /// by offset (`CTX_R15` etc.) and need a bare pointer, not a guard. Mutual
    /// exclusion instead comes from the status protocol — only the CPU a
    /// thread is `Running` on ever touches its context, and only while it is.
    context: UnsafeCell<CpuContext>,
    pub kernel_stack: GuardedStack,
    /// Total quanta this thread has been charged for by the local scheduler.
    pub ticks: AtomicU64,
    /// Singly-linked intrusive link used while queued on a run queue.
    pub sched_link: Mutex<Option<Arc<Thread>>>,
    /// Set by a waker immediately before calling `scheduler_ready_thread`, so
    /// a thread waking from `select_park` can tell which waitable fired.
    pub waker: Mutex<Option<Arc<WaitingThread>>>,
    /// Head of this thread's `select` wait-node chain while parked.
    pub waiting: Mutex<Option<Arc<WaitingThread>>>,
    /// CAS gate that resolves the race between a `select`'s own wakeup path
    /// and a concurrent waker draining the same wait node.
    pub select_done: core::sync::atomic::AtomicBool,
    /// Timer created by `scheduler_park_for`, armed only while this thread is
    /// parked with a deadline (e.g. inside a timed semaphore acquire).
    pub park_timer: Mutex<Option<TimerHandle>>,
    /// Saved FPU/SSE state, restored onto the CPU whenever this thread is
    /// dispatched and saved back out whenever it leaves. Same ownership
    /// rule as `context`: only the CPU currently running this thread may
    /// touch it.
    fpu: UnsafeCell<FpuState>,
    /// Thread control block installed at this thread's FS base while it
    /// runs. Same ownership rule as `context`.
    tcb: UnsafeCell<Tcb>,
    /// Set by `scheduler::suspend` to ask this thread to park itself the
    /// next time it reaches a schedule point, independent of whatever
    /// lifecycle state it's otherwise in.
    suspend_requested: AtomicBool,
    /// Set once the thread has actually parked in response to
    /// `suspend_requested`, and cleared by `scheduler::resume`. A suspender
    /// spins on this to know the thread has reached a safepoint rather than
    /// being mid-instruction somewhere unsafe to inspect.
    suspended: AtomicBool,
}

impl Thread {
    pub fn new(name: impl Into<String>, entry: ThreadFn, arg: usize) -> Arc<Self> {
        let kernel_stack = GuardedStack::new_kernel();
        let rsp = kernel_stack.top().as_u64();
        let context = CpuContext {
            rdi: arg as u64,
            rip: entry as u64,
            rsp,
            rflags: 0x202, // IF set
            cs: KERNEL_CS,
            ss: KERNEL_SS,
            ..Default::default()
        };

        let thread = Arc::new(Thread {
            id: ThreadId::next(),
            name: name.into(),
            // Not yet queued anywhere — `spawn`'s call to `ready_thread`
            // is what actually makes it `Runnable` and visible to a CPU.
            status: AtomicThreadStatus::new(ThreadStatus::Waiting),
            context: UnsafeCell::new(context),
            kernel_stack,
            ticks: AtomicU64::new(0),
            sched_link: Mutex::new(None),
            waker: Mutex::new(None),
            waiting: Mutex::new(None),
            select_done: core::sync::atomic::AtomicBool::new(false),
            park_timer: Mutex::new(None),
            fpu: UnsafeCell::new(FpuState::new()),
            tcb: UnsafeCell::new(Tcb::default()),
            suspend_requested: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
        });

        // The TCB's self-pointer can only be filled in once the thread (and
        // its TCB) has a final, stable address.
        let tcb_ptr = thread.tcb_ptr();
        unsafe {
            (*tcb_ptr).self_ptr = tcb_ptr;
            (*tcb_ptr).gc_thread_data = crate::sched::registry::default_gc_thread_data();
        }

        crate::sched::registry::register(&thread);

        thread
    }

    /// Raw pointer to this thread's saved context, for the scheduler and
    /// interrupt trampolines to read/write while the thread isn't running.
    ///
    /// # Safety
    /// The caller must not touch the pointee while this thread is `Running`
    /// on some CPU, and must not let two CPUs touch it concurrently.
    pub fn context_ptr(&self) -> *mut CpuContext {
        self.context.get()
    }

    /// Raw pointer to this thread's saved FPU/SSE state. Same safety
    /// contract as [`Self::context_ptr`].
    pub fn fpu_ptr(&self) -> *mut FpuState {
        self.fpu.get()
    }

    /// Raw pointer to this thread's TCB. Same safety contract as
    /// [`Self::context_ptr`] — valid to dereference only while this thread
    /// is not `Running` anywhere else, which is also exactly when its FS
    /// base (and so `%fs:0`) can point anywhere but here.
    pub fn tcb_ptr(&self) -> *mut Tcb {
        self.tcb.get()
    }

    /// Requests that this thread park itself at its next schedule point,
    /// for the cooperative suspend/resume protocol in
    /// [`crate::sched::scheduler::suspend`].
    pub(crate) fn request_suspend(&self) {
        self.suspend_requested.store(true, Ordering::Release);
    }

    pub(crate) fn suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    pub(crate) fn mark_suspended(&self, value: bool) {
        self.suspended.store(value, Ordering::Release);
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn clear_suspend_request(&self) {
        self.suspend_requested.store(false, Ordering::Release);
    }
}

// Safety: `context`, `fpu`, and `tcb`'s `UnsafeCell`s are only ever
// dereferenced by the CPU that currently owns the thread (per the status
// protocol documented on `context`); every other field is independently
// synchronized.
unsafe impl Sync for Thread {}
