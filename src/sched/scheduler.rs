//! Thread dispatch: run-queue draining, work stealing, and the entry
//! points a thread uses to leave a CPU.
//!
//! A running thread never jumps straight into another thread's code. It
//! always leaves through one of four software traps — the timer tick
//! (preemption), `yield_now` (cooperative), `park_with` (blocking on a
//! `Waitable`/semaphore/word lock), or `drop_current` (thread exit) — each
//! routed through its own IDT vector so the trampoline in
//! [`crate::interrupt::handlers`] saves the full register file before any
//! of this code runs, and restores whichever thread this module decides
//! runs next.

use alloc::string::String;
use alloc::sync::Arc;

use crate::memory::cpu_local_data::{self, CpuLocalData};
use crate::sched::run_queue::GlobalRunQueue;
use crate::sched::thread::{CpuContext, Thread, ThreadFn, ThreadStatus};
use core::sync::atomic::Ordering;
use x86_64::VirtAddr;
use x86_64::registers::model_specific::FsBase;

/// Every this-many trips through `schedule`, a CPU checks the global run
/// queue ahead of its own — otherwise a CPU with a steady stream of local
/// work could starve threads parked on it from elsewhere. Matches the
/// sampling period of the scheduler this one is modeled on.
const GLOBAL_QUEUE_SAMPLE_PERIOD: u64 = 61;

/// Default thread quantum. A thread that inherits time from a direct
/// hand-off (e.g. just-woken by `ready_thread(.., next: true)`) gets half
/// of this, so a waker doesn't starve itself behind the thread it woke.
const TIME_SLICE_US: u64 = 5_000;

pub static GLOBAL_RUN_QUEUE: GlobalRunQueue = GlobalRunQueue::new();

/// Returns the thread currently running on this CPU.
///
/// # Panics
/// If called before any thread has been dispatched on this CPU.
pub fn current_thread() -> Arc<Thread> {
    cpu_local_data::get_local()
        .current_thread
        .lock()
        .clone()
        .expect("scheduler: current_thread() with nothing running")
}

/// Creates a new thread and makes it runnable.
pub fn spawn(name: impl Into<String>, entry: ThreadFn, arg: usize) -> Arc<Thread> {
    let thread = Thread::new(name, entry, arg);
    ready_thread(thread.clone());
    thread
}

/// Makes `thread` runnable on the calling CPU's local run queue, as the
/// next thread to run there (it preempts whatever is already in the
/// direct hand-off slot, which itself falls back into the ring).
///
/// `thread` must be `Waiting`; it's a programming error to ready a thread
/// from any other state (already-`Runnable` is tolerated as a harmless
/// double wake, since two wakers can race to dequeue the same waiter).
pub fn ready_thread(thread: Arc<Thread>) {
    loop {
        match thread.status.compare_exchange(
            ThreadStatus::Waiting,
            ThreadStatus::Runnable,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(ThreadStatus::Runnable) => return,
            Err(other) => panic!("ready_thread: thread {:?} in state {other:?}", thread.id),
        }
    }

    let cpu = cpu_local_data::get_local();
    cpu.local_run_queue.put(thread, true, &GLOBAL_RUN_QUEUE);
}

/// Traps into the yield vector: gives up the CPU but stays runnable,
/// re-queued at the tail of the local run queue.
pub fn yield_now() {
    // `int` takes an immediate operand, so each vector needs its own
    // literal — this one must stay in sync with `InterruptVector::Yield`.
    unsafe { core::arch::asm!("int 0xf1") };
}

/// Parks the current thread. `unlock` runs after the thread is marked
/// `Waiting` but before another CPU can have observed that — it's meant to
/// drop whatever lock guard the caller used to enqueue a wait node, so the
/// enqueue and the status transition that makes waking it legal happen
/// atomically from an outside observer's point of view.
///
/// Returns once some other thread calls [`ready_thread`] on this one.
pub fn park_with<F: FnOnce()>(unlock: F) {
    let mut slot = Some(unlock);
    let mut thunk = move || {
        if let Some(f) = slot.take() {
            f();
        }
    };
    let fat_ptr: *mut dyn FnMut() = &mut thunk;
    cpu_local_data::get_local().set_pending_unlock(fat_ptr);
    unsafe { core::arch::asm!("int 0xf2") };
}

/// Terminates the calling thread. Never returns.
pub fn drop_current() -> ! {
    unsafe { core::arch::asm!("int 0xf3") };
    unreachable!("drop_current: trapped thread was rescheduled");
}

/// Raises this CPU's preemption-disable depth. While nonzero, the timer
/// tick won't switch this CPU's running thread out from under it — for
/// short critical sections (a spinlock's fast path, a lock-free structure's
/// update) that must run to completion once started.
///
/// Must be paired with [`preempt_enable`]; nesting is fine, only the
/// outermost pair actually gates the tick.
pub fn preempt_disable() {
    cpu_local_data::get_local().enter_preempt_disable();
}

/// Lowers the depth raised by [`preempt_disable`]. If a tick landed while
/// disabled and deferred its reschedule, and this is the outermost
/// `preempt_enable`, yields immediately instead of waiting for the next
/// tick to catch up.
pub fn preempt_enable() {
    if cpu_local_data::get_local().exit_preempt_disable() {
        yield_now();
    }
}

/// Cooperative suspend, for a GC (or similar) collaborator that needs a
/// thread parked at a known safepoint before it can inspect that thread's
/// stack. Requests that `thread` park itself at its next schedule point
/// and spins until it's no longer `Running` anywhere.
///
/// A thread already off-CPU (`Waiting`, `Runnable`, ...) when this is
/// called counts as suspended immediately — it isn't touching its own
/// stack either way. Returns `false` if the thread reached `Dead` before
/// honoring the request; there's nothing left to suspend.
///
/// Does not itself stop the thread from being woken by an unrelated
/// `ready_thread` while suspended — serializing suspend against whatever
/// else might wake `thread` is the caller's responsibility.
pub fn suspend(thread: &Arc<Thread>) -> bool {
    thread.request_suspend();
    loop {
        match thread.status.load(Ordering::Acquire) {
            ThreadStatus::Dead => {
                thread.clear_suspend_request();
                return false;
            }
            ThreadStatus::Running => core::hint::spin_loop(),
            _ => return true,
        }
    }
}

/// Lifts a suspend requested by [`suspend`]. If the thread had actually
/// parked in response, makes it runnable again; if the request hadn't been
/// honored yet (or the thread was never `Running` to begin with), just
/// clears the flag so the next schedule point doesn't park it.
pub fn resume(thread: &Arc<Thread>) {
    thread.clear_suspend_request();
    if thread.is_suspended() {
        thread.mark_suspended(false);
        ready_thread(thread.clone());
    }
}

/// Maximum spin iterations a contended [`crate::sync::word_lock::WordLock`]
/// or [`crate::sync::semaphore::Semaphore`] waiter burns before parking.
const MAX_SPIN_ITERS: u32 = 4;

/// Whether a spin-waiter on its `iter`-th busy-wait iteration should keep
/// spinning instead of parking now. Spinning only pays off if there's spare
/// capacity elsewhere to run whatever would otherwise be blocked on this
/// CPU while it spins: another CPU sitting idle, and nothing of this CPU's
/// own already queued up waiting for a turn.
pub fn can_spin(iter: u32) -> bool {
    if iter >= MAX_SPIN_ITERS || cpu_local_data::cpus_count() <= 1 {
        return false;
    }
    let cpu = cpu_local_data::get_local();
    cpu.local_run_queue.is_empty() && GLOBAL_RUN_QUEUE.idle_cpu_count() > 0
}

/// Called by `scheduler_startup` once this CPU's run queue exists and its
/// LAPIC timer is armed. Does not return: it arms a short one-shot
/// deadline and idles until the timer fires, which drives the bootstrap
/// path in [`crate::interrupt::handlers`].
pub fn startup() -> ! {
    crate::time::lapic_timer::set_deadline(1);
    crate::hlt_loop()
}

/// First dispatch on a CPU: there is no outgoing thread to save, so this
/// skips straight to picking one to run.
pub(crate) fn bootstrap(cpu: &'static CpuLocalData) -> *mut CpuContext {
    schedule(cpu)
}

/// Where a thread bumped off its CPU by [`requeue_current`] lands.
enum Requeue {
    /// Voluntary `yield_now`: tail of this CPU's own local queue, so a
    /// single yielding thread doesn't go chase the global queue's lock.
    Local,
    /// Tick-driven preemption: the global queue, so one CPU's steady
    /// stream of preempted threads doesn't monopolize its own local ring
    /// ahead of threads parked there by other CPUs.
    Global,
}

/// Timer-tick entry point proper, wired to the LAPIC timer vector. Unlike
/// the shared requeue path, this one respects `preempt_disable` — a tick
/// landing inside a disabled section re-arms the deadline and leaves the
/// same thread running, deferring the reschedule for `preempt_enable` to
/// deliver once the section ends.
pub(crate) fn on_tick(cpu: &'static CpuLocalData) -> *mut CpuContext {
    if cpu.is_preempt_disabled() {
        cpu.defer_reschedule();
        crate::time::arm_deadline(TIME_SLICE_US, cpu.timers.next_deadline());
        return cpu.current_context_ptr.load(Ordering::Acquire);
    }
    requeue_current(cpu, Requeue::Global)
}

/// Yield entry point: voluntary rotate, reached by `yield_now` instead of
/// quantum expiry.
pub(crate) fn on_yield(cpu: &'static CpuLocalData) -> *mut CpuContext {
    requeue_current(cpu, Requeue::Local)
}

/// Shared tail of `on_tick`/`on_yield`: save the outgoing thread's FPU
/// state, re-queue it `Runnable` wherever `target` says, and dispatch
/// whatever runs next. Also the path through which this CPU's very first
/// dispatch happens, via `bootstrap`, since there's nothing to save yet.
fn requeue_current(cpu: &'static CpuLocalData, target: Requeue) -> *mut CpuContext {
    let Some(thread) = cpu.current_thread.lock().take() else {
        return bootstrap(cpu);
    };

    // Safety: this thread just stopped running on this CPU and isn't
    // runnable anywhere else yet (its status hasn't been updated below).
    unsafe { (*thread.fpu_ptr()).save() };

    if thread.suspend_requested() {
        // Visibly `Preempted` for the instant between leaving `Running` and
        // settling into `Waiting`, so a concurrent `suspend()` spinning on
        // this thread's status sees an honest answer either way.
        if thread
            .status
            .compare_exchange(ThreadStatus::Running, ThreadStatus::Preempted, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            thread.status.store(ThreadStatus::Waiting, Ordering::Release);
            thread.mark_suspended(true);
        }
        return schedule(cpu);
    }

    match thread.status.compare_exchange(
        ThreadStatus::Running,
        ThreadStatus::Runnable,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => match target {
            Requeue::Local => cpu.local_run_queue.put(thread, false, &GLOBAL_RUN_QUEUE),
            Requeue::Global => GLOBAL_RUN_QUEUE.put(thread),
        },
        // A concurrent `drop_current`/suspend beat the tick to it; let
        // that path's own re-queue (or lack of one) stand.
        Err(_) => {}
    }

    schedule(cpu)
}

/// Park entry point: the running thread already enqueued itself somewhere
/// (a `Waitable`'s wait list, a semaphore's waiter queue, ...) and is
/// giving up the CPU until something calls `ready_thread` on it. Marks it
/// `Waiting`, then — and only then — runs the closure `park_with` stashed,
/// which is what actually releases the lock the caller used to enqueue.
pub(crate) fn on_park(cpu: &'static CpuLocalData) -> *mut CpuContext {
    let thread = cpu
        .current_thread
        .lock()
        .take()
        .expect("on_park: no current thread");

    // Safety: this thread just stopped running on this CPU and isn't
    // runnable anywhere else yet (its status hasn't been updated below).
    unsafe { (*thread.fpu_ptr()).save() };

    let ok = thread
        .status
        .compare_exchange(ThreadStatus::Running, ThreadStatus::Waiting, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    debug_assert!(ok, "on_park: thread wasn't Running");

    // Safety: called from on_park, same CPU that stashed the closure in
    // `park_with`, immediately after the Waiting transition above.
    unsafe { cpu.run_pending_unlock() };

    schedule(cpu)
}

/// Drop entry point: the running thread called `drop_current` and will
/// never run again. Marks it `Dead` and lets its `Arc` go — whatever
/// de-registers dead threads (a joiner's `Waitable`, the thread registry)
/// holds the last other reference.
pub(crate) fn on_drop(cpu: &'static CpuLocalData) -> *mut CpuContext {
    let thread = cpu
        .current_thread
        .lock()
        .take()
        .expect("on_drop: no current thread");

    thread.status.store(ThreadStatus::Dead, Ordering::Release);
    crate::sched::registry::unregister(&thread);
    drop(thread);

    schedule(cpu)
}

/// The dispatch loop: pop a thread from somewhere and run it, falling
/// back from this CPU's own queue, to the global overflow queue, to
/// stealing from other CPUs, to halting until woken.
fn schedule(cpu: &'static CpuLocalData) -> *mut CpuContext {
    loop {
        if let Some((thread, inherit_time)) = next_runnable(cpu) {
            return execute(cpu, thread, inherit_time);
        }

        if let Some(thread) = steal_from_others(cpu) {
            return execute(cpu, thread, false);
        }

        idle_until_woken(cpu);
    }
}

fn next_runnable(cpu: &'static CpuLocalData) -> Option<(Arc<Thread>, bool)> {
    let tick = cpu.schedule_count.fetch_add(1, Ordering::Relaxed);
    if tick % GLOBAL_QUEUE_SAMPLE_PERIOD == 0 {
        if let Some(t) = GLOBAL_RUN_QUEUE.get() {
            return Some((t, false));
        }
    }

    if let Some(pair) = cpu.local_run_queue.get() {
        return Some(pair);
    }

    GLOBAL_RUN_QUEUE.get().map(|t| (t, false))
}

/// Steals one thread from some other CPU. Makes up to [`STEAL_PASSES`] laps
/// over every other CPU, each in a freshly drawn permutation so a CPU
/// starved of work doesn't keep hammering the same neighbor in the same
/// order every time it goes looking. Only the final lap is allowed to take
/// a victim's `run_next` slot — that thread was about to get priority
/// dispatch on its own CPU, so it's the last thing a stealer should reach
/// for, not the first.
fn steal_from_others(cpu: &'static CpuLocalData) -> Option<Arc<Thread>> {
    let total = cpu_local_data::cpus_count() as u32;
    if total <= 1 {
        return None;
    }

    for pass in 0..STEAL_PASSES {
        let steal_next = pass == STEAL_PASSES - 1;

        let mut order = steal_order(cpu, total);
        while let Some(id) = order.next_id() {
            if id == cpu.kernel_id {
                continue;
            }
            let Some(other) = cpu_local_data::try_get_ready_cpu(id) else {
                continue;
            };

            let mut stolen = other.local_run_queue.steal(steal_next);
            if let Some(first) = stolen.pop() {
                for extra in stolen {
                    cpu.local_run_queue.put(extra, false, &GLOBAL_RUN_QUEUE);
                }
                return Some(first);
            }
        }
    }
    None
}

/// Number of laps `steal_from_others` makes over the other CPUs before
/// giving up. Only the last lap takes a victim's `run_next` slot.
const STEAL_PASSES: u32 = 4;

/// wyrand: a small, fast non-cryptographic PRNG, used only to pick a
/// starting point and step for this CPU's next work-stealing lap — not for
/// anything security-sensitive.
fn fastrandom(cpu: &'static CpuLocalData) -> u32 {
    let mut state = cpu.steal_rand.get();
    state = state.wrapping_add(0xa076_1d64_78bd_642f);
    cpu.steal_rand.set(state);
    let mixed = state ^ 0xe703_7ed1_a0b4_28db;
    let product = (state as u128).wrapping_mul(mixed as u128);
    ((product >> 64) as u64 ^ product as u64) as u32
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Every step size coprime with `count`, so stepping through `0..count` by
/// one of these visits every CPU id exactly once before repeating. Cached
/// per CPU count — this kernel never changes its CPU count after boot.
fn steal_order_coprimes(count: u32) -> &'static alloc::vec::Vec<u32> {
    static TABLE: spin::Once<alloc::vec::Vec<u32>> = spin::Once::new();
    TABLE.call_once(|| (0..=count).filter(|&i| gcd(i, count) == 1).collect())
}

/// A single lap's walk order over `[0, count)`, stepping by a coprime
/// increment from a randomly drawn start so consecutive laps (and
/// consecutive CPUs) don't all probe in the same order.
struct StealOrder {
    count: u32,
    remaining: u32,
    pos: u32,
    inc: u32,
}

fn steal_order(cpu: &'static CpuLocalData, count: u32) -> StealOrder {
    let coprimes = steal_order_coprimes(count);
    let seed = fastrandom(cpu);
    StealOrder {
        count,
        remaining: count,
        pos: seed % count,
        inc: coprimes[seed as usize % coprimes.len()],
    }
}

impl StealOrder {
    fn next_id(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let id = self.pos;
        self.pos = (self.pos + self.inc) % self.count;
        Some(id)
    }
}

/// Marks this CPU idle and halts, re-checking both queues around the
/// `hlt` so a `put` racing the idle-bitmask update never leaves a runnable
/// thread waiting for a wakeup nobody sends.
fn idle_until_woken(cpu: &'static CpuLocalData) {
    GLOBAL_RUN_QUEUE.mark_idle(cpu.local_apic_id as u8);

    if !cpu.local_run_queue.is_empty() || !GLOBAL_RUN_QUEUE.is_empty() {
        GLOBAL_RUN_QUEUE.clear_idle(cpu.local_apic_id as u8);
        return;
    }

    // Nothing runnable: arm for whatever this CPU's own timers need rather
    // than the last thread's quantum, so a parked `after()`/timeout doesn't
    // oversleep while its CPU sits idle.
    crate::time::arm_deadline(TIME_SLICE_US, cpu.timers.next_deadline());
    x86_64::instructions::interrupts::enable_and_hlt();
    GLOBAL_RUN_QUEUE.clear_idle(cpu.local_apic_id as u8);
}

fn execute(cpu: &'static CpuLocalData, thread: Arc<Thread>, inherit_time: bool) -> *mut CpuContext {
    loop {
        match thread.status.compare_exchange(
            ThreadStatus::Runnable,
            ThreadStatus::Running,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            // Dropped or re-suspended between being popped and dispatched;
            // try again with whatever's next.
            Err(ThreadStatus::Dead) => return schedule(cpu),
            Err(_) => core::hint::spin_loop(),
        }
    }

    let quantum_us = if inherit_time { TIME_SLICE_US / 2 } else { TIME_SLICE_US };
    crate::time::arm_deadline(quantum_us, cpu.timers.next_deadline());

    // Safety: `thread` just won the Running CAS above — nothing else may
    // touch its FPU state or TCB until it leaves the CPU again.
    unsafe { (*thread.fpu_ptr()).restore() };
    FsBase::write(VirtAddr::new(thread.tcb_ptr() as u64));

    let ctx = thread.context_ptr();
    cpu.current_context_ptr.store(ctx, Ordering::Release);
    *cpu.current_thread.lock() = Some(thread);
    ctx
}
