//! A counting semaphore with direct thread hand-off, adapted from the Go
//! runtime's `sync.Mutex` starvation-mode semaphore.
//!
//! Waiters queue FIFO by default. `acquire(lifo = true, ..)` is for
//! recursive/re-entrant callers (e.g. a lock's own slow path) that want to
//! cut ahead, trading fairness for latency the same way upstream does.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use spin::Mutex as SpinMutex;

use crate::sched::scheduler;
use crate::sched::thread::Thread;
use crate::sched::timer;

struct Waiter {
    thread: Arc<Thread>,
    /// 0 = still queued, 1 = handed a permit directly, -1 = timed out.
    ticket: AtomicI64,
}

/// A counting semaphore. `value` starts at the number of permits available.
pub struct Semaphore {
    value: AtomicU32,
    /// Waiters known to be asleep, incremented before the final
    /// double-check in `acquire` so a racing `release` never misses a
    /// wakeup it owes.
    waiting: AtomicU32,
    queue: SpinMutex<VecDeque<Arc<Waiter>>>,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            value: AtomicU32::new(initial),
            waiting: AtomicU32::new(0),
            queue: SpinMutex::new(VecDeque::new()),
        }
    }

    fn try_acquire_permit(&self) -> bool {
        loop {
            let v = self.value.load(Ordering::Acquire);
            if v == 0 {
                return false;
            }
            if self
                .value
                .compare_exchange_weak(v, v - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Blocks until a permit is available, or `timeout_us` microseconds
    /// elapse. `timeout_us = None` blocks indefinitely; `Some(0)` is a
    /// non-blocking poll.
    pub fn acquire(&self, lifo: bool, timeout_us: Option<u64>) -> bool {
        if self.try_acquire_permit() {
            return true;
        }
        if timeout_us == Some(0) {
            return false;
        }

        let mut spin_count = 0u32;
        while scheduler::can_spin(spin_count) {
            spin_count += 1;
            scheduler::yield_now();
            if self.try_acquire_permit() {
                return true;
            }
        }

        let waiter = Arc::new(Waiter {
            thread: scheduler::current_thread(),
            ticket: AtomicI64::new(0),
        });

        loop {
            let mut queue = self.queue.lock();
            self.waiting.fetch_add(1, Ordering::AcqRel);

            if self.try_acquire_permit() {
                self.waiting.fetch_sub(1, Ordering::AcqRel);
                return true;
            }

            if lifo {
                queue.push_front(waiter.clone());
            } else {
                queue.push_back(waiter.clone());
            }

            let timer_handle = timeout_us.map(|us| {
                let waiter = waiter.clone();
                let sem_queue: *const SpinMutex<VecDeque<Arc<Waiter>>> = &self.queue;
                // Safety: `self` outlives this timer, which is always
                // stopped before `acquire` returns.
                let sem_queue = unsafe { &*sem_queue };
                timer::after(us, move |_now| {
                    let mut q = sem_queue.lock();
                    if let Some(pos) = q.iter().position(|w| Arc::ptr_eq(w, &waiter)) {
                        q.remove(pos);
                        waiter.ticket.store(-1, Ordering::Release);
                        drop(q);
                        scheduler::ready_thread(waiter.thread.clone());
                    }
                })
            });

            // The queue only unlocks once this thread's status has actually
            // settled into `Waiting` — otherwise a `release()` on another
            // CPU could dequeue and `ready_thread()` this waiter while it's
            // still `Running` here, which `ready_thread` treats as fatal.
            scheduler::park_with(move || drop(queue));

            if let Some(handle) = &timer_handle {
                handle.stop();
            }

            let ticket = waiter.ticket.load(Ordering::Acquire);
            if ticket == -1 {
                return false;
            }
            if ticket != 0 || self.try_acquire_permit() {
                return true;
            }
        }
    }

    /// Releases a permit. If `handoff` is set and a waiter is woken, the
    /// permit is handed to it directly and the caller yields immediately so
    /// the waiter runs next — used when a lock's slow path detects
    /// contention it wants to resolve fairly rather than letting the
    /// releaser win the permit back on the next loop.
    pub fn release(&self, handoff: bool) {
        self.value.fetch_add(1, Ordering::AcqRel);

        if self.waiting.load(Ordering::Acquire) == 0 {
            return;
        }

        let mut queue = self.queue.lock();
        if self.waiting.load(Ordering::Acquire) == 0 {
            return;
        }
        let waiter = queue.pop_front();
        if waiter.is_some() {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
        }
        drop(queue);

        if let Some(waiter) = waiter {
            debug_assert_eq!(waiter.ticket.load(Ordering::Acquire), 0);

            if handoff && self.try_acquire_permit() {
                waiter.ticket.store(1, Ordering::Release);
            }

            scheduler::ready_thread(waiter.thread.clone());

            if waiter.ticket.load(Ordering::Acquire) == 1 {
                scheduler::yield_now();
            }
        }
    }
}
