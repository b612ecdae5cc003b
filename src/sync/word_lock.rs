//! A mutex that parks contending threads instead of spinning, modeled on
//! WebKit's `WordLock`: an uncontended lock is a single atomic flag, and
//! contending threads queue up instead of busy-waiting indefinitely.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex as SpinMutex;

use crate::sched::scheduler;
use crate::sched::thread::Thread;

struct Waiter {
    should_park: SpinMutex<bool>,
    thread: Arc<Thread>,
}

/// A mutex with no embedded data, matching `word_lock_t`'s role as a bare
/// synchronization primitive other structures (semaphores, waitables)
/// build on.
pub struct WordLock {
    locked: AtomicBool,
    queue: SpinMutex<VecDeque<Arc<Waiter>>>,
}

impl Default for WordLock {
    fn default() -> Self {
        Self::new()
    }
}

impl WordLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            queue: SpinMutex::new(VecDeque::new()),
        }
    }

    pub fn lock(&self) {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    fn lock_slow(&self) {
        let mut spin_count = 0u32;

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            if self.queue.lock().is_empty() && scheduler::can_spin(spin_count) {
                spin_count += 1;
                scheduler::yield_now();
                continue;
            }

            let waiter = Arc::new(Waiter {
                should_park: SpinMutex::new(true),
                thread: scheduler::current_thread(),
            });

            {
                let mut queue = self.queue.lock();
                // Re-check under the queue lock: the unlocker drains the
                // queue before clearing `locked`, so if we lost the race
                // and the lock is now free, grab it instead of parking.
                if !self.locked.load(Ordering::Acquire) {
                    continue;
                }
                queue.push_back(waiter.clone());
            }

            loop {
                let parked = *waiter.should_park.lock();
                if !parked {
                    break;
                }
                scheduler::park_with(|| {});
            }
        }
    }

    pub fn unlock(&self) {
        // Hold the queue lock across the decision so a concurrent
        // `lock_slow` can't observe `locked == false` and skip queuing
        // while we're about to hand off to someone already queued.
        let mut queue = self.queue.lock();
        match queue.pop_front() {
            Some(waiter) => {
                drop(queue);
                *waiter.should_park.lock() = false;
                scheduler::ready_thread(waiter.thread.clone());
            }
            None => {
                self.locked.store(false, Ordering::Release);
            }
        }
    }
}
