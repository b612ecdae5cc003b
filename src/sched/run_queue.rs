//! Per-CPU run queues plus one global overflow queue.
//!
//! Each CPU keeps a lock-free 256-slot ring of runnable threads and a
//! single `run_next` slot for direct hand-off (e.g. a just-woken waiter
//! that should run before anything already queued). When a CPU's ring
//! fills up, half of it spills to the global queue, which every CPU can
//! pull from and which absorbs threads readied from an arbitrary CPU.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

use crate::sched::thread::Thread;

const LOCAL_QUEUE_SIZE: usize = 256;

/// A CPU's private run queue: a fixed ring plus a one-slot fast path.
pub struct LocalRunQueue {
    head: AtomicU32,
    tail: AtomicU32,
    slots: [Mutex<Option<Arc<Thread>>>; LOCAL_QUEUE_SIZE],
    run_next: Mutex<Option<Arc<Thread>>>,
}

impl Default for LocalRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRunQueue {
    pub fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            slots: [const { Mutex::new(None) }; LOCAL_QUEUE_SIZE],
            run_next: Mutex::new(None),
        }
    }

    /// Queues `thread` on this CPU. If `next` is set, it preempts whatever
    /// is currently in the direct hand-off slot — the bumped thread falls
    /// back to the ring (and from there, possibly, the global queue).
    pub fn put(&self, thread: Arc<Thread>, next: bool, global: &GlobalRunQueue) {
        let thread = if next {
            let mut slot = self.run_next.lock();
            match slot.replace(thread) {
                Some(bumped) => bumped,
                None => return,
            }
        } else {
            thread
        };

        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Relaxed);
            if tail.wrapping_sub(head) < LOCAL_QUEUE_SIZE as u32 {
                *self.slots[tail as usize % LOCAL_QUEUE_SIZE].lock() = Some(thread);
                self.tail.store(tail.wrapping_add(1), Ordering::Release);
                return;
            }

            if self.put_slow(thread.clone(), head, tail, global) {
                global.wake_one_idle_cpu();
                return;
            }
        }
    }

    /// Called when the ring is full: moves half of it, plus the new
    /// thread, onto the global queue in one batch.
    fn put_slow(&self, thread: Arc<Thread>, head: u32, tail: u32, global: &GlobalRunQueue) -> bool {
        let n = ((tail.wrapping_sub(head)) / 2) as usize;
        let mut batch = alloc::vec::Vec::with_capacity(n + 1);
        for i in 0..n {
            let idx = (head.wrapping_add(i as u32)) as usize % LOCAL_QUEUE_SIZE;
            if let Some(t) = self.slots[idx].lock().take() {
                batch.push(t);
            }
        }

        if self
            .head
            .compare_exchange(head, head.wrapping_add(n as u32), Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // Someone else drained the ring meanwhile; put back what we took
            // and let the caller retry the fast path.
            for (i, t) in batch.into_iter().enumerate() {
                let idx = (head.wrapping_add(i as u32)) as usize % LOCAL_QUEUE_SIZE;
                *self.slots[idx].lock() = Some(t);
            }
            return false;
        }

        batch.push(thread);
        global.put_batch(batch);
        true
    }

    /// Pops the next thread to run. Returns whether it came from the
    /// direct hand-off slot (and so should inherit the caller's time
    /// slice) alongside the thread.
    pub fn get(&self) -> Option<(Arc<Thread>, bool)> {
        if let Some(thread) = self.run_next.lock().take() {
            return Some((thread, true));
        }

        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Relaxed);
            if head == tail {
                return None;
            }
            let idx = head as usize % LOCAL_QUEUE_SIZE;
            if self
                .head
                .compare_exchange(head, head.wrapping_add(1), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                let thread = self.slots[idx].lock().take();
                if let Some(thread) = thread {
                    return Some((thread, false));
                }
            }
        }
    }

    /// Steals up to half of this queue's runnable threads for another CPU.
    /// Returns the stolen batch (possibly empty). If the ring itself has
    /// nothing to give and `steal_next` is set, falls back to taking this
    /// queue's direct hand-off slot — stealers only reach for it on their
    /// last pass over the other CPUs, since it bumps a thread that was
    /// about to get priority dispatch on its own CPU.
    pub fn steal(&self, steal_next: bool) -> alloc::vec::Vec<Arc<Thread>> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        let n = (tail.wrapping_sub(head) / 2) as usize;
        if n == 0 {
            if steal_next
                && let Some(thread) = self.run_next.lock().take()
            {
                return alloc::vec![thread];
            }
            return alloc::vec::Vec::new();
        }

        let mut batch = alloc::vec::Vec::with_capacity(n);
        for i in 0..n {
            let idx = head.wrapping_add(i as u32) as usize % LOCAL_QUEUE_SIZE;
            if let Some(t) = self.slots[idx].lock().clone() {
                batch.push(t);
            }
        }

        if self
            .head
            .compare_exchange(head, head.wrapping_add(batch.len() as u32), Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            batch
        } else {
            alloc::vec::Vec::new()
        }
    }

    /// True if both the ring and the hand-off slot are empty. Checked in
    /// this order (ring-then-slot) to avoid a race where a concurrent
    /// `put` moves a thread from the slot to the ring between the two
    /// checks and makes an empty queue look briefly emptier than it is.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head == tail && self.run_next.lock().is_none()
    }
}

struct ThreadQueue {
    items: alloc::collections::VecDeque<Arc<Thread>>,
}

/// The system-wide overflow queue, plus the idle-CPU bitmask used to wake a
/// sleeping CPU when work lands here.
pub struct GlobalRunQueue {
    queue: Mutex<ThreadQueue>,
    size: AtomicUsize,
    idle_cpus: AtomicU32,
    idle_cpu_count: AtomicUsize,
}

impl Default for GlobalRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalRunQueue {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(ThreadQueue {
                items: alloc::collections::VecDeque::new(),
            }),
            size: AtomicUsize::new(0),
            idle_cpus: AtomicU32::new(0),
            idle_cpu_count: AtomicUsize::new(0),
        }
    }

    pub fn put(&self, thread: Arc<Thread>) {
        self.queue.lock().items.push_back(thread);
        self.size.fetch_add(1, Ordering::AcqRel);
        self.wake_one_idle_cpu();
    }

    fn put_batch(&self, batch: alloc::vec::Vec<Arc<Thread>>) {
        let n = batch.len();
        self.queue.lock().items.extend(batch);
        self.size.fetch_add(n, Ordering::AcqRel);
    }

    pub fn get(&self) -> Option<Arc<Thread>> {
        if self.size.load(Ordering::Acquire) == 0 {
            return None;
        }
        let thread = self.queue.lock().items.pop_front();
        if thread.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        thread
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks `apic_id`'s CPU as idle, available to `wake_one_idle_cpu`.
    pub fn mark_idle(&self, apic_id: u8) {
        self.idle_cpus.fetch_or(1 << apic_id, Ordering::AcqRel);
        self.idle_cpu_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Clears `apic_id`'s idle bit when its CPU finds work.
    pub fn clear_idle(&self, apic_id: u8) {
        self.idle_cpus.fetch_and(!(1 << apic_id), Ordering::AcqRel);
        self.idle_cpu_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn idle_cpu_count(&self) -> usize {
        self.idle_cpu_count.load(Ordering::Acquire)
    }

    /// Picks one idle CPU, if any, and sends it a reschedule IPI so it
    /// comes back and pulls from this queue.
    fn wake_one_idle_cpu(&self) {
        if self.idle_cpu_count.load(Ordering::Acquire) == 0 {
            return;
        }
        let mask = self.idle_cpus.load(Ordering::Acquire);
        if mask == 0 {
            return;
        }
        let apic_id = mask.trailing_zeros() as u8;
        crate::apic::send_ipi_to(apic_id, crate::interrupt::InterruptVector::Reschedule);
    }
}
