//! Waitable channels: the kernel's one rendezvous/buffering primitive.
//!
//! A `Waitable` created with `size == 0` is a pure rendezvous (a send only
//! completes once a receiver is ready to take it); `size > 0` adds a ring
//! buffer of that many slots so sends can complete without a waiting
//! receiver, up to capacity. Both share the same send/wait queues and the
//! same `select` machinery.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex as SpinMutex, MutexGuard};

use crate::sched::scheduler;
use crate::sched::thread::WaitingThread;
use crate::sched::timer;

struct Inner {
    count: usize,
    closed: bool,
    send_queue: VecDeque<Arc<WaitingThread>>,
    wait_queue: VecDeque<Arc<WaitingThread>>,
}

/// A bounded FIFO channel threads can send to, wait on, close, or combine
/// with others in a [`select`].
pub struct Waitable {
    size: usize,
    inner: SpinMutex<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Success,
    Empty,
    Closed,
}

impl Waitable {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            inner: SpinMutex::new(Inner {
                count: 0,
                closed: false,
                send_queue: VecDeque::new(),
                wait_queue: VecDeque::new(),
            }),
        })
    }

    fn is_full(&self, inner: &Inner) -> bool {
        if self.size == 0 {
            inner.wait_queue.is_empty()
        } else {
            inner.count == self.size
        }
    }

    fn is_empty(&self, inner: &Inner) -> bool {
        if self.size == 0 {
            inner.send_queue.is_empty()
        } else {
            inner.count == 0
        }
    }

    /// Dequeues the next waiter still actually waiting. A thread parked via
    /// `select` may have already been woken by a different case; `select_done`
    /// resolves that race so we never hand this waiter a value twice.
    fn dequeue_live(queue: &mut VecDeque<Arc<WaitingThread>>) -> Option<Arc<WaitingThread>> {
        while let Some(wt) = queue.pop_front() {
            if wt.is_select
                && wt
                    .thread
                    .select_done
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                continue;
            }
            return Some(wt);
        }
        None
    }

    /// Sends a value. Returns `false` immediately if `block` is false and
    /// no receiver or buffer slot is available, or if the channel is
    /// closed.
    pub fn send(&self, block: bool) -> bool {
        {
            let inner = self.inner.lock();
            if !block && !inner.closed && self.is_full(&inner) {
                return false;
            }
        }

        let mut inner = self.inner.lock();

        if inner.closed {
            return false;
        }

        if let Some(wt) = Self::dequeue_live(&mut inner.wait_queue) {
            drop(inner);
            *wt.thread.waker.lock() = Some(wt.clone());
            wt.success.store(true, Ordering::Release);
            scheduler::ready_thread(wt.thread.clone());
            return true;
        }

        if inner.count < self.size {
            inner.count += 1;
            return true;
        }

        if !block {
            return false;
        }

        let wt = WaitingThread::new(scheduler::current_thread());
        inner.send_queue.push_back(wt.clone());
        scheduler::park_with(move || drop(inner));

        wt.success.load(Ordering::Acquire)
    }

    /// Waits for a value. Returns [`WaitResult::Empty`] immediately if
    /// `block` is false and nothing is available.
    pub fn wait(&self, block: bool) -> WaitResult {
        if !block {
            let inner = self.inner.lock();
            if self.is_empty(&inner) {
                return if inner.closed {
                    WaitResult::Closed
                } else {
                    WaitResult::Empty
                };
            }
        }

        let mut inner = self.inner.lock();

        if inner.closed {
            if inner.count == 0 {
                return WaitResult::Closed;
            }
        } else if let Some(wt) = Self::dequeue_live(&mut inner.send_queue) {
            drop(inner);
            *wt.thread.waker.lock() = Some(wt.clone());
            wt.success.store(true, Ordering::Release);
            scheduler::ready_thread(wt.thread.clone());
            return WaitResult::Success;
        }

        if inner.count > 0 {
            inner.count -= 1;
            return WaitResult::Success;
        }

        if !block {
            return WaitResult::Empty;
        }

        let wt = WaitingThread::new(scheduler::current_thread());
        inner.wait_queue.push_back(wt.clone());
        scheduler::park_with(move || drop(inner));

        if wt.success.load(Ordering::Acquire) {
            WaitResult::Success
        } else {
            WaitResult::Closed
        }
    }

    /// Closes the channel, waking every blocked sender and receiver with a
    /// failure result. Closing twice is a programming error.
    pub fn close(&self) {
        let mut woken = Vec::new();
        {
            let mut inner = self.inner.lock();
            assert!(!inner.closed, "waitable: close on already-closed waitable");
            inner.closed = true;

            while let Some(wt) = Self::dequeue_live(&mut inner.wait_queue) {
                *wt.thread.waker.lock() = Some(wt.clone());
                wt.success.store(false, Ordering::Release);
                woken.push(wt.thread.clone());
            }
            while let Some(wt) = Self::dequeue_live(&mut inner.send_queue) {
                *wt.thread.waker.lock() = Some(wt.clone());
                wt.success.store(false, Ordering::Release);
                woken.push(wt.thread.clone());
            }
        }
        for thread in woken {
            scheduler::ready_thread(thread);
        }
    }

    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// One leg of a [`select`]: either a send or a receive against a waitable.
pub struct SelectCase {
    pub waitable: Arc<Waitable>,
    pub is_send: bool,
}

/// Xorshift64* PRNG seeded from the TSC. Good enough to avoid always
/// polling select cases in the same order; not cryptographic.
fn fastrand() -> u64 {
    static STATE: AtomicU64 = AtomicU64::new(0);
    let mut x = STATE.load(Ordering::Relaxed);
    if x == 0 {
        x = crate::time::tsc::value() | 1;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    STATE.store(x, Ordering::Relaxed);
    x
}

fn fastrandn(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (fastrand() % n as u64) as usize
    }
}

fn poll_order(n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let j = fastrandn(i + 1);
        order.swap(i, j);
    }
    order
}

fn lock_order(cases: &[SelectCase]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..cases.len()).collect();
    order.sort_by_key(|&i| cases[i].waitable.key());
    order
}

/// Locks every distinct waitable among `cases`, in address order, and
/// returns one guard per distinct waitable (not one per case — duplicate
/// waitables across cases share a guard).
fn lock_distinct<'a>(cases: &'a [SelectCase], locks: &[usize]) -> Vec<(usize, MutexGuard<'a, Inner>)> {
    let mut guards = Vec::with_capacity(locks.len());
    for &i in locks {
        let key = cases[i].waitable.key();
        if guards.last().map(|(k, _)| *k) != Some(key) {
            guards.push((key, cases[i].waitable.inner.lock()));
        }
    }
    guards
}

fn guard_mut<'a, 'b>(guards: &'b mut [(usize, MutexGuard<'a, Inner>)], key: usize) -> &'b mut Inner {
    guards
        .iter_mut()
        .find(|(k, _)| *k == key)
        .map(|(_, g)| &mut **g)
        .expect("select: missing lock for waitable")
}

/// Outcome of a [`select`]: which case fired, and whether it succeeded
/// (a closed channel resolves a recv case with `success = false`).
pub struct SelectOutcome {
    pub index: usize,
    pub success: bool,
}

/// Waits on multiple send/receive cases at once, completing exactly one.
/// Returns `None` if `block` is false and no case is immediately ready.
///
/// Pass 1 scans in random order for a case that can complete without
/// parking. If none can, pass 2 enqueues this thread on every case and
/// parks; pass 3, after waking, removes the thread from every case but the
/// one that woke it.
pub fn select(cases: &[SelectCase], block: bool) -> Option<SelectOutcome> {
    assert!(!cases.is_empty(), "select with no cases");

    let polls = poll_order(cases.len());
    let locks = lock_order(cases);

    let mut guards = lock_distinct(cases, &locks);

    let mut immediate = None;
    for &i in &polls {
        let case = &cases[i];
        let key = case.waitable.key();
        let inner = guard_mut(&mut guards, key);

        if case.is_send {
            assert!(!inner.closed, "select: send on closed waitable");
            if let Some(wt) = Waitable::dequeue_live(&mut inner.wait_queue) {
                *wt.thread.waker.lock() = Some(wt.clone());
                wt.success.store(true, Ordering::Release);
                scheduler::ready_thread(wt.thread.clone());
                immediate = Some(SelectOutcome { index: i, success: true });
                break;
            }
            if inner.count < case.waitable.size {
                inner.count += 1;
                immediate = Some(SelectOutcome { index: i, success: true });
                break;
            }
        } else {
            if !inner.closed {
                if let Some(wt) = Waitable::dequeue_live(&mut inner.send_queue) {
                    *wt.thread.waker.lock() = Some(wt.clone());
                    wt.success.store(true, Ordering::Release);
                    scheduler::ready_thread(wt.thread.clone());
                    immediate = Some(SelectOutcome { index: i, success: true });
                    break;
                }
            }
            if inner.count > 0 {
                inner.count -= 1;
                immediate = Some(SelectOutcome { index: i, success: true });
                break;
            }
            if inner.closed {
                immediate = Some(SelectOutcome { index: i, success: false });
                break;
            }
        }
    }

    if immediate.is_some() || !block {
        drop(guards);
        return immediate;
    }

    // Pass 2: enqueue a wait node on every case, then park.
    let thread = scheduler::current_thread();
    thread.select_done.store(false, Ordering::Release);

    let mut nodes = Vec::with_capacity(cases.len());
    for case in cases {
        let node = WaitingThread::new_select(thread.clone());
        let key = case.waitable.key();
        let inner = guard_mut(&mut guards, key);
        if case.is_send {
            inner.send_queue.push_back(node.clone());
        } else {
            inner.wait_queue.push_back(node.clone());
        }
        nodes.push(node);
    }

    scheduler::park_with(move || drop(guards));

    // Pass 3: remove ourselves from every case except the one that woke us.
    let waker = thread.waker.lock().take();
    let mut guards = lock_distinct(cases, &locks);
    for (i, case) in cases.iter().enumerate() {
        if let Some(w) = &waker {
            if Arc::ptr_eq(w, &nodes[i]) {
                continue;
            }
        }
        let key = case.waitable.key();
        let inner = guard_mut(&mut guards, key);
        let queue = if case.is_send {
            &mut inner.send_queue
        } else {
            &mut inner.wait_queue
        };
        let node = &nodes[i];
        queue.retain(|w| !Arc::ptr_eq(w, node));
    }
    drop(guards);

    let index = waker
        .and_then(|w| nodes.iter().position(|n| Arc::ptr_eq(n, &w)))
        .expect("select: woke with no matching case");
    Some(SelectOutcome {
        index,
        success: nodes[index].success.load(Ordering::Acquire),
    })
}

/// Creates a one-shot channel that yields a single value after
/// `microseconds`, matching the `time.After` idiom.
pub fn after(microseconds: u64) -> Arc<Waitable> {
    let w = Waitable::new(1);
    let sender = w.clone();
    let handle = timer::after(microseconds, move |_now| {
        sender.send(false);
        sender.close();
    });
    drop(handle);
    w
}
