//! Per-CPU timer wheel: a 4-ary min-heap of deadlines, checked from the
//! local tick handler.
//!
//! Modifying or deleting a timer that lives in another CPU's heap can't
//! touch that heap directly without a cross-CPU lock, so both operations
//! are lazy: they flip the timer's status and stash the new deadline in
//! `next_when`, and the owning CPU folds the change in the next time it
//! walks its heap (`adjust`). This mirrors the reference scheduler's timer
//! subsystem rather than a plain "lock and splice" design.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;

use crate::memory::cpu_local_data;
use crate::time;

/// Sentinel `owner_cpu` value for a timer that has never been armed.
const NO_OWNER: u32 = u32::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerStatus {
    NoStatus = 0,
    Waiting = 1,
    Running = 2,
    Deleted = 3,
    Removing = 4,
    Removed = 5,
    Modifying = 6,
    ModifiedEarlier = 7,
    ModifiedLater = 8,
    Moving = 9,
}

impl TimerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NoStatus,
            1 => Self::Waiting,
            2 => Self::Running,
            3 => Self::Deleted,
            4 => Self::Removing,
            5 => Self::Removed,
            6 => Self::Modifying,
            7 => Self::ModifiedEarlier,
            8 => Self::ModifiedLater,
            9 => Self::Moving,
            _ => unreachable!("invalid timer status"),
        }
    }
}

struct AtomicTimerStatus(AtomicU8);

impl AtomicTimerStatus {
    fn new(s: TimerStatus) -> Self {
        Self(AtomicU8::new(s as u8))
    }

    fn load(&self) -> TimerStatus {
        TimerStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn cas(&self, old: TimerStatus, new: TimerStatus) -> bool {
        self.0
            .compare_exchange(old as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub type TimerCallback = Box<dyn FnMut(u64) + Send>;

/// A single scheduled callback, armed on exactly one CPU's heap at a time.
pub struct Timer {
    /// Microseconds since boot at which this timer fires.
    when: AtomicI64,
    /// Deadline waiting to be folded in by the owning CPU, valid only while
    /// `status` is one of the `Modified*` variants.
    next_when: AtomicI64,
    /// Non-zero for a repeating timer; the gap between firings. Atomic
    /// because `modify` may change it without the owning CPU's heap lock.
    period: AtomicI64,
    status: AtomicTimerStatus,
    func: Mutex<TimerCallback>,
    /// Kernel id of the CPU whose heap this timer is armed on, `NO_OWNER`
    /// until `start`. Lets `stop`/`modify` — which may run on any CPU — find
    /// the right heap to bump `deleted`/`modified_earliest` on.
    owner_cpu: AtomicU32,
}

/// A cloneable, reference-counted reference to an armed timer.
#[derive(Clone)]
pub struct TimerHandle(Arc<Timer>);

impl TimerHandle {
    pub fn stop(&self) -> bool {
        stop(&self.0)
    }

    /// Reschedules an already-armed timer to fire at `when_us` with the new
    /// `period_us`, without touching the owning CPU's heap directly — see
    /// [`TimerHeap::start`] for why this has to be lazy.
    pub fn modify(&self, when_us: i64, period_us: i64) -> bool {
        modify(&self.0, when_us, period_us)
    }
}

/// Creates a timer firing once at `when_us` (microseconds since boot), not
/// yet armed on any CPU's heap. Call [`start`] to arm it.
pub fn create(when_us: i64, func: impl FnMut(u64) + Send + 'static) -> TimerHandle {
    TimerHandle(Arc::new(Timer {
        when: AtomicI64::new(when_us),
        next_when: AtomicI64::new(0),
        period: AtomicI64::new(0),
        status: AtomicTimerStatus::new(TimerStatus::NoStatus),
        func: Mutex::new(Box::new(func)),
        owner_cpu: AtomicU32::new(NO_OWNER),
    }))
}

/// Creates a timer that fires every `period_us` microseconds, starting at
/// `when_us`. Not yet armed — call [`start`].
pub fn create_periodic(
    when_us: i64,
    period_us: i64,
    func: impl FnMut(u64) + Send + 'static,
) -> TimerHandle {
    TimerHandle(Arc::new(Timer {
        when: AtomicI64::new(when_us),
        next_when: AtomicI64::new(0),
        period: AtomicI64::new(period_us),
        status: AtomicTimerStatus::new(TimerStatus::NoStatus),
        func: Mutex::new(Box::new(func)),
        owner_cpu: AtomicU32::new(NO_OWNER),
    }))
}

/// Arms `handle` on the calling CPU's heap.
pub fn start(handle: TimerHandle) {
    let cpu = cpu_local_data::get_local();
    cpu.timers.start(cpu.kernel_id, handle);
}

/// A CPU's private timer heap. One instance lives in each CPU's
/// [`crate::memory::cpu_local_data::CpuLocalData`].
pub struct TimerHeap {
    heap: Mutex<Vec<Arc<Timer>>>,
    deleted: AtomicU32,
    /// Timers currently armed on this heap (incremented by `start`,
    /// decremented only when a timer is permanently retired — fired
    /// non-periodic, or stopped and reaped). Never touched by a lazy
    /// modify/move, since those don't change how many timers are live.
    num_timers: AtomicUsize,
    /// Deadline of `heap[0]`, or 0 if empty. Readable without the lock so
    /// the tick handler can skip the heap entirely on a quiet CPU.
    timer0_when: AtomicI64,
    /// Earliest known `next_when` among timers modified to an earlier time.
    modified_earliest: AtomicI64,
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHeap {
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Vec::new()),
            deleted: AtomicU32::new(0),
            num_timers: AtomicUsize::new(0),
            timer0_when: AtomicI64::new(0),
            modified_earliest: AtomicI64::new(0),
        }
    }

    /// Arms `timer` on this heap, recording it as this CPU's so a later
    /// `stop`/`modify` from any CPU knows where to publish its effect. The
    /// timer must not already be armed.
    pub fn start(&self, owner_id: u32, timer: TimerHandle) {
        let t = &timer.0;
        assert!(t.when.load(Ordering::Relaxed) > 0, "timer when must be positive");
        assert_eq!(t.status.load(), TimerStatus::NoStatus);
        t.owner_cpu.store(owner_id, Ordering::Release);
        t.status.0.store(TimerStatus::Waiting as u8, Ordering::Release);
        self.num_timers.fetch_add(1, Ordering::AcqRel);

        let mut heap = self.heap.lock();
        self.clean_locked(&mut heap);
        self.add_locked(&mut heap, t.clone());
    }

    /// Returns the deadline of this heap's earliest timer, 0 if empty.
    pub fn next_deadline(&self) -> i64 {
        let next = self.timer0_when.load(Ordering::Acquire);
        let adj = self.modified_earliest.load(Ordering::Acquire);
        if next == 0 || (adj != 0 && adj < next) {
            adj
        } else {
            next
        }
    }

    /// Number of timers currently armed on this heap.
    pub fn num_timers(&self) -> usize {
        self.num_timers.load(Ordering::Acquire)
    }

    /// Number of armed timers pending physical removal (cancelled, waiting
    /// for the next `check` to reap them). Used to decide when a
    /// compaction pass is worth the cost.
    pub fn deleted_timers(&self) -> usize {
        self.deleted.load(Ordering::Acquire) as usize
    }

    /// Folds in a `modify(.., earlier)` that landed on this heap from
    /// (possibly) another CPU, keeping the running minimum so `next_deadline`
    /// stays accurate without re-scanning the heap.
    pub fn publish_modified_earliest(&self, when_us: i64) {
        loop {
            let cur = self.modified_earliest.load(Ordering::Acquire);
            if cur != 0 && cur <= when_us {
                return;
            }
            if self
                .modified_earliest
                .compare_exchange(cur, when_us, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Runs every timer whose deadline has passed. Called from the local
    /// tick handler; returns the next deadline to poll for, or 0 if the
    /// heap is now empty.
    pub fn check(&self, now: i64) -> i64 {
        if self.next_deadline() == 0 || self.next_deadline() > now {
            return self.next_deadline();
        }

        let mut heap = self.heap.lock();
        if heap.is_empty() {
            return 0;
        }

        self.adjust_locked(&mut heap, now);

        loop {
            if heap.is_empty() {
                break;
            }
            match self.run_one_locked(&mut heap, now) {
                RunResult::Ran => continue,
                RunResult::NotYet(when) => return when,
                RunResult::Empty => break,
            }
        }

        if self.deleted.load(Ordering::Acquire) as usize >= heap.len() / 4 {
            self.clean_locked(&mut heap);
        }

        self.next_deadline()
    }

    fn add_locked(&self, heap: &mut Vec<Arc<Timer>>, timer: Arc<Timer>) {
        heap.push(timer);
        let i = heap.len() - 1;
        sift_up(heap, i);
        self.update_timer0(heap);
    }

    fn delete_index_locked(&self, heap: &mut Vec<Arc<Timer>>, i: usize) {
        let last = heap.len() - 1;
        if i != last {
            heap.swap(i, last);
        }
        heap.pop();
        if i != last && i < heap.len() {
            let smallest = sift_up(heap, i);
            sift_down(heap, smallest);
        }
        if i == 0 {
            self.update_timer0(heap);
        }
    }

    fn update_timer0(&self, heap: &[Arc<Timer>]) {
        let when = heap.first().map_or(0, |t| t.when.load(Ordering::Relaxed));
        self.timer0_when.store(when, Ordering::Release);
    }

    fn clean_locked(&self, heap: &mut Vec<Arc<Timer>>) {
        let mut i = 0;
        while i < heap.len() {
            let timer = heap[i].clone();
            match timer.status.load() {
                TimerStatus::Deleted => {
                    if timer.status.cas(TimerStatus::Deleted, TimerStatus::Removing) {
                        self.delete_index_locked(heap, i);
                        timer.status.cas(TimerStatus::Removing, TimerStatus::Removed);
                        self.deleted.fetch_sub(1, Ordering::AcqRel);
                        self.num_timers.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                }
                TimerStatus::ModifiedEarlier | TimerStatus::ModifiedLater => {
                    if timer.status.cas(timer.status.load(), TimerStatus::Moving) {
                        timer
                            .when
                            .store(timer.next_when.load(Ordering::Acquire), Ordering::Release);
                        self.delete_index_locked(heap, i);
                        self.add_locked(heap, timer.clone());
                        timer.status.cas(TimerStatus::Moving, TimerStatus::Waiting);
                        continue;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    fn adjust_locked(&self, heap: &mut Vec<Arc<Timer>>, now: i64) {
        let first = self.modified_earliest.swap(0, Ordering::AcqRel);
        if first == 0 || first > now {
            self.modified_earliest.store(first, Ordering::Release);
            return;
        }

        let mut moved = Vec::new();
        let mut i = 0;
        while i < heap.len() {
            let timer = heap[i].clone();
            match timer.status.load() {
                TimerStatus::Deleted => {
                    if timer.status.cas(TimerStatus::Deleted, TimerStatus::Removing) {
                        self.delete_index_locked(heap, i);
                        timer.status.cas(TimerStatus::Removing, TimerStatus::Removed);
                        self.deleted.fetch_sub(1, Ordering::AcqRel);
                        self.num_timers.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                }
                TimerStatus::ModifiedEarlier | TimerStatus::ModifiedLater => {
                    if timer.status.cas(timer.status.load(), TimerStatus::Moving) {
                        timer
                            .when
                            .store(timer.next_when.load(Ordering::Acquire), Ordering::Release);
                        self.delete_index_locked(heap, i);
                        moved.push(timer);
                        continue;
                    }
                }
                _ => {}
            }
            i += 1;
        }

        for timer in moved {
            self.add_locked(heap, timer.clone());
            timer.status.cas(TimerStatus::Moving, TimerStatus::Waiting);
        }
    }

    fn run_one_locked(&self, heap: &mut Vec<Arc<Timer>>, now: i64) -> RunResult {
        loop {
            let timer = heap[0].clone();
            match timer.status.load() {
                TimerStatus::Waiting => {
                    let when = timer.when.load(Ordering::Acquire);
                    if when > now {
                        return RunResult::NotYet(when);
                    }
                    if !timer.status.cas(TimerStatus::Waiting, TimerStatus::Running) {
                        continue;
                    }

                    let period = timer.period.load(Ordering::Relaxed);
                    if period > 0 {
                        let delta = when - now;
                        let mut next = when + period * (1 + (-delta / period));
                        if next < 0 {
                            next = i64::MAX;
                        }
                        timer.when.store(next, Ordering::Release);
                        sift_down(heap, 0);
                        timer.status.cas(TimerStatus::Running, TimerStatus::Waiting);
                        self.update_timer0(heap);
                    } else {
                        self.delete_index_locked(heap, 0);
                        timer.status.cas(TimerStatus::Running, TimerStatus::NoStatus);
                        self.num_timers.fetch_sub(1, Ordering::AcqRel);
                    }

                    (timer.func.lock())(now as u64);
                    return RunResult::Ran;
                }
                TimerStatus::Deleted => {
                    if !timer.status.cas(TimerStatus::Deleted, TimerStatus::Removing) {
                        continue;
                    }
                    self.delete_index_locked(heap, 0);
                    timer.status.cas(TimerStatus::Removing, TimerStatus::Removed);
                    self.deleted.fetch_sub(1, Ordering::AcqRel);
                    self.num_timers.fetch_sub(1, Ordering::AcqRel);
                    if heap.is_empty() {
                        return RunResult::Empty;
                    }
                }
                TimerStatus::ModifiedEarlier | TimerStatus::ModifiedLater => {
                    // Stale position: this timer's real deadline (`next_when`)
                    // no longer belongs at the heap's root. Relocate it rather
                    // than discard it — `modify` only changes when it fires,
                    // never whether it fires.
                    let cur = timer.status.load();
                    if !timer.status.cas(cur, TimerStatus::Moving) {
                        continue;
                    }
                    timer
                        .when
                        .store(timer.next_when.load(Ordering::Acquire), Ordering::Release);
                    self.delete_index_locked(heap, 0);
                    self.add_locked(heap, timer.clone());
                    timer.status.cas(TimerStatus::Moving, TimerStatus::Waiting);
                }
                _ => core::hint::spin_loop(),
            }
        }
    }
}

enum RunResult {
    Ran,
    NotYet(i64),
    Empty,
}

fn sift_up(heap: &mut [Arc<Timer>], mut i: usize) -> usize {
    let when = heap[i].when.load(Ordering::Relaxed);
    while i > 0 {
        let parent = (i - 1) / 4;
        if when >= heap[parent].when.load(Ordering::Relaxed) {
            break;
        }
        heap.swap(i, parent);
        i = parent;
    }
    i
}

fn sift_down(heap: &mut [Arc<Timer>], mut i: usize) {
    let n = heap.len();
    loop {
        let left = i * 4 + 1;
        if left >= n {
            break;
        }
        let mut best = left;
        let mut best_when = heap[left].when.load(Ordering::Relaxed);
        for child in left + 1..core::cmp::min(left + 4, n) {
            let when = heap[child].when.load(Ordering::Relaxed);
            if when < best_when {
                best_when = when;
                best = child;
            }
        }
        if best_when >= heap[i].when.load(Ordering::Relaxed) {
            break;
        }
        heap.swap(i, best);
        i = best;
    }
}

/// Looks up the heap `timer` is armed on, if any.
fn owner_heap(timer: &Timer) -> Option<&'static TimerHeap> {
    let id = timer.owner_cpu.load(Ordering::Acquire);
    if id == NO_OWNER {
        return None;
    }
    cpu_local_data::try_get_ready_cpu(id).map(|cpu| &cpu.timers)
}

/// Cancels `timer`. Returns `true` if it was still pending. Mirrors
/// `stop`'s contract: CAS through `Modifying` so a concurrent `modify`
/// never observes a torn status, then bump the owning heap's `deleted`
/// count so it knows to compact.
fn stop(timer: &Arc<Timer>) -> bool {
    loop {
        let cur = timer.status.load();
        match cur {
            TimerStatus::Waiting | TimerStatus::ModifiedLater | TimerStatus::ModifiedEarlier => {
                if timer.status.cas(cur, TimerStatus::Modifying) {
                    timer.status.cas(TimerStatus::Modifying, TimerStatus::Deleted);
                    if let Some(heap) = owner_heap(timer) {
                        heap.deleted.fetch_add(1, Ordering::AcqRel);
                    }
                    return true;
                }
            }
            TimerStatus::Deleted | TimerStatus::Removing | TimerStatus::Removed => return false,
            TimerStatus::NoStatus => return false,
            _ => core::hint::spin_loop(),
        }
    }
}

/// Reschedules `timer` to `when_us`/`period_us` without touching the owning
/// CPU's heap directly — it stashes the new deadline in `next_when` and
/// flips the status to `ModifiedEarlier`/`ModifiedLater`, which the owning
/// CPU folds in on its next `check`. Returns `false` if the timer had
/// already fired, been stopped, or was never armed.
fn modify(timer: &Arc<Timer>, when_us: i64, period_us: i64) -> bool {
    loop {
        let cur = timer.status.load();
        let reference = match cur {
            TimerStatus::Waiting => Some(timer.when.load(Ordering::Acquire)),
            TimerStatus::ModifiedEarlier | TimerStatus::ModifiedLater => {
                Some(timer.next_when.load(Ordering::Acquire))
            }
            _ => None,
        };
        let Some(reference) = reference else {
            return false;
        };

        if !timer.status.cas(cur, TimerStatus::Modifying) {
            continue;
        }

        timer.next_when.store(when_us, Ordering::Release);
        timer.period.store(period_us, Ordering::Release);
        let earlier = when_us < reference;
        let new_status = if earlier {
            TimerStatus::ModifiedEarlier
        } else {
            TimerStatus::ModifiedLater
        };
        let moved = timer.status.cas(TimerStatus::Modifying, new_status);
        debug_assert!(moved, "modify: status changed under Modifying");

        if earlier && let Some(heap) = owner_heap(timer) {
            heap.publish_modified_earliest(when_us);
            let owner = timer.owner_cpu.load(Ordering::Acquire);
            if owner != cpu_local_data::get_local().kernel_id {
                crate::apic::send_ipi_to(
                    cpu_local_data::local_apic_id_of(owner) as u8,
                    crate::interrupt::InterruptVector::Reschedule,
                );
            }
        }
        return true;
    }
}

/// Schedules `func` to run once, `microseconds` from now, armed on the
/// calling CPU's heap.
pub fn after(microseconds: u64, func: impl FnMut(u64) + Send + 'static) -> TimerHandle {
    let when = time::now_us() as i64 + microseconds as i64;
    let handle = create(when, func);
    start(handle.clone());
    handle
}
