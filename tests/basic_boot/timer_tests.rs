//! Per-CPU timer heap bookkeeping. Run before interrupts are enabled, so
//! nothing here depends on a tick actually firing — only on `create`/
//! `start`/`stop`/`modify` keeping the heap's accounting honest.

use crate::harness::TestResult;
use alloc::format;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel::memory::cpu_local_data::get_local;
use kernel::sched::timer;
use kernel::time::now_us;

pub fn test_timer_heap_starts_empty() -> TestResult {
    let cpu = get_local();
    if cpu.timers.num_timers() != 0 {
        return TestResult::Failed(format!(
            "expected an empty timer heap before any test arms one, found {} armed",
            cpu.timers.num_timers()
        ));
    }
    if cpu.timers.next_deadline() != 0 {
        return TestResult::Failed("empty heap should report no next deadline".into());
    }
    TestResult::Ok
}

static STOPPED_TIMER_FIRED: AtomicBool = AtomicBool::new(false);

pub fn test_stop_before_fire_prevents_delivery() -> TestResult {
    STOPPED_TIMER_FIRED.store(false, Ordering::SeqCst);

    let when = now_us() as i64 + 10_000_000;
    let handle = timer::create(when, |_now| STOPPED_TIMER_FIRED.store(true, Ordering::SeqCst));
    timer::start(handle.clone());

    if !handle.stop() {
        return TestResult::Failed("stop() on a just-armed timer should report it was pending".into());
    }
    if handle.stop() {
        return TestResult::Failed("stopping an already-stopped timer twice should find nothing left to cancel".into());
    }
    if STOPPED_TIMER_FIRED.load(Ordering::SeqCst) {
        return TestResult::Failed("a stopped timer must never run its callback".into());
    }

    TestResult::Ok
}

pub fn test_modify_reorders_next_deadline() -> TestResult {
    let cpu = get_local();
    let base = now_us() as i64;

    let near = timer::create(base + 1_000_000, |_| {});
    let far = timer::create(base + 5_000_000, |_| {});
    timer::start(near.clone());
    timer::start(far.clone());

    let before = cpu.timers.next_deadline();
    if before != base + 1_000_000 {
        return TestResult::Failed(format!(
            "expected the nearer timer's deadline {}, got {before}",
            base + 1_000_000
        ));
    }

    let new_deadline = base + 250_000;
    if !far.modify(new_deadline, 0) {
        return TestResult::Failed("modify() on a still-armed timer should succeed".into());
    }

    let after = cpu.timers.next_deadline();
    if after != new_deadline {
        return TestResult::Failed(format!(
            "modify() to an earlier deadline should move next_deadline() to {new_deadline}, got {after}"
        ));
    }

    near.stop();
    far.stop();
    TestResult::Ok
}
