//! Waitable channel behavior that doesn't require a waiter to actually
//! park — everything here runs before interrupts are enabled, so it
//! sticks to the non-blocking (`block = false`) side of `send`/`wait`/
//! `select`.

use crate::harness::TestResult;
use alloc::format;
use kernel::sync::waitable::{SelectCase, WaitResult, Waitable};

pub fn test_buffered_send_then_wait() -> TestResult {
    let w = Waitable::new(2);

    if !w.send(false) {
        return TestResult::Failed("first send into a size-2 buffer should succeed".into());
    }
    if !w.send(false) {
        return TestResult::Failed("second send into a size-2 buffer should succeed".into());
    }
    if w.send(false) {
        return TestResult::Failed("third non-blocking send into a full size-2 buffer should fail".into());
    }

    if w.wait(false) != WaitResult::Success {
        return TestResult::Failed("first wait should drain a buffered value".into());
    }
    if w.wait(false) != WaitResult::Success {
        return TestResult::Failed("second wait should drain the other buffered value".into());
    }
    if w.wait(false) != WaitResult::Empty {
        return TestResult::Failed("wait on a drained, still-open channel should report Empty".into());
    }

    TestResult::Ok
}

pub fn test_rendezvous_wait_without_sender_is_empty() -> TestResult {
    let w = Waitable::new(0);
    match w.wait(false) {
        WaitResult::Empty => TestResult::Ok,
        other => TestResult::Failed(format!("expected Empty on a rendezvous channel with no sender, got {other:?}")),
    }
}

pub fn test_close_wakes_pending_as_closed() -> TestResult {
    let w = Waitable::new(1);
    w.close();

    if w.wait(false) != WaitResult::Closed {
        return TestResult::Failed("wait on a closed, empty channel should report Closed".into());
    }
    if w.send(false) {
        return TestResult::Failed("send on a closed channel should always fail".into());
    }

    TestResult::Ok
}

pub fn test_select_prefers_ready_case() -> TestResult {
    let idle = Waitable::new(1);
    let ready = Waitable::new(1);
    assert!(ready.send(false), "buffering into a fresh size-1 waitable can't fail");

    let cases = [
        SelectCase { waitable: idle.clone(), is_send: false },
        SelectCase { waitable: ready.clone(), is_send: false },
    ];

    match kernel::sync::waitable::select(&cases, false) {
        Some(outcome) if outcome.index == 1 && outcome.success => TestResult::Ok,
        Some(outcome) => TestResult::Failed(format!(
            "expected the ready case (index 1) to win, got index {} success {}",
            outcome.index, outcome.success
        )),
        None => TestResult::Failed("select with one ready case shouldn't return None".into()),
    }
}
