//! Uncontended fast paths through `WordLock` and `Semaphore`. Both
//! primitives only touch the scheduler's slow path — parking — once a
//! waiter can't immediately make progress, so a single thread exercising
//! them here never needs the scheduler actually running.

use crate::harness::TestResult;
use kernel::sync::semaphore::Semaphore;
use kernel::sync::word_lock::WordLock;

pub fn test_word_lock_uncontended_round_trip() -> TestResult {
    let lock = WordLock::new();
    lock.lock();
    lock.unlock();
    lock.lock();
    lock.unlock();
    TestResult::Ok
}

pub fn test_semaphore_permits_are_conserved() -> TestResult {
    let sem = Semaphore::new(1);

    if !sem.acquire(false, Some(0)) {
        return TestResult::Failed("acquiring the only permit should succeed".into());
    }
    if sem.acquire(false, Some(0)) {
        return TestResult::Failed("a second non-blocking acquire with no permits left should fail".into());
    }

    sem.release(false);

    if !sem.acquire(false, Some(0)) {
        return TestResult::Failed("the released permit should be acquirable again".into());
    }

    TestResult::Ok
}
