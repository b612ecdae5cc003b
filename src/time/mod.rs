pub mod lapic_timer;
pub mod pit;
pub mod tsc;

use core::sync::atomic::Ordering;

/// Runs this CPU's due timers. Returns the absolute deadline (in
/// [`now_us`] units) of whatever is armed next on this heap, or 0 if
/// nothing is. The scheduler folds this into whatever deadline it arms
/// for the next quantum, so a timer never waits behind a long quantum.
pub fn on_timer_tick() -> i64 {
    let cpu = crate::memory::cpu_local_data::get_local();
    cpu.timers.check(now_us() as i64)
}

/// Re-arms the LAPIC deadline for whichever is sooner: `quantum_us` from
/// now, or this CPU's next timer deadline (`next_timer_us`, absolute,
/// 0 if none armed).
pub fn arm_deadline(quantum_us: u64, next_timer_us: i64) {
    let deadline_us = if next_timer_us == 0 {
        quantum_us
    } else {
        let remaining = next_timer_us.saturating_sub(now_us() as i64).max(0) as u64;
        remaining.min(quantum_us)
    };
    lapic_timer::set_deadline(deadline_us * 1_000);
}

/// Microseconds since TSC calibration. Not wall-clock time: only valid for
/// measuring deltas within a boot.
pub fn now_us() -> u64 {
    let hz = tsc::TSC_HZ.load(Ordering::SeqCst);
    if hz == 0 {
        return 0;
    }
    (tsc::value() * 1_000_000) / hz
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Period(u64);

impl Period {
    /// Creates a new period with the specified microseconds.
    pub fn new(period: u64) -> Self {
        Self(period)
    }
}

impl From<Period> for u64 {
    /// Returns the period in microseconds.
    fn from(f: Period) -> Self {
        f.0
    }
}