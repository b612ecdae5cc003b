use core::arch::x86_64::{__cpuid, __rdtscp, _mm_lfence, _rdtsc};
use core::sync::atomic::{AtomicU64, Ordering};
use crate::time::pit;

/// TSC ticks per second, set once by [`calibrate`].
pub static TSC_HZ: AtomicU64 = AtomicU64::new(0);

pub fn value() -> u64 {
    if has_rdtscp() {
        let mut aux = 0;
        unsafe { __rdtscp(&mut aux) }
    } else {
        unsafe {
            _mm_lfence();
            _rdtsc()
        }
    }
}

fn has_rdtscp() -> bool {
    let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
    if max_ext < 0x8000_0001 {
        return false;
    }

    let res = unsafe { __cpuid(0x8000_0001) };
    (res.edx & (1 << 27)) != 0
}

fn calibrate_with_pit() -> u64 {
    const PIT_WAIT_MS: u32 = 10;

    let start = value();
    pit::sleep_ms(PIT_WAIT_MS);
    let end = value();

    let elapsed = end.checked_sub(start).unwrap();
    (elapsed * 1000) / PIT_WAIT_MS as u64
}

/// Measures TSC frequency against the PIT. Must be called once during
/// early boot, on the bootstrap processor, before any thread relies on
/// [`value`] for timekeeping.
pub fn calibrate() {
    let hz = calibrate_with_pit();
    log::info!("tsc: {} Hz", hz);
    TSC_HZ.store(hz, Ordering::SeqCst);
}
