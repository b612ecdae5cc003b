pub const HIGHER_HALF_START: u64 = 0xFFFF800000000000;
/// Last canonical address in the lower half (inclusive).
/// In 48-bit virtual addressing: bits 63:47 must all be 0 for the lower half.
pub const LOWER_HALF_END: u64 = 0x7FFFFFFFFFFF;

pub const USER_MIN: u64 = 0x1000;
pub const USER_MAX: u64 = LOWER_HALF_END;

// Apic timer
pub const APIC_TIMER_DISABLE: u32 = 1 << 16;
pub const APIC_TIMER_MODE_ONESHOT: u32 = 0b00 << 17;
pub const APIC_TIMER_MODE_PERIODIC: u32 = 0b01 << 17;
pub const APIC_TIMER_MODE_TSC_DEADLINE: u32 = 0b10 << 17;

// Legacy PIT (8254), used only to calibrate the TSC during early boot.
pub const PIT_CH0: u16 = 0x40;
pub const PIT_CMD: u16 = 0x43;
pub const PIT_FREQ: u32 = 1_193_182;

/// Scheduler tick period, in microseconds. The timer subsystem and the
/// scheduler's global-queue fairness sampling are both expressed in units
/// of this tick.
pub const SCHED_TICK_US: u64 = 1_000;
