//! Parking-based synchronization primitives built on the scheduler.

pub mod semaphore;
pub mod waitable;
pub mod word_lock;
