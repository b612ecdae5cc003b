//! FPU/SSE state, saved and restored around a context switch with
//! `fxsave`/`fxrstor` so a thread's floating-point and vector registers
//! survive being preempted mid-computation.
//!
//! Kept separate from [`crate::sched::thread::CpuContext`]: the GPR file is
//! addressed field-by-field from the naked-asm trampolines, but the FPU
//! block is opaque — `fxsave`/`fxrstor` own its layout entirely, so Rust
//! only ever needs a 512-byte-aligned buffer, never its contents.

use core::arch::x86_64::{_fxrstor64, _fxsave64};

/// Legacy `fxsave` area: 512 bytes, 16-byte aligned. `xsave` would cover AVX
/// state too, but `fxsave` is the baseline every x86-64 CPU supports and
/// this kernel doesn't yet hand out AVX registers to threads.
#[repr(align(16))]
pub struct FpuState([u8; 512]);

impl FpuState {
    pub const fn new() -> Self {
        FpuState([0; 512])
    }

    /// Saves the CPU's current FPU/SSE state into `self`.
    ///
    /// # Safety
    /// Must only be called for a thread that is about to stop running —
    /// never concurrently with another save/restore touching the same
    /// `FpuState`.
    pub unsafe fn save(&mut self) {
        unsafe { _fxsave64(self.0.as_mut_ptr()) };
    }

    /// Restores `self` onto the CPU, making it the live FPU/SSE state.
    ///
    /// # Safety
    /// Must only be called for the thread about to start running on this
    /// CPU, with `self` previously populated by [`Self::save`] (or still
    /// zeroed, for a thread that has never run).
    pub unsafe fn restore(&self) {
        unsafe { _fxrstor64(self.0.as_ptr()) };
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}
