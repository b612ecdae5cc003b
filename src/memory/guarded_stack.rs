use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use x86_64::VirtAddr;

/// Matches the reference scheduler's per-thread stack size. Upstream backs
/// this with a lazily-committed mapping plus a 2 MiB guard region below it;
/// this kernel has no private page table walker to do that with, so the
/// whole thing is eagerly allocated from the heap instead, at the same
/// size, with no guard.
pub const NORMAL_STACK_SIZE: u64 = 8 * 1024 * 1024;
pub const EXCEPTION_HANDLER_STACK_SIZE: u64 = 16 * 0x400;

const STACK_ALIGN: usize = 16;

/// A heap-backed kernel stack.
///
/// This does not install a guard page — doing so would require a private
/// page table walker, which is out of scope here. Overflow is instead
/// bounded by sizing stacks generously; a canary word at the base would
/// catch gross overruns but is not load-bearing for correctness.
pub struct GuardedStack {
    base: *mut u8,
    size: usize,
}

// Safety: the stack memory is exclusively owned by whichever thread holds
// this handle; it is moved, never shared, between CPUs.
unsafe impl Send for GuardedStack {}

impl GuardedStack {
    pub fn new(size: u64) -> Self {
        let size = size as usize;
        let layout = Layout::from_size_align(size, STACK_ALIGN).unwrap();
        // Safety: layout is non-zero sized and validly aligned.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "out of memory allocating kernel stack");
        Self { base, size }
    }

    pub fn new_kernel() -> Self {
        Self::new(NORMAL_STACK_SIZE)
    }

    /// Address one past the last writable byte — where `rsp` starts.
    pub fn top(&self) -> VirtAddr {
        VirtAddr::new((self.base as u64) + self.size as u64)
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, STACK_ALIGN).unwrap();
        // Safety: `base`/`size` match the allocation made in `new`.
        unsafe { dealloc(self.base, layout) };
    }
}
