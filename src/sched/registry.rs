//! The live-thread registry: every thread not yet torn down, for a GC
//! collaborator's stop-the-world scan ([`lock_all_threads`]).
//!
//! Threads register in [`crate::sched::thread::Thread::new`] and
//! deregister once `on_drop` marks them `Dead`. The registry holds `Weak`
//! references, never `Arc`s, so it never keeps a dead thread's stack and
//! TCB alive on its own.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, Ordering};
use spin::{Mutex, MutexGuard};

use crate::sched::thread::Thread;

static ALL_THREADS: Mutex<Vec<Weak<Thread>>> = Mutex::new(Vec::new());

/// Template for [`crate::sched::thread::Tcb::gc_thread_data`], set by
/// whatever GC collaborator is linked in. Copied, not cloned: the scheduler
/// never dereferences the pointer, so ownership of what it points to is
/// entirely the GC's business.
static GC_THREAD_DATA_TEMPLATE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub(crate) fn register(thread: &Arc<Thread>) {
    ALL_THREADS.lock().push(Arc::downgrade(thread));
}

pub(crate) fn unregister(thread: &Thread) {
    let mut all = ALL_THREADS.lock();
    if let Some(i) = all.iter().position(|w| w.as_ptr() == thread as *const Thread) {
        all.swap_remove(i);
    }
}

/// Lets a GC collaborator install the per-thread data template copied into
/// every new thread's TCB. Takes effect for threads created after the call;
/// existing threads keep whatever they already have.
pub fn set_default_gc_thread_data(template: *mut ()) {
    GC_THREAD_DATA_TEMPLATE.store(template, Ordering::Release);
}

pub(crate) fn default_gc_thread_data() -> *mut () {
    GC_THREAD_DATA_TEMPLATE.load(Ordering::Acquire)
}

/// Stop-the-world handle: while held, [`iter`](ThreadsGuard::iter) yields
/// every thread still live when the lock was taken. Holding this does not
/// itself stop any of them from running — pair it with
/// [`crate::sched::scheduler::suspend`] on whichever threads need to be at a
/// safepoint before their stacks are inspected.
pub struct ThreadsGuard<'a>(MutexGuard<'a, Vec<Weak<Thread>>>);

impl ThreadsGuard<'_> {
    pub fn iter(&self) -> impl Iterator<Item = Arc<Thread>> + '_ {
        self.0.iter().filter_map(Weak::upgrade)
    }
}

/// Takes the registry lock for a stop-the-world scan.
pub fn lock_all_threads() -> ThreadsGuard<'static> {
    ThreadsGuard(ALL_THREADS.lock())
}

/// Releases the lock taken by [`lock_all_threads`]. Spells out the paired
/// contract by name; dropping the guard does the same thing.
pub fn unlock_all_threads(guard: ThreadsGuard<'static>) {
    drop(guard);
}
