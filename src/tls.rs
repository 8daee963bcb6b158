//! Per-OS-thread lookups: the worker bound to this thread, and the fiber it
//! is currently executing on.

use std::cell::Cell;
use std::ptr;

use crate::fiber::Fiber;
use crate::worker::Worker;

// The worker descriptor lives in the global state for the whole life of the
// pool, so a raw pointer in TLS stays valid until the scheduler thread
// unwinds. Using a raw pointer avoids a RefCell on the hot path.
thread_local! {
    static WORKER: Cell<*const Worker> = Cell::new(ptr::null());
    static FIBER: Cell<*const Fiber> = Cell::new(ptr::null());
}

/// Binds `w` as this thread's worker. Done once, during worker startup.
pub unsafe fn set_worker(w: *const Worker) {
    WORKER.with(|cell| {
        debug_assert!(cell.get().is_null());
        cell.set(w);
    });
}

/// The worker bound to this thread, or null on a non-worker thread.
#[inline]
pub fn worker() -> *const Worker {
    WORKER.with(|cell| cell.get())
}

/// The worker bound to this thread; panics off the pool.
#[inline]
pub fn worker_ref() -> &'static Worker {
    let w = worker();
    rts_assert!(!w.is_null(), "not on a worker thread");
    unsafe { &*w }
}

#[inline]
pub fn set_fiber(fiber: *const Fiber) {
    FIBER.with(|cell| cell.set(fiber));
}

/// The fiber this thread is currently executing on, or null while in the
/// scheduling context.
#[inline]
pub fn fiber() -> *const Fiber {
    FIBER.with(|cell| cell.get())
}
