//! Fibers: guard-paged user stacks and the switches between a worker's
//! scheduling context and user code.
//!
//! Every closure executes on a fiber it owns; ownership travels with the
//! closure when it migrates between workers. Execution always enters a fiber
//! at the top of its stack, through the dispatch trampoline. Leaving a fiber
//! (a suspending sync, a stolen return, the root computation finishing) is a
//! one-way switch back to the scheduling context: whatever native frames are
//! still on the fiber are abandoned, never unwound, and the next user of the
//! stack simply starts over at the top. Lowered code therefore must not hold
//! anything owning across a runtime call that can surrender.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{AtomicIsize, Ordering};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use crate::frame::StackFrame;
use crate::tls;
use crate::worker::Worker;

static LIVE_FIBERS: AtomicIsize = AtomicIsize::new(0);

/// Fibers alive across the process, pooled ones included.
pub fn live_count() -> isize {
    LIVE_FIBERS.load(Ordering::SeqCst)
}

// An mmap-backed stack: one protection page at the low end, usable region
// growing downward. The raw pointers inside are only touched through the
// switch functions below.
struct StackMem(ProtectedFixedSizeStack);

unsafe impl Send for StackMem {}

pub struct Fiber {
    stack: StackMem,
    /// Worker currently using this fiber.
    owner: Cell<*const Worker>,
    /// The frame dispatch should resume when first scheduling this fiber.
    resume_sf: Cell<*mut StackFrame>,
}

unsafe impl Send for Fiber {}

impl Fiber {
    pub fn allocate(stacksize: usize) -> Box<Fiber> {
        let stack = match ProtectedFixedSizeStack::new(stacksize) {
            Ok(stack) => stack,
            Err(err) => rts_bug!("fiber stack allocation failed ({:?})", err),
        };
        LIVE_FIBERS.fetch_add(1, Ordering::SeqCst);
        Box::new(Fiber {
            stack: StackMem(stack),
            owner: Cell::new(ptr::null()),
            resume_sf: Cell::new(ptr::null_mut()),
        })
    }

    #[inline]
    pub fn set_owner(&self, w: *const Worker) {
        self.owner.set(w);
    }

    #[inline]
    pub fn owner(&self) -> *const Worker {
        self.owner.get()
    }

    #[inline]
    pub fn set_resume_sf(&self, sf: *mut StackFrame) {
        self.resume_sf.set(sf);
    }

    #[inline]
    pub fn take_resume_sf(&self) -> *mut StackFrame {
        self.resume_sf.take()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A worker's suspended scheduling context, parked while user code runs.
pub struct SchedContext(Context);

// The context is resumed on the same OS thread that parked it; the wrapper
// only exists so it can sit inside the worker descriptor.
unsafe impl Send for SchedContext {}

/// Switch from the scheduling context into `fiber`. Execution enters the
/// dispatch trampoline at the top of the fiber's stack; the call returns
/// when the user side surrenders the thread back to the scheduler. The
/// fiber's own suspended context is discarded at that point; resumption
/// always re-enters at the top.
pub fn switch_into(w: &Worker, fiber: &Fiber) {
    fiber.set_owner(w);
    let ctx = unsafe { Context::new(&fiber.stack.0, dispatch_trampoline) };
    let _abandoned = unsafe { ctx.resume(w as *const Worker as usize) };
}

extern "C" fn dispatch_trampoline(t: Transfer) -> ! {
    let w: &Worker = unsafe { &*(t.data as *const Worker) };
    w.park_sched_context(SchedContext(t.context));
    crate::sched::run_user_code(w)
}

/// Abandon the current fiber and resume this worker's scheduling context.
/// The `switch_into` call that started the fiber returns.
pub fn switch_to_scheduler(w: &Worker) -> ! {
    tls::set_fiber(ptr::null());
    let SchedContext(ctx) = w.take_sched_context();
    unsafe { ctx.resume(0) };
    unreachable!("resumed an abandoned fiber");
}

/// A small per-worker free list of fibers, refilled from the OS. All fibers
/// in one runtime share a stack size, so recycling is a plain push/pop.
pub struct FiberCache {
    free: RefCell<Vec<Box<Fiber>>>,
    capacity: usize,
    stacksize: usize,
}

impl FiberCache {
    pub fn new(capacity: usize, stacksize: usize) -> FiberCache {
        FiberCache {
            free: RefCell::new(Vec::with_capacity(capacity)),
            capacity,
            stacksize,
        }
    }

    pub fn allocate(&self) -> Box<Fiber> {
        match self.free.borrow_mut().pop() {
            Some(fiber) => fiber,
            None => Fiber::allocate(self.stacksize),
        }
    }

    pub fn recycle(&self, fiber: Box<Fiber>) {
        fiber.set_owner(ptr::null());
        fiber.set_resume_sf(ptr::null_mut());
        let mut free = self.free.borrow_mut();
        if free.len() < self.capacity {
            free.push(fiber);
        }
        // else: drop, returning the stack to the OS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test so the process-wide counter is not shared between threads
    #[test]
    fn allocation_counter_balances() {
        let before = live_count();

        let a = Fiber::allocate(1 << 16);
        let b = Fiber::allocate(1 << 16);
        assert_eq!(live_count(), before + 2);
        drop(a);
        drop(b);
        assert_eq!(live_count(), before);

        let cache = FiberCache::new(1, 1 << 16);
        let a = cache.allocate();
        let b = cache.allocate();
        cache.recycle(a);
        cache.recycle(b); // over capacity, freed
        assert_eq!(live_count(), before + 1);
        let c = cache.allocate();
        assert_eq!(live_count(), before + 1);
        drop(cache);
        drop(c);
        assert_eq!(live_count(), before);
    }
}
