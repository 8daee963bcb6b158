//! The worker descriptor: THE channel, shadow stack, and scheduling-local
//! state for one OS thread of the pool.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::closure::Closure;
use crate::fiber::{FiberCache, SchedContext};
use crate::fiber::Fiber;
use crate::frame::StackFrame;
use crate::global::Global;
use crate::options::Options;
use crate::pool::{ClosurePool, GlobalPool};
use crate::rng::XorShift64Star;

/// Per-worker state. The shadow stack and the three THE indices are the
/// shared surface thieves poke at; everything else is local to the owning
/// thread or protected by the deque and closure locks.
pub struct Worker {
    id: usize,
    global: Cell<*const Global>,

    // THE channel. The owner moves `tail`, thieves move `head`, thieves
    // raise `exc` and the owner compares against it on every detached pop.
    head: AtomicUsize,
    tail: AtomicUsize,
    exc: AtomicUsize,

    /// The lazy task queue: exposed spawn parents, as frame pointers. The
    /// frames themselves live in their records; this is just the window
    /// thieves look through.
    shadow: Box<[AtomicPtr<StackFrame>]>,

    /// The youngest spawning frame executing on this worker.
    current_frame: Cell<*mut StackFrame>,

    rng: XorShift64Star,

    // Dispatch plumbing between the scheduling context and the fiber
    // trampoline; only ever touched from this worker's own thread.
    sched_ctx: Cell<Option<SchedContext>>,
    run_closure: Cell<*mut Closure>,
    resumption: Cell<*mut Closure>,
    fiber_to_free: Cell<Option<Box<Fiber>>>,

    fibers: FiberCache,
    closures: ClosurePool,
}

unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    pub fn new(id: usize, options: &Options, global_pool: Arc<GlobalPool>) -> Worker {
        let mut shadow = Vec::with_capacity(options.deqdepth);
        for _ in 0..options.deqdepth {
            shadow.push(AtomicPtr::new(ptr::null_mut()));
        }

        Worker {
            id,
            global: Cell::new(ptr::null()),
            head: AtomicUsize::new(1),
            tail: AtomicUsize::new(1),
            exc: AtomicUsize::new(1),
            shadow: shadow.into_boxed_slice(),
            current_frame: Cell::new(ptr::null_mut()),
            rng: XorShift64Star::new(id),
            sched_ctx: Cell::new(None),
            run_closure: Cell::new(ptr::null_mut()),
            resumption: Cell::new(ptr::null_mut()),
            fiber_to_free: Cell::new(None),
            fibers: FiberCache::new(options.alloc_batch, options.stacksize),
            closures: ClosurePool::new(options.alloc_batch, global_pool),
        }
    }

    pub(crate) fn bind_global(&self, g: *const Global) {
        self.global.set(g);
    }

    /// The global runtime state. Valid for as long as any worker runs.
    #[inline]
    pub(crate) fn global(&self) -> &Global {
        unsafe { &*self.global.get() }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    // -------------------------------------------------------- THE channel

    #[inline]
    pub fn head(&self) -> usize {
        self.head.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn tail(&self) -> usize {
        self.tail.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn exc(&self) -> usize {
        self.exc.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_head(&self, head: usize) {
        self.head.store(head, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_tail(&self, tail: usize) {
        self.tail.store(tail, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_exc(&self, exc: usize) {
        self.exc.store(exc, Ordering::SeqCst);
    }

    /// Capacity of the shadow stack; a push at this index is an overflow.
    #[inline]
    pub fn ltq_limit(&self) -> usize {
        self.shadow.len()
    }

    #[inline]
    pub fn shadow_entry(&self, index: usize) -> *mut StackFrame {
        self.shadow[index].load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_shadow_entry(&self, index: usize, sf: *mut StackFrame) {
        self.shadow[index].store(sf, Ordering::SeqCst);
    }

    // -------------------------------------------------------- local state

    #[inline]
    pub fn current_frame(&self) -> *mut StackFrame {
        self.current_frame.get()
    }

    #[inline]
    pub fn set_current_frame(&self, sf: *mut StackFrame) {
        self.current_frame.set(sf);
    }

    #[inline]
    pub fn pick_victim(&self, nworkers: usize) -> usize {
        self.rng.next_usize(nworkers)
    }

    pub(crate) fn park_sched_context(&self, ctx: SchedContext) {
        debug_assert!(unsafe { (*self.sched_ctx.as_ptr()).is_none() });
        self.sched_ctx.set(Some(ctx));
    }

    pub(crate) fn take_sched_context(&self) -> SchedContext {
        match self.sched_ctx.take() {
            Some(ctx) => ctx,
            None => rts_bug!("worker {}: no scheduling context to resume", self.id),
        }
    }

    pub(crate) fn set_run_closure(&self, cl: *mut Closure) {
        self.run_closure.set(cl);
    }

    pub(crate) fn take_run_closure(&self) -> *mut Closure {
        self.run_closure.take()
    }

    /// Hands the trampoline the next closure to continue on the current
    /// fiber, without a pass through the scheduler.
    pub(crate) fn set_resumption(&self, cl: *mut Closure) {
        debug_assert!(self.resumption.get().is_null());
        self.resumption.set(cl);
    }

    pub(crate) fn take_resumption(&self) -> *mut Closure {
        self.resumption.take()
    }

    /// Parks the fiber we are standing on for deallocation once the worker
    /// is back in its scheduling context.
    pub(crate) fn defer_fiber_free(&self, fiber: Box<Fiber>) {
        debug_assert!(unsafe { (*self.fiber_to_free.as_ptr()).is_none() });
        self.fiber_to_free.set(Some(fiber));
    }

    pub(crate) fn free_deferred_fiber(&self) {
        if let Some(fiber) = self.fiber_to_free.take() {
            self.fibers.recycle(fiber);
        }
    }

    #[inline]
    pub(crate) fn fibers(&self) -> &FiberCache {
        &self.fibers
    }

    #[inline]
    pub(crate) fn closures(&self) -> &ClosurePool {
        &self.closures
    }

    /// A detached worker for unit tests of the lock-and-link structures;
    /// not wired to any global state.
    #[cfg(test)]
    pub fn standalone_for_tests(id: usize) -> Worker {
        Worker::new(id, &Options::default(), GlobalPool::new())
    }
}
