//! Closures: the heavyweight records behind stolen computations, and the
//! tree that links all unfinished parallel work.
//!
//! A frame gets a closure the moment it is first stolen (the root gets one
//! at boot). From then on the closure carries the frame, the fiber the
//! computation runs on, and its position in the tree: the spawned children
//! hang off a doubly linked sibling list, a called child hangs off the
//! callee link. Every field is protected by the closure's own lock; the
//! locking order is parent before child, and a deque lock before any
//! closure lock taken under it.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::fiber::Fiber;
use crate::frame::StackFrame;
use crate::mutex::{Mutex, NOBODY};
use crate::worker::Worker;

#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Status {
    Running = 42,
    Suspended,
    Returning,
    Ready,
}

pub struct Closure {
    mutex: Mutex,

    status: Cell<Status>,
    /// Number of live spawned children.
    join_counter: AtomicU32,
    /// A called (not spawned) child is outstanding.
    has_callee: Cell<bool>,
    callee: Cell<*mut Closure>,

    call_parent: Cell<*mut Closure>,
    spawn_parent: Cell<*mut Closure>,

    frame: Cell<*mut StackFrame>,
    fiber: Cell<Option<Box<Fiber>>>,

    // Spawned-sibling links; right_most_child is where new children enter.
    left_sib: Cell<*mut Closure>,
    right_sib: Cell<*mut Closure>,
    right_most_child: Cell<*mut Closure>,

    // Ready-deque links, managed only by deque.rs under the deque lock.
    // next_ready points toward the bottom, prev_ready toward the top.
    pub(crate) next_ready: Cell<*mut Closure>,
    pub(crate) prev_ready: Cell<*mut Closure>,
    pub(crate) owner_ready_deque: Cell<isize>,
}

unsafe impl Send for Closure {}
unsafe impl Sync for Closure {}

impl Closure {
    pub fn init(&self, status: Status) {
        self.status.set(status);
        self.join_counter.store(0, Ordering::Relaxed);
        self.has_callee.set(false);
        self.callee.set(ptr::null_mut());
        self.call_parent.set(ptr::null_mut());
        self.spawn_parent.set(ptr::null_mut());
        self.frame.set(ptr::null_mut());
        self.fiber.set(None);
        self.left_sib.set(ptr::null_mut());
        self.right_sib.set(ptr::null_mut());
        self.right_most_child.set(ptr::null_mut());
        self.next_ready.set(ptr::null_mut());
        self.prev_ready.set(ptr::null_mut());
        self.owner_ready_deque.set(NOBODY);
    }

    pub fn empty() -> Closure {
        let cl = Closure {
            mutex: Mutex::new(),
            status: Cell::new(Status::Ready),
            join_counter: AtomicU32::new(0),
            has_callee: Cell::new(false),
            callee: Cell::new(ptr::null_mut()),
            call_parent: Cell::new(ptr::null_mut()),
            spawn_parent: Cell::new(ptr::null_mut()),
            frame: Cell::new(ptr::null_mut()),
            fiber: Cell::new(None),
            left_sib: Cell::new(ptr::null_mut()),
            right_sib: Cell::new(ptr::null_mut()),
            right_most_child: Cell::new(ptr::null_mut()),
            next_ready: Cell::new(ptr::null_mut()),
            prev_ready: Cell::new(ptr::null_mut()),
            owner_ready_deque: Cell::new(NOBODY),
        };
        cl.init(Status::Ready);
        cl
    }

    // -------------------------------------------------------- locking

    #[inline]
    pub fn lock(&self, w: &Worker) {
        self.mutex.lock(w.id() as isize);
    }

    #[inline]
    pub fn try_lock(&self, w: &Worker) -> bool {
        self.mutex.try_lock(w.id() as isize)
    }

    #[inline]
    pub fn unlock(&self, w: &Worker) {
        self.mutex.unlock(w.id() as isize);
    }

    #[inline]
    pub fn assert_ownership(&self, w: &Worker) {
        self.mutex.assert_held_by(w.id() as isize);
    }

    #[inline]
    pub fn assert_alienation(&self, w: &Worker) {
        self.mutex.assert_not_held_by(w.id() as isize);
    }

    // -------------------------------------------------------- fields

    #[inline]
    pub fn status(&self) -> Status {
        self.status.get()
    }

    #[inline]
    pub fn set_status(&self, status: Status) {
        self.status.set(status);
    }

    #[inline]
    pub fn join_counter(&self) -> u32 {
        self.join_counter.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn incr_join_counter(&self) {
        self.join_counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decr_join_counter(&self) {
        rts_assert!(self.join_counter() > 0);
        self.join_counter.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn has_callee(&self) -> bool {
        self.has_callee.get()
    }

    /// A closure with either a live spawned child or a live called child is
    /// not done; a sync against it must suspend and a returning child must
    /// not revive it.
    #[inline]
    pub fn has_children(&self) -> bool {
        self.has_callee.get() || self.join_counter() != 0
    }

    #[inline]
    pub fn frame(&self) -> *mut StackFrame {
        self.frame.get()
    }

    #[inline]
    pub fn set_frame(&self, sf: *mut StackFrame) {
        self.frame.set(sf);
    }

    #[inline]
    pub fn call_parent(&self) -> *mut Closure {
        self.call_parent.get()
    }

    #[inline]
    pub fn spawn_parent(&self) -> *mut Closure {
        self.spawn_parent.get()
    }

    #[inline]
    pub fn set_spawn_parent(&self, parent: *mut Closure) {
        self.spawn_parent.set(parent);
    }

    #[inline]
    pub fn right_most_child(&self) -> *mut Closure {
        self.right_most_child.get()
    }

    #[inline]
    pub fn take_fiber(&self) -> Option<Box<Fiber>> {
        self.fiber.take()
    }

    #[inline]
    pub fn give_fiber(&self, fiber: Box<Fiber>) {
        debug_assert!(self.fiber_ptr().is_null());
        self.fiber.set(Some(fiber));
    }

    /// Raw view of the owned fiber, for the dispatch path that must address
    /// the fiber while the closure keeps owning it.
    #[inline]
    pub fn fiber_ptr(&self) -> *const Fiber {
        // No aliasing trouble: the box itself is not moved.
        match unsafe { &*self.fiber.as_ptr() } {
            Some(fiber) => &**fiber as *const Fiber,
            None => ptr::null(),
        }
    }

    #[inline]
    pub fn in_no_deque(&self) -> bool {
        self.owner_ready_deque.get() == NOBODY
    }

    // -------------------------------------------------------- tree ops

    /// Registers a freshly created spawned child, making it the new right
    /// most child. Caller holds the parent's lock; the child is not yet
    /// visible to anyone else, so its own lock is not needed. The old right
    /// most child will not follow its sibling links until it returns, and
    /// returning takes the parent's lock, which we are holding.
    pub fn add_child(&self, w: &Worker, child: &Closure) {
        self.assert_ownership(w);
        child.assert_alienation(w);

        let left = self.right_most_child.get();
        if !left.is_null() {
            let left = unsafe { &*left };
            rts_assert!(left.right_sib.get().is_null());
            left.right_sib.set(child as *const Closure as *mut Closure);
        }
        child.left_sib.set(left);
        child.right_sib.set(ptr::null_mut());
        self.right_most_child
            .set(child as *const Closure as *mut Closure);
    }

    /// Unlinks a returning spawned child. Caller holds both locks.
    pub fn remove_child(&self, w: &Worker, child: &Closure) {
        self.assert_ownership(w);
        child.assert_ownership(w);
        rts_assert!(child.spawn_parent.get() == self as *const Closure as *mut Closure);

        if child as *const Closure as *mut Closure == self.right_most_child.get() {
            rts_assert!(child.right_sib.get().is_null());
            self.right_most_child.set(child.left_sib.get());
        }

        let left = child.left_sib.get();
        let right = child.right_sib.get();
        if !left.is_null() {
            unsafe { (*left).right_sib.set(right) };
        }
        if !right.is_null() {
            unsafe { (*right).left_sib.set(left) };
        }
        child.left_sib.set(ptr::null_mut());
        child.right_sib.set(ptr::null_mut());
    }

    /// Records a promoted called child. The caller's lock is held or the
    /// caller is otherwise quiescent (mid-promotion, reachable by nobody
    /// else).
    pub fn add_callee(&self, callee: &Closure) {
        rts_assert!(self.callee.get().is_null());
        rts_assert!(callee.spawn_parent.get().is_null());
        callee
            .call_parent
            .set(self as *const Closure as *mut Closure);
        self.callee.set(callee as *const Closure as *mut Closure);
        self.has_callee.set(true);
    }

    /// Marks the caller as having an outstanding called child before the
    /// callee chain is fully built, so a returning spawned child cannot
    /// revive it mid-promotion.
    pub fn add_temp_callee(&self, callee: &Closure) {
        rts_assert!(!self.has_callee.get());
        rts_assert!(callee.spawn_parent.get().is_null());
        callee
            .call_parent
            .set(self as *const Closure as *mut Closure);
        self.has_callee.set(true);
    }

    /// Clears the callee link when the called child returns. A called child
    /// is not linked to siblings, so there is nothing to unlink.
    pub fn remove_callee(&self, w: &Worker) {
        self.assert_ownership(w);
        rts_assert!(self.status() == Status::Suspended);
        rts_assert!(self.has_callee.get());
        self.has_callee.set(false);
        self.callee.set(ptr::null_mut());
    }

    /// Sanity checks before the record goes back to the pool.
    pub fn assert_clean(&self) {
        rts_assert!(self.left_sib.get().is_null());
        rts_assert!(self.right_sib.get().is_null());
        rts_assert!(self.right_most_child.get().is_null());
        rts_assert!(self.in_no_deque());
        rts_assert!(unsafe { (*self.fiber.as_ptr()).is_none() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;

    fn test_worker() -> Worker {
        Worker::standalone_for_tests(0)
    }

    #[test]
    fn sibling_links() {
        let w = test_worker();
        let parent = Closure::empty();
        let a = Closure::empty();
        let b = Closure::empty();
        let c = Closure::empty();
        for child in [&a, &b, &c].iter() {
            child.set_spawn_parent(&parent as *const Closure as *mut Closure);
        }

        parent.lock(&w);
        parent.add_child(&w, &a);
        parent.add_child(&w, &b);
        parent.add_child(&w, &c);
        assert_eq!(
            parent.right_most_child(),
            &c as *const Closure as *mut Closure
        );
        assert_eq!(c.left_sib.get(), &b as *const Closure as *mut Closure);
        assert_eq!(a.right_sib.get(), &b as *const Closure as *mut Closure);

        // middle child returns first
        b.lock(&w);
        parent.remove_child(&w, &b);
        b.unlock(&w);
        assert_eq!(c.left_sib.get(), &a as *const Closure as *mut Closure);
        assert_eq!(a.right_sib.get(), &c as *const Closure as *mut Closure);

        c.lock(&w);
        parent.remove_child(&w, &c);
        c.unlock(&w);
        assert_eq!(
            parent.right_most_child(),
            &a as *const Closure as *mut Closure
        );

        a.lock(&w);
        parent.remove_child(&w, &a);
        a.unlock(&w);
        assert!(parent.right_most_child().is_null());
        parent.unlock(&w);
    }

    #[test]
    fn callee_link() {
        let w = test_worker();
        let caller = Closure::empty();
        let callee = Closure::empty();

        caller.add_callee(&callee);
        assert!(caller.has_children());
        assert_eq!(
            callee.call_parent(),
            &caller as *const Closure as *mut Closure
        );

        caller.lock(&w);
        caller.set_status(Status::Suspended);
        caller.remove_callee(&w);
        caller.unlock(&w);
        assert!(!caller.has_children());
    }
}
