//! Per-worker ready deques of closures.
//!
//! The owner pushes and pops at the bottom; thieves peek and extract at the
//! top. Either end requires the deque lock. The deque is an intrusive
//! doubly linked list through the closures' ready links, so membership is
//! cheap to assert and a closure can be in at most one deque at a time.

use std::cell::Cell;
use std::ptr;

use crate::closure::Closure;
use crate::mutex::{Mutex, NOBODY};
use crate::worker::Worker;

pub struct ReadyDeque {
    mutex: Mutex,
    index: usize,
    top: Cell<*mut Closure>,
    bottom: Cell<*mut Closure>,
}

unsafe impl Send for ReadyDeque {}
unsafe impl Sync for ReadyDeque {}

impl ReadyDeque {
    pub fn new(index: usize) -> ReadyDeque {
        ReadyDeque {
            mutex: Mutex::new(),
            index,
            top: Cell::new(ptr::null_mut()),
            bottom: Cell::new(ptr::null_mut()),
        }
    }

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

    /// Appends `cl` at the bottom. Caller holds the deque lock.
    pub fn add_bottom(&self, w: &Worker, cl: &Closure) {
        self.assert_ownership(w);
        rts_assert!(cl.in_no_deque());

        let cl_ptr = cl as *const Closure as *mut Closure;
        let old_bottom = self.bottom.get();
        cl.prev_ready.set(old_bottom);
        cl.next_ready.set(ptr::null_mut());
        self.bottom.set(cl_ptr);
        cl.owner_ready_deque.set(self.index as isize);

        if self.top.get().is_null() {
            self.top.set(cl_ptr);
        } else {
            rts_assert!(!old_bottom.is_null());
            unsafe { (*old_bottom).next_ready.set(cl_ptr) };
        }
    }

    /// Removes and returns the bottom closure, or null when empty. Caller
    /// holds the deque lock.
    pub fn xtract_bottom(&self, w: &Worker) -> *mut Closure {
        self.assert_ownership(w);

        let cl = self.bottom.get();
        if cl.is_null() {
            rts_assert!(self.top.get().is_null());
            return cl;
        }

        let cl_ref = unsafe { &*cl };
        rts_assert!(cl_ref.owner_ready_deque.get() == self.index as isize);
        self.bottom.set(cl_ref.prev_ready.get());
        if cl == self.top.get() {
            rts_assert!(cl_ref.prev_ready.get().is_null());
            self.top.set(ptr::null_mut());
        } else {
            let prev = cl_ref.prev_ready.get();
            rts_assert!(!prev.is_null());
            unsafe { (*prev).next_ready.set(ptr::null_mut()) };
        }
        cl_ref.prev_ready.set(ptr::null_mut());
        cl_ref.next_ready.set(ptr::null_mut());
        cl_ref.owner_ready_deque.set(NOBODY);
        cl
    }

    /// Removes and returns the top closure, or null when empty. Caller
    /// holds the deque lock.
    pub fn xtract_top(&self, w: &Worker) -> *mut Closure {
        self.assert_ownership(w);

        let cl = self.top.get();
        if cl.is_null() {
            rts_assert!(self.bottom.get().is_null());
            return cl;
        }

        let cl_ref = unsafe { &*cl };
        self.top.set(cl_ref.next_ready.get());
        if cl == self.bottom.get() {
            rts_assert!(cl_ref.next_ready.get().is_null());
            self.bottom.set(ptr::null_mut());
        } else {
            let next = cl_ref.next_ready.get();
            rts_assert!(!next.is_null());
            unsafe { (*next).prev_ready.set(ptr::null_mut()) };
        }
        cl_ref.prev_ready.set(ptr::null_mut());
        cl_ref.next_ready.set(ptr::null_mut());
        cl_ref.owner_ready_deque.set(NOBODY);
        cl
    }

    pub fn peek_top(&self, w: &Worker) -> *mut Closure {
        self.assert_ownership(w);
        let cl = self.top.get();
        if cl.is_null() {
            rts_assert!(self.bottom.get().is_null());
        } else {
            rts_assert!(unsafe { (*cl).owner_ready_deque.get() } == self.index as isize);
        }
        cl
    }

    pub fn peek_bottom(&self, w: &Worker) -> *mut Closure {
        self.assert_ownership(w);
        let cl = self.bottom.get();
        if cl.is_null() {
            rts_assert!(self.top.get().is_null());
        } else {
            rts_assert!(unsafe { (*cl).owner_ready_deque.get() } == self.index as isize);
        }
        cl
    }
}
