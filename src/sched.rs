//! The worker scheduling loop and the protocols that move a computation
//! between user code and the runtime: sync, the THE exception path, the
//! return of spawned and called children.
//!
//! Lock discipline, crate-wide: a deque lock is taken before any closure
//! lock acquired under it; a parent closure before its child; locks are
//! released child before parent; no two deque locks are ever held at once;
//! and no lock is held across a fiber switch.

use std::ptr;

use crate::closure::{Closure, Status};
use crate::exception::{reset_exception_pointer, EXCEPTION_INFINITY};
use crate::fiber;
use crate::frame::{StackFrame, FRAME_SUSPENDED};
use crate::membar;
use crate::steal;
use crate::tls;
use crate::worker::Worker;

/// Abandon the current fiber and fall back into the scheduling loop. The
/// fiber's native frames are never revisited; anything that must survive
/// is already in frame records or closures.
pub(crate) fn longjmp_to_runtime(w: &Worker) -> ! {
    let current = tls::fiber();
    if !current.is_null() {
        rts_assert!(unsafe { (*current).owner() } == w as *const Worker);
        // prevent a stale frame from being resumed by the next user of
        // this stack
        unsafe { (*current).set_resume_sf(ptr::null_mut()) };
    }
    fiber::switch_to_scheduler(w)
}

/// Body of the dispatch trampoline, entered at the top of a fiber's stack.
/// Runs the scheduled closure's saved continuation; when a continuation
/// finishes by reviving its call parent (`set_return`), keeps going with
/// the parent on the same fiber. Every other ending is a switch back to
/// the scheduler from inside the continuation.
pub(crate) fn run_user_code(w: &Worker) -> ! {
    let mut cl = w.take_run_closure();
    rts_assert!(!cl.is_null());

    loop {
        let cl_ref = unsafe { &*cl };
        let fib = cl_ref.fiber_ptr();
        rts_assert!(!fib.is_null());
        tls::set_fiber(fib);

        let sf = unsafe { (*fib).take_resume_sf() };
        rts_assert!(sf == cl_ref.frame());
        rts_assert!(unsafe { (*sf).worker() } == w as *const Worker);

        let pc = unsafe { (*sf).take_pc() };
        unsafe { pc(w, sf) };

        // The continuation came back instead of surrendering: its frame
        // left through set_return and handed us the revived call parent.
        cl = w.take_resumption();
        rts_assert!(
            !cl.is_null(),
            "continuation finished without surrendering or reviving a parent"
        );
    }
}

/// Re-arms a closure for execution on this worker and resets the THE
/// channel for a fresh stacklet.
fn setup_for_execution(w: &Worker, t: &Closure) {
    t.assert_ownership(w);
    t.set_status(Status::Running);

    let frame = t.frame();
    rts_assert!(!frame.is_null());
    unsafe { (*frame).set_worker(w) };

    w.set_head(1);
    w.set_tail(1);
    w.set_current_frame(frame);
    reset_exception_pointer(w, t);
}

/// Dispatches one closure. Returns the next closure to run, if the return
/// protocol produced one.
fn do_what_it_says(w: &Worker, t: *mut Closure) -> *mut Closure {
    let t_ref = unsafe { &*t };
    t_ref.lock(w);

    match t_ref.status() {
        Status::Ready => {
            trace!("[{}] dispatch {:p}", w.id(), t);
            setup_for_execution(w, t_ref);
            t_ref.unlock(w);

            // the closure must be unlocked before the deque is locked
            let deque = w.global().deque(w.id());
            deque.lock(w);
            deque.add_bottom(w, t_ref);
            deque.unlock(w);

            let fib = t_ref.fiber_ptr();
            rts_assert!(!fib.is_null());
            unsafe { (*fib).set_resume_sf(t_ref.frame()) };
            w.set_run_closure(t);

            fiber::switch_into(w, unsafe { &*fib });

            // back from user code; a fiber abandoned at a suspending sync
            // can be reclaimed now that nothing runs on it
            w.free_deferred_fiber();
            ptr::null_mut()
        }
        Status::Returning => {
            // the return protocol assumes t is unlocked; everybody else
            // respects a returning closure
            t_ref.unlock(w);
            closure_return(w, t)
        }
        status => rts_bug!("dispatch of closure {:p} in state {:?}", t, status),
    }
}

/// The per-worker scheduling loop: run local work from the bottom of the
/// own deque, otherwise steal from a uniformly random victim, until the
/// root computation is done.
pub(crate) fn worker_scheduler(w: &Worker, mut t: *mut Closure) {
    rts_assert!(tls::worker() == w as *const Worker);
    let g = w.global();
    debug!("[{}] scheduler running", w.id());

    while !g.is_done() {
        if t.is_null() {
            let deque = g.deque(w.id());
            deque.lock(w);
            t = deque.xtract_bottom(w);
            deque.unlock(w);
        }

        while t.is_null() && !g.is_done() {
            let victim = w.pick_victim(g.nworkers());
            if victim != w.id() {
                t = steal::closure_steal(w, victim);
            }
        }

        if !g.is_done() {
            t = do_what_it_says(w, t);
        }
    }

    w.free_deferred_fiber();
    debug!("[{}] scheduler exiting", w.id());
}

// ---------------------------------------------------------------- sync

/// Slow path of a sync, for a frame that has been promoted. Returns true
/// when the sync is ready and execution may continue inline; false when
/// the closure was suspended and the caller must surrender the worker.
pub(crate) fn sync_slow(w: &Worker, sf: *mut StackFrame) -> bool {
    let deque = w.global().deque(w.id());
    deque.lock(w);
    let t = deque.peek_bottom(w);
    rts_assert!(!t.is_null());
    let t = unsafe { &*t };
    t.lock(w);

    // we are really at the top of the stack: nothing of ours is exposed
    rts_assert!(w.head() == w.tail());
    rts_assert!(t.status() == Status::Running);
    rts_assert!(t.frame() == sf);
    rts_assert!(unsafe { (*sf).worker() } == w as *const Worker);
    rts_assert!(unsafe { (*sf).is_stolen() });
    rts_assert!(!t.has_callee());

    // A fiber parked at an earlier suspension may still be waiting; it is
    // never the one we are standing on.
    w.free_deferred_fiber();

    let ready = if t.has_children() {
        trace!("[{}] sync of {:p}: outstanding children", w.id(), sf);
        // The continuation will be revived on whatever worker the last
        // child returns on; this stack is done. The fiber is reclaimed
        // once we are back in the scheduling context.
        let own = t.take_fiber();
        rts_assert!(own.is_some());
        w.defer_fiber_free(own.unwrap());

        t.set_status(Status::Suspended);
        unsafe {
            (*sf).add_flags(FRAME_SUSPENDED);
            (*sf).set_worker(ptr::null());
        }
        let bottom = deque.xtract_bottom(w);
        rts_assert!(bottom == t as *const Closure as *mut Closure);
        false
    } else {
        trace!("[{}] sync of {:p}: ready", w.id(), sf);
        setup_for_sync(w, t);
        true
    };

    t.unlock(w);
    deque.unlock(w);
    ready
}

/// A sync that found no outstanding children: clear the unsynched state
/// and let the frame continue inline.
fn setup_for_sync(w: &Worker, t: &Closure) {
    t.assert_ownership(w);
    let sf = t.frame();
    unsafe { (*sf).clear_flags(crate::frame::FRAME_UNSYNCHED) };
}

// ------------------------------------------------------------ returns

/// THE slow return path. The worker popped a detached frame and found the
/// exception index above its tail: either a thief took the parent, or the
/// shutdown broadcast is up. On a real steal this never returns; on a
/// lost race (the thief backed out after raising the exception) it returns
/// and the pop continues on the fast path.
pub(crate) fn exception_handler(w: &Worker, sf: *mut StackFrame) {
    let g = w.global();

    if w.exc() == EXCEPTION_INFINITY && g.is_done() {
        // shutdown broadcast; the result of this computation no longer
        // matters
        longjmp_to_runtime(w);
    }

    let deque = g.deque(w.id());
    deque.lock(w);
    let t = deque.peek_bottom(w);
    rts_assert!(!t.is_null());
    let t = unsafe { &*t };
    t.lock(w);

    if w.exc() > w.tail() {
        trace!("[{}] parent of {:p} was stolen; returning", w.id(), sf);
        rts_assert!(t.status() == Status::Running);

        // t is the spawn-child closure the thief promoted for this
        // computation. Its frame, when set, is the very frame being left.
        if t.frame() == sf {
            t.set_frame(ptr::null_mut());
        } else {
            rts_assert!(t.frame().is_null());
        }
        t.set_status(Status::Returning);

        t.unlock(w);
        deque.unlock(w);

        // the frame dies with this stack; nobody will pop it again
        unsafe { StackFrame::release(sf) };
        longjmp_to_runtime(w)
    } else {
        // false alarm: the thief lost the handshake and retracted
        t.unlock(w);
        deque.unlock(w);
    }
}

/// An "unconditional steal" of the call parent: the revived caller takes
/// over this worker and this fiber.
fn setup_call_parent_resumption(w: &Worker, t: &Closure) {
    let deque = w.global().deque(w.id());
    deque.assert_ownership(w);
    t.assert_ownership(w);

    let frame = t.frame();
    rts_assert!(!frame.is_null());
    rts_assert!(unsafe { (*frame).is_stolen() });
    rts_assert!(unsafe { (*frame).worker() }.is_null());
    rts_assert!(t.status() == Status::Suspended);
    rts_assert!(w.head() == w.tail());

    t.set_status(Status::Running);
    unsafe {
        (*frame).clear_flags(FRAME_SUSPENDED);
        (*frame).set_worker(w);
    }
    w.set_current_frame(frame);
    reset_exception_pointer(w, t);
}

/// Return protocol for a promoted *called* frame: the closure at the
/// deque bottom is finished, its caller must continue. The caller inherits
/// this fiber and is dispatched on it as soon as the current continuation
/// unwinds into the trampoline.
pub(crate) fn set_return(w: &Worker) {
    let deque = w.global().deque(w.id());
    deque.lock(w);
    let t = deque.peek_bottom(w);
    rts_assert!(!t.is_null());
    let t_ref = unsafe { &*t };
    t_ref.lock(w);

    rts_assert!(t_ref.status() == Status::Running);
    rts_assert!(!t_ref.has_children());
    rts_assert!(t_ref.spawn_parent().is_null());

    let parent = t_ref.call_parent();
    rts_assert!(
        !parent.is_null(),
        "the root computation tried to return to a caller"
    );

    let bottom = deque.xtract_bottom(w);
    rts_assert!(bottom == t);

    t_ref.set_frame(ptr::null_mut());
    // we are standing on this fiber; it transfers to the caller
    let fib = t_ref.take_fiber();
    rts_assert!(fib.is_some());
    t_ref.unlock(w);

    let parent = unsafe { &*parent };
    parent.lock(w);
    parent.give_fiber(fib.unwrap());
    parent.remove_callee(w);
    setup_call_parent_resumption(w, parent);
    unsafe { (*parent.fiber_ptr()).set_resume_sf(parent.frame()) };
    parent.unlock(w);

    w.closures().free(t);
    deque.add_bottom(w, parent);
    // the trampoline picks the caller up right after the current frame
    // finishes leaving
    w.set_resumption(parent as *const Closure as *mut Closure);
    deque.unlock(w);

    trace!("[{}] called child done, caller {:p} revived", w.id(), parent);
}

/// Return protocol for a spawned child: unlink it from the tree, fold its
/// join into the parent, and maybe revive the parent right here. Returns
/// the next closure to execute, or null.
fn closure_return(w: &Worker, child: *mut Closure) -> *mut Closure {
    let child_ref = unsafe { &*child };

    rts_assert!(child_ref.join_counter() == 0);
    rts_assert!(child_ref.status() == Status::Returning);
    rts_assert!(child_ref.in_no_deque());
    child_ref.assert_alienation(w);
    rts_assert!(!child_ref.has_callee());
    rts_assert!(child_ref.call_parent().is_null());
    let parent = child_ref.spawn_parent();
    rts_assert!(!parent.is_null());
    let parent = unsafe { &*parent };

    trace!("[{}] spawned child {:p} returning", w.id(), child);

    parent.lock(w);
    rts_assert!(parent.status() != Status::Returning);
    rts_assert!(!parent.frame().is_null());

    child_ref.lock(w);
    parent.remove_child(w, child_ref);
    let child_fiber = child_ref.take_fiber();
    child_ref.unlock(w);
    w.closures().free(child);

    // the fences around the decrement publish everything the child wrote
    // before its parent can observe the join
    membar::store_store();
    parent.decr_join_counter();
    membar::store_store();

    let res = unsafe { steal::provably_good_steal_maybe(w, parent as *const _ as *mut Closure) };
    if !res.is_null() {
        // the parent resumes on this worker; it inherits the child's fiber
        rts_assert!(child_fiber.is_some());
        parent.give_fiber(child_fiber.unwrap());
    } else if let Some(fib) = child_fiber {
        w.fibers().recycle(fib);
    }
    parent.unlock(w);

    res
}
