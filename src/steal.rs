//! The steal protocol.
//!
//! For stealing we use a Dekker-like handshake that achieves mutual
//! exclusion through shared memory. The thief, holding the victim's deque
//! lock, raises the victim's exception index to announce itself, fences,
//! and re-reads the queue bounds; the victim pops by decrementing tail,
//! fencing, and comparing against the exception index. At most one side
//! proceeds: if the victim already popped the frame the thief wanted, the
//! thief retracts the exception and gives up.
//!
//! A successful handshake promotes the exposed parent frame into a full
//! closure. If that frame is not the one the victim's bottom closure
//! already represents, the whole stacklet between them is promoted too:
//! every called ancestor of the stolen frame becomes a suspended closure in
//! a callee chain, so it can be revived on whichever worker its callee
//! eventually returns on.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::closure::{Closure, Status};
use crate::deque::ReadyDeque;
use crate::exception::{decrement_exception_pointer, increment_exception_pointer};
use crate::frame::{StackFrame, FRAME_STOLEN, FRAME_SUSPENDED, FRAME_UNSYNCHED};
use crate::worker::Worker;

static STEALS: AtomicU64 = AtomicU64::new(0);

pub fn steal_count() -> u64 {
    STEALS.load(Ordering::Relaxed)
}

/// Thief side of the Dekker handshake. Returns false when the victim wins:
/// there is at most one frame left and the victim is taking it back.
fn do_dekker_on(w: &Worker, victim: &Worker, cl: &Closure) -> bool {
    cl.assert_ownership(w);

    increment_exception_pointer(w, victim, cl);

    if victim.head() >= victim.tail() {
        decrement_exception_pointer(w, victim, cl);
        return false;
    }
    true
}

/// Sets `cl` aside while its stacklet is being promoted out from under it.
/// Caller owns `cl` and the victim's deque.
fn suspend_victim_closure(w: &Worker, deque: &ReadyDeque, cl: &Closure) {
    cl.assert_ownership(w);
    deque.assert_ownership(w);
    rts_assert!(cl.status() == Status::Running);

    cl.set_status(Status::Suspended);
    let bottom = deque.xtract_bottom(w);
    rts_assert!(bottom == cl as *const Closure as *mut Closure);
}

/// The oldest frame in the stacklet reachable from `head` that has never
/// been promoted: the walk stops at a detached frame (the stacklet entered
/// through a spawn) or at a frame whose caller is already a closure.
fn oldest_non_stolen_frame_in_stacklet(head: *mut StackFrame) -> *mut StackFrame {
    let mut cur = head;
    unsafe {
        while !cur.is_null() && !(*cur).is_detached() {
            let parent = (*cur).call_parent();
            if parent.is_null() || (*parent).is_stolen() {
                break;
            }
            cur = parent;
        }
    }
    cur
}

/// Builds suspended closures for the called frames strictly between
/// `oldest` (already represented by `oldest_cl`) and the stolen frame,
/// linking each as its caller's callee. Returns the closure of the stolen
/// frame's direct caller.
unsafe fn setup_call_parent_closure_helper(
    w: &Worker,
    victim: &Worker,
    frame: *mut StackFrame,
    oldest_cl: *mut Closure,
) -> *mut Closure {
    if (*oldest_cl).frame() == frame {
        rts_assert!((*frame).is_stolen());
        return oldest_cl;
    }

    let call_parent = setup_call_parent_closure_helper(w, victim, (*frame).call_parent(), oldest_cl);

    rts_assert!((*frame).worker() == victim as *const Worker);
    (*frame).add_flags(FRAME_STOLEN);
    let curr = w.closures().allocate(Status::Suspended);
    (*curr).set_frame(frame);
    (*frame).set_worker(ptr::null());
    // Past promotion, parentage lives in the closure tree; severing the
    // frame chain here keeps it from pointing at records that may die
    // before this one does.
    (*frame).set_call_parent(ptr::null_mut());

    (*call_parent).add_callee(&*curr);
    curr
}

/// Promotes every non-promoted frame in the stolen stacklet, youngest
/// (`youngest_cl`, the stolen frame's closure) excluded from the recursion
/// but re-parented onto its direct caller's closure at the end.
unsafe fn setup_closures_in_stacklet(w: &Worker, victim: &Worker, youngest_cl: &Closure) {
    let youngest = youngest_cl.frame();
    let oldest = oldest_non_stolen_frame_in_stacklet(youngest);
    let oldest_cl = youngest_cl.call_parent();

    rts_assert!(!(*youngest).is_stolen());
    rts_assert!((*youngest).worker() == victim as *const Worker);

    if (*oldest_cl).frame().is_null() {
        // the stacklet entered through a spawn helper; the helper frame
        // becomes the face of the spawn-child closure
        rts_assert!(oldest != youngest);
        rts_assert!(!(*oldest).is_stolen());
        rts_assert!((*oldest).is_detached());
        (*oldest).add_flags(FRAME_STOLEN);
        (*oldest_cl).set_frame(oldest);
    } else {
        rts_assert!((*oldest_cl).frame() == (*oldest).call_parent());
        rts_assert!((*(*oldest_cl).frame()).is_stolen());
    }
    (*(*oldest_cl).frame()).set_worker(ptr::null());

    let call_parent =
        setup_call_parent_closure_helper(w, victim, (*youngest).call_parent(), oldest_cl);

    (*youngest).add_flags(FRAME_STOLEN);
    (*youngest).set_call_parent(ptr::null_mut());
    (*call_parent).add_callee(youngest_cl);
}

/// Promote the child frame of the victim's running closure to a full
/// closure and expose the stolen parent. On entry the thief owns `cl` and
/// the victim's deque. On return the new spawn child sits at the victim's
/// deque bottom, still running on the victim's fiber, and the spawn parent
/// is locked: either `cl` itself (left in the deque for the caller to
/// extract, `*res` null) or a freshly built closure (`*res`).
unsafe fn promote_child(
    w: &Worker,
    victim: &Worker,
    deque: &ReadyDeque,
    cl: *mut Closure,
    res: &mut *mut Closure,
) -> *mut Closure {
    let cl_ref = &*cl;
    cl_ref.assert_ownership(w);
    deque.assert_ownership(w);
    rts_assert!(cl_ref.status() == Status::Running);
    rts_assert!(cl_ref.next_ready.get().is_null());

    let head = victim.head();
    rts_assert!(head <= victim.exc());
    // It can be that head == tail here: the victim may have popped after
    // the thief won the handshake. The victim cannot get past its own
    // exception check until we release the deque lock, and will then find
    // this frame gone.
    rts_assert!(head <= victim.tail());

    let frame_to_steal = victim.shadow_entry(head);
    rts_assert!(!frame_to_steal.is_null());

    // The victim keeps running the spawned child on its current fiber;
    // whoever ends up as spawn parent hands the fiber over to the new
    // child closure.
    let victim_fiber = cl_ref.take_fiber();

    let spawn_parent: *mut Closure;
    if cl_ref.frame() == frame_to_steal {
        // cl is the exposed frame itself: the root closure, or a closure
        // stolen before that has spawned again.
        spawn_parent = cl;
    } else {
        // The exposed frame is deeper in cl's stacklet. Build a closure
        // for it, mark cl as having an outstanding called descendant so no
        // returning child revives it, and set cl aside. The rest of the
        // stacklet is promoted in finish_promote.
        let fresh = w.closures().allocate(Status::Running);
        (*fresh).set_frame(frame_to_steal);
        cl_ref.add_temp_callee(&*fresh);

        suspend_victim_closure(w, deque, cl_ref);
        cl_ref.unlock(w);

        (*fresh).lock(w);
        spawn_parent = fresh;
        *res = fresh;
    }

    rts_assert!(!(*spawn_parent).has_callee());
    let spawn_child = w.closures().allocate(Status::Running);
    (*spawn_child).set_spawn_parent(spawn_parent);
    // Register the child; its sibling links must be in place before the
    // pointer escapes into the deque.
    (*spawn_parent).add_child(w, &*spawn_child);

    if let Some(fiber) = victim_fiber {
        (*spawn_child).give_fiber(fiber);
    }

    victim.set_head(head + 1);
    // the child's own frame is set lazily, if its stacklet is ever stolen
    deque.add_bottom(w, &*spawn_child);

    spawn_child
}

/// Finishes the promotion: accounts the new child in the parent's join
/// counter, promotes the rest of the stacklet if the parent frame is fresh,
/// and makes the parent ready to run. The victim's deque is unlocked by
/// now; only the parent is still ours.
unsafe fn finish_promote(w: &Worker, victim: &Worker, parent: *mut Closure) {
    let parent = &*parent;
    parent.assert_ownership(w);
    rts_assert!(!parent.has_callee());

    parent.incr_join_counter();

    if !(*parent.frame()).is_stolen() {
        setup_closures_in_stacklet(w, victim, parent);
    }
    rts_assert!((*parent.frame()).is_stolen());

    (*parent.frame()).add_flags(FRAME_UNSYNCHED);
    parent.set_status(Status::Ready);
}

/// Tries to steal from `victim_idx`. Returns the promoted parent closure,
/// ready to run its continuation on this worker, or null. Every failure is
/// silent; the thief just picks another victim.
pub fn closure_steal(w: &Worker, victim_idx: usize) -> *mut Closure {
    let g = w.global();
    let deque = g.deque(victim_idx);

    if !deque.try_lock(w) {
        return ptr::null_mut();
    }

    let cl = deque.peek_top(w);
    if cl.is_null() {
        deque.unlock(w);
        return ptr::null_mut();
    }

    let cl_ref = unsafe { &*cl };
    if !cl_ref.try_lock(w) {
        deque.unlock(w);
        return ptr::null_mut();
    }

    let victim = g.worker(victim_idx);
    match cl_ref.status() {
        Status::Ready => rts_bug!("ready closure in ready deque"),
        Status::Suspended => rts_bug!("suspended closure in ready deque"),
        Status::Returning => {
            // let it leave alone; unlock the closure before the deque
            cl_ref.unlock(w);
            deque.unlock(w);
            ptr::null_mut()
        }
        Status::Running => {
            if !do_dekker_on(w, victim, cl_ref) {
                cl_ref.unlock(w);
                deque.unlock(w);
                return ptr::null_mut();
            }

            let mut res: *mut Closure = ptr::null_mut();
            unsafe {
                let child = promote_child(w, victim, deque, cl, &mut res);

                // detach the parent; in the reuse case it is still sitting
                // on top of the victim's deque
                if res.is_null() {
                    res = deque.xtract_top(w);
                    rts_assert!(res == cl);
                }
                deque.unlock(w);

                // more steals can happen from the victim at this point
                finish_promote(w, victim, res);
                rts_assert!((*res).right_most_child() == child);

                // a fresh fiber for the continuation; the victim kept its
                // own for the running child
                (*res).give_fiber(w.fibers().allocate());
                (*res).unlock(w);
            }

            STEALS.fetch_add(1, Ordering::Relaxed);
            let frame = unsafe { (*res).frame() };
            trace!("[{}] stole frame {:p} from worker {}", w.id(), frame, victim_idx);
            res
        }
    }
}

/// The provably good steal: called under the parent's lock when a child
/// has just returned. If that was the last obstacle to the parent's sync,
/// revive the parent right here, on the worker the child returned on.
pub unsafe fn provably_good_steal_maybe(w: &Worker, parent: *mut Closure) -> *mut Closure {
    let parent = &*parent;
    parent.assert_ownership(w);

    if !parent.has_children() && parent.status() == Status::Suspended {
        let frame = parent.frame();
        rts_assert!(!frame.is_null());
        rts_assert!((*frame).worker().is_null());
        rts_assert!(parent.in_no_deque());

        trace!("[{}] provably good steal of {:p}", w.id(), parent);

        (*frame).set_worker(w);
        (*frame).clear_flags(FRAME_UNSYNCHED | FRAME_SUSPENDED);
        parent.set_status(Status::Ready);
        return parent as *const Closure as *mut Closure;
    }
    ptr::null_mut()
}
