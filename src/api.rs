//! The calls lowered user code drives the runtime through.
//!
//! A *spawning function* is one that spawns or syncs; only spawning
//! functions are visible to the runtime, and only spawning functions may
//! (transitively) call other spawning functions. Lowered code follows a
//! fixed shape:
//!
//! - On entry, allocate a frame record ([`alloc_frame`]) holding every
//!   value live across a spawn, a call to another spawning function, or a
//!   sync, and link it in with [`enter_frame`].
//! - A spawn is a call to a *spawn helper*: a little function that
//!   allocates its own frame with [`enter_frame_fast`], publishes the
//!   parent with [`detach`], calls the spawned function, then runs
//!   [`pop_frame`] and [`leave_frame`]. The parent issues [`save_context`]
//!   with its resume entry right before the helper call.
//! - Results travel through out-pointers into the caller's frame record,
//!   written before `pop_frame`.
//! - A sync is `if unsynched { save_context(..); sync(..) }`, with the
//!   code after the sync shared between the inline fall-through and the
//!   saved entry.
//! - On exit, `pop_frame` then `leave_frame`. `leave_frame` consumes the
//!   frame record; nothing may touch it afterwards.
//!
//! Any of the calls marked as surrender points may abandon the native
//! stack (the continuation picks up elsewhere), so lowered functions must
//! not hold owning values in locals across them; everything owning lives
//! in frame records.
//!
//! See `demos/fib.rs` for the whole shape in twenty lines.

use crate::frame::{StackFrame, FRAME_VERSION};
use crate::sched;
use crate::tls;
use crate::worker::Worker;

pub use crate::frame::{ContinuationFn, FrameRecord};

/// Allocates the frame record of one spawning-function activation.
pub fn alloc_frame<T: FrameRecord>(record: T) -> *mut T {
    Box::into_raw(Box::new(record))
}

/// The worker executing the caller. Only meaningful on a pool thread.
#[inline]
pub fn current_worker() -> &'static Worker {
    tls::worker_ref()
}

/// First call of every spawning function: links `sf` into the owner's
/// chain of live frames.
///
/// # Safety
/// `sf` must head a freshly allocated frame record, on a worker thread.
pub unsafe fn enter_frame(sf: *mut StackFrame) {
    let w = tls::worker_ref();
    enter_frame_fast(w, sf);
}

/// `enter_frame` for callers that already hold the worker, spawn helpers
/// above all.
pub unsafe fn enter_frame_fast(w: &Worker, sf: *mut StackFrame) {
    trace!("[{}] enter frame {:p}", w.id(), sf);
    (*sf).set_flags(FRAME_VERSION);
    (*sf).set_call_parent(w.current_frame());
    (*sf).set_worker(w);
    w.set_current_frame(sf);
}

/// Saves the entry point execution resumes at should this frame leave the
/// current stack. Lowered code issues this before every spawn, before
/// every call into another spawning function, and before a slow sync.
#[inline]
pub unsafe fn save_context(sf: *mut StackFrame, pc: ContinuationFn) {
    (*sf).save_pc(pc);
}

/// Publishes the parent of a spawn on the THE channel. Called by the spawn
/// helper, on its own frame, right before invoking the spawned function;
/// from here on a thief may take the parent's continuation.
pub unsafe fn detach(sf: *mut StackFrame) {
    let w = &*((*sf).worker() as *const Worker);
    rts_assert!((*sf).flags() & FRAME_VERSION != 0);
    rts_assert!(w.current_frame() == sf);

    let parent = (*sf).call_parent();
    let tail = w.tail();
    if tail >= w.ltq_limit() {
        rts_bug!(
            "worker {}: shadow stack overflow at depth {} (--deqdepth to raise)",
            w.id(),
            w.ltq_limit()
        );
    }

    // store the parent, then publish it by moving the tail; the fence
    // orders the two so a thief never reads an unwritten slot
    w.set_shadow_entry(tail, parent);
    crate::membar::store_store();
    w.set_tail(tail + 1);

    (*sf).add_flags(crate::frame::FRAME_DETACHED);
}

/// The sync of a promoted frame. Either returns, with all spawned
/// children of this frame retired, or suspends the closure and surrenders
/// the worker; the saved entry runs when the last child comes home.
///
/// Unstolen frames have nothing to wait for and skip this call entirely.
pub unsafe fn sync(sf: *mut StackFrame) {
    let w = tls::worker_ref();
    rts_assert!((*sf).flags() & FRAME_VERSION != 0);
    rts_assert!(w.current_frame() == sf);
    rts_assert!((*sf).worker() == w as *const Worker);

    if !sched::sync_slow(w, sf) {
        sched::longjmp_to_runtime(w);
    }
    // ready: continue inline, on the same worker and fiber
}

/// Unlinks `sf` from the owner's chain of live frames. Last call but one
/// of every spawning function.
pub unsafe fn pop_frame(sf: *mut StackFrame) {
    let w = &*((*sf).worker() as *const Worker);
    rts_assert!((*sf).flags() & FRAME_VERSION != 0);
    w.set_current_frame((*sf).call_parent());
    (*sf).set_call_parent(::std::ptr::null_mut());
}

/// The THE return path; consumes the frame record. For a detached frame
/// this is the pop that races the thieves: if the parent was stolen, the
/// worker surrenders here and the call never returns. For a promoted
/// called frame, the caller's closure is revived on this worker before
/// the frame is freed.
pub unsafe fn leave_frame(sf: *mut StackFrame) {
    let w = tls::worker_ref();
    rts_assert!((*sf).flags() & FRAME_VERSION != 0);
    rts_assert!((*sf).worker() == w as *const Worker);

    if (*sf).is_detached() {
        let tail = w.tail() - 1;
        w.set_tail(tail);
        crate::membar::store_load();
        if w.exc() > tail {
            // may not return, if the exposed parent is gone
            sched::exception_handler(w, sf);
        }
        debug_assert_eq!(w.shadow_entry(tail), w.current_frame());
    } else if (*sf).is_stolen() {
        // a full frame that was called, not spawned: hand the deque its
        // caller back
        sched::set_return(w);
        rts_assert!((*w.current_frame()).flags() & FRAME_VERSION != 0);
    }

    StackFrame::release(sf);
}
