//! Steal-dependent behavior: a continuation that must migrate to another
//! worker for the program to terminate, and the provably-good steal
//! bringing a suspended parent back on the worker that retired its last
//! child.

extern crate tine;

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tine::api::{self, FrameRecord};
use tine::{Options, StackFrame, Worker};

#[repr(C)]
struct HelperFrame {
    sf: StackFrame,
}

unsafe impl FrameRecord for HelperFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

unsafe fn spawn_leaf(w: &Worker, leaf: fn(&Worker)) {
    let h = api::alloc_frame(HelperFrame {
        sf: StackFrame::new::<HelperFrame>(),
    });
    let sf = h as *mut StackFrame;
    api::enter_frame_fast(w, sf);
    api::detach(sf);
    api::save_context(sf, helper_continuation);

    leaf(w);

    helper_continuation(w, sf)
}

unsafe fn helper_continuation(_w: &Worker, sf: *mut StackFrame) {
    api::pop_frame(sf);
    api::leave_frame(sf)
}

// ---------------------------------------------- scenario: steal-and-resume

static HANDOFF: AtomicBool = AtomicBool::new(false);

fn wait_leaf(_w: &Worker) {
    // only the stolen continuation ever raises the flag
    while !HANDOFF.load(Ordering::Acquire) {
        thread::yield_now();
    }
}

#[repr(C)]
struct HandoffFrame {
    sf: StackFrame,
    out: *mut i32,
}

unsafe impl FrameRecord for HandoffFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

unsafe fn handoff_entry(w: &Worker, out: *mut i32, _args: &[String]) {
    let f = api::alloc_frame(HandoffFrame {
        sf: StackFrame::new::<HandoffFrame>(),
        out,
    });
    let sf = f as *mut StackFrame;
    api::enter_frame(sf);

    api::save_context(sf, handoff_cont);
    spawn_leaf(w, wait_leaf);

    handoff_cont(w, sf)
}

unsafe fn handoff_cont(w: &Worker, sf: *mut StackFrame) {
    HANDOFF.store(true, Ordering::Release);

    if (*sf).is_unsynched() {
        api::save_context(sf, handoff_finish);
        api::sync(sf);
    }
    handoff_finish(w, sf)
}

unsafe fn handoff_finish(_w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut HandoffFrame;
    *(*f).out = 0;
    api::pop_frame(sf);
    api::leave_frame(sf)
}

#[test]
fn continuation_steal_unblocks_the_child() {
    let _guard = common::runtime_lock();
    HANDOFF.store(false, Ordering::SeqCst);

    let steals_before = tine::steal_count();
    let options = Options {
        nproc: 2,
        ..Options::default()
    };
    let code = tine::run_with(options, Vec::new(), handoff_entry).unwrap();

    assert_eq!(code, 0);
    assert!(
        tine::steal_count() > steals_before,
        "the program cannot have terminated without a steal"
    );
}

// ------------------------------------------- scenario: provably-good steal

static B_DONE: AtomicBool = AtomicBool::new(false);
static A_FINISHED_ON: AtomicUsize = AtomicUsize::new(usize::MAX);
static PARENT_RESUMED_ON: AtomicUsize = AtomicUsize::new(usize::MAX);

fn slow_leaf(w: &Worker) {
    while !B_DONE.load(Ordering::Acquire) {
        thread::yield_now();
    }
    // outlive the parent's sync decision by a wide margin
    thread::sleep(Duration::from_millis(200));
    A_FINISHED_ON.store(w.id(), Ordering::SeqCst);
}

fn fast_leaf(_w: &Worker) {
    B_DONE.store(true, Ordering::Release);
}

#[repr(C)]
struct JoinFrame {
    sf: StackFrame,
    out: *mut i32,
}

unsafe impl FrameRecord for JoinFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

unsafe fn join_entry(w: &Worker, out: *mut i32, _args: &[String]) {
    let f = api::alloc_frame(JoinFrame {
        sf: StackFrame::new::<JoinFrame>(),
        out,
    });
    let sf = f as *mut StackFrame;
    api::enter_frame(sf);

    api::save_context(sf, join_cont_spawn_b);
    spawn_leaf(w, slow_leaf);

    join_cont_spawn_b(w, sf)
}

unsafe fn join_cont_spawn_b(w: &Worker, sf: *mut StackFrame) {
    api::save_context(sf, join_cont_sync);
    spawn_leaf(w, fast_leaf);

    join_cont_sync(w, sf)
}

unsafe fn join_cont_sync(w: &Worker, sf: *mut StackFrame) {
    if (*sf).is_unsynched() {
        api::save_context(sf, join_finish);
        api::sync(sf);
    }
    join_finish(w, sf)
}

unsafe fn join_finish(w: &Worker, sf: *mut StackFrame) {
    PARENT_RESUMED_ON.store(w.id(), Ordering::SeqCst);
    let f = sf as *mut JoinFrame;
    *(*f).out = 0;
    api::pop_frame(sf);
    api::leave_frame(sf)
}

#[test]
fn last_child_revives_the_parent_locally() {
    let _guard = common::runtime_lock();
    B_DONE.store(false, Ordering::SeqCst);
    A_FINISHED_ON.store(usize::MAX, Ordering::SeqCst);
    PARENT_RESUMED_ON.store(usize::MAX, Ordering::SeqCst);

    let steals_before = tine::steal_count();
    let options = Options {
        nproc: 2,
        ..Options::default()
    };
    let code = tine::run_with(options, Vec::new(), join_entry).unwrap();

    assert_eq!(code, 0);
    assert!(tine::steal_count() > steals_before);

    let a_on = A_FINISHED_ON.load(Ordering::SeqCst);
    let resumed_on = PARENT_RESUMED_ON.load(Ordering::SeqCst);
    assert!(a_on != usize::MAX);
    assert_eq!(
        resumed_on, a_on,
        "the suspended parent must resume on the worker that ran its last child"
    );
}
