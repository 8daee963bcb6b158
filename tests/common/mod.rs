//! Shared scaffolding for the integration tests: a hand-lowered Fibonacci
//! and a serialized runner around it. The runtime's process-wide counters
//! (steals, live fibers) only make sense when one pool runs at a time, so
//! every test that boots a pool goes through the same lock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tine::api::{self, FrameRecord};
use tine::{Options, StackFrame, Worker};

static RUN_LOCK: Mutex<()> = Mutex::new(());
static ARG: AtomicU64 = AtomicU64::new(0);
static RESULT: AtomicU64 = AtomicU64::new(0);

/// Serializes whole-pool runs within one test binary.
pub fn runtime_lock() -> MutexGuard<'static, ()> {
    RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

// ------------------------------------------------------- lowered fib

#[repr(C)]
struct FibFrame {
    sf: StackFrame,
    n: u64,
    x: u64,
    y: u64,
    out: *mut u64,
}

unsafe impl FrameRecord for FibFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

#[repr(C)]
struct HelperFrame {
    sf: StackFrame,
}

unsafe impl FrameRecord for HelperFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

pub unsafe fn fib(w: &Worker, out: *mut u64, n: u64) {
    if n < 2 {
        *out = n;
        return;
    }

    let f = api::alloc_frame(FibFrame {
        sf: StackFrame::new::<FibFrame>(),
        n,
        x: 0,
        y: 0,
        out,
    });
    let sf = f as *mut StackFrame;
    api::enter_frame(sf);

    api::save_context(sf, fib_cont);
    fib_spawn_helper(w, &mut (*f).x, n - 1);

    fib_cont(w, sf)
}

unsafe fn fib_spawn_helper(w: &Worker, out: *mut u64, n: u64) {
    let h = api::alloc_frame(HelperFrame {
        sf: StackFrame::new::<HelperFrame>(),
    });
    let sf = h as *mut StackFrame;
    api::enter_frame_fast(w, sf);
    api::detach(sf);
    api::save_context(sf, helper_continuation);

    fib(w, out, n);

    helper_continuation(w, sf)
}

unsafe fn helper_continuation(_w: &Worker, sf: *mut StackFrame) {
    api::pop_frame(sf);
    api::leave_frame(sf)
}

unsafe fn fib_cont(w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut FibFrame;
    let n = (*f).n;

    api::save_context(sf, fib_join);
    fib(w, &mut (*f).y, n - 2);

    fib_join(w, sf)
}

unsafe fn fib_join(w: &Worker, sf: *mut StackFrame) {
    if (*sf).is_unsynched() {
        api::save_context(sf, fib_finish);
        api::sync(sf);
    }
    fib_finish(w, sf)
}

unsafe fn fib_finish(_w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut FibFrame;
    *(*f).out = (*f).x + (*f).y;
    api::pop_frame(sf);
    api::leave_frame(sf)
}

// ------------------------------------------------------------ driver

#[repr(C)]
struct EntryFrame {
    sf: StackFrame,
    result: u64,
    out: *mut i32,
}

unsafe impl FrameRecord for EntryFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

unsafe fn fib_entry(w: &Worker, out: *mut i32, _args: &[String]) {
    let f = api::alloc_frame(EntryFrame {
        sf: StackFrame::new::<EntryFrame>(),
        result: 0,
        out,
    });
    let sf = f as *mut StackFrame;
    api::enter_frame(sf);

    api::save_context(sf, fib_entry_finish);
    fib(w, &mut (*f).result, ARG.load(Ordering::SeqCst));

    fib_entry_finish(w, sf)
}

unsafe fn fib_entry_finish(_w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut EntryFrame;
    RESULT.store((*f).result, Ordering::SeqCst);
    *(*f).out = 0;
    api::pop_frame(sf);
    api::leave_frame(sf)
}

pub struct FibRun {
    pub result: u64,
    pub steals: u64,
}

/// Boots a pool with `options`, computes fib(n) on it, and reports the
/// result together with the number of steals the run performed.
pub fn run_fib(options: Options, n: u64) -> FibRun {
    let _ = env_logger::try_init();
    let _guard = runtime_lock();

    ARG.store(n, Ordering::SeqCst);
    let steals_before = tine::steal_count();

    let code = tine::run_with(options, Vec::new(), fib_entry).expect("boot failed");
    assert_eq!(code, 0);

    FibRun {
        result: RESULT.load(Ordering::SeqCst),
        steals: tine::steal_count() - steals_before,
    }
}

pub fn fib_reference(n: u64) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let t = a + b;
        a = b;
        b = t;
    }
    a
}
