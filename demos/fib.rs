//! Naive parallel Fibonacci, in hand-lowered form: spawn the left branch,
//! call the right branch, sync, add.
//!
//! fib 39: 63245986
//! fib 40: 102334155
//! fib 41: 165580141
//! fib 42: 267914296

extern crate tine;

use std::env;
use std::process;

use tine::api::{self, FrameRecord};
use tine::{StackFrame, Worker};

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

unsafe fn fib(w: &Worker, out: *mut u64, n: u64) {
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

// ------------------------------------------------------------- program

#[repr(C)]
struct MainFrame {
    sf: StackFrame,
    n: u64,
    result: u64,
    out: *mut i32,
}

unsafe impl FrameRecord for MainFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

unsafe fn fib_main(w: &Worker, out: *mut i32, args: &[String]) {
    let n = match args.get(1).and_then(|s| s.parse::<u64>().ok()) {
        Some(n) => n,
        None => {
            eprintln!("Usage: fib [<runtime-options>] <n>");
            *out = 1;
            return;
        }
    };

    let f = api::alloc_frame(MainFrame {
        sf: StackFrame::new::<MainFrame>(),
        n,
        result: 0,
        out,
    });
    let sf = f as *mut StackFrame;
    api::enter_frame(sf);

    api::save_context(sf, fib_main_finish);
    fib(w, &mut (*f).result, n);

    fib_main_finish(w, sf)
}

unsafe fn fib_main_finish(_w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut MainFrame;
    println!("Result: {}", (*f).result);
    *(*f).out = 0;
    api::pop_frame(sf);
    api::leave_frame(sf)
}

fn main() {
    let code = match tine::run(env::args(), fib_main) {
        Ok(code) => code,
        Err(_) => 1,
    };
    process::exit(code);
}
