//! Nested-spawn depth exercise: `f(n) = spawn f(n-1); f(n-2); sync`. Each
//! open spawn holds one shadow-stack slot on the spawning worker, so a
//! deque depth below the recursion depth must die with the overflow
//! report rather than corrupt the queue.

extern crate tine;

use std::env;
use std::process;

use tine::api::{self, FrameRecord};
use tine::{StackFrame, Worker};

#[repr(C)]
struct DeepFrame {
    sf: StackFrame,
    n: u64,
    left: u64,
    right: u64,
    out: *mut u64,
}

unsafe impl FrameRecord for DeepFrame {
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

unsafe fn deep(w: &Worker, out: *mut u64, n: u64) {
    if n < 2 {
        *out = 1;
        return;
    }

    let f = api::alloc_frame(DeepFrame {
        sf: StackFrame::new::<DeepFrame>(),
        n,
        left: 0,
        right: 0,
        out,
    });
    let sf = f as *mut StackFrame;
    api::enter_frame(sf);

    api::save_context(sf, deep_cont);
    deep_spawn_helper(w, &mut (*f).left, n - 1);

    deep_cont(w, sf)
}

unsafe fn deep_spawn_helper(w: &Worker, out: *mut u64, n: u64) {
    let h = api::alloc_frame(HelperFrame {
        sf: StackFrame::new::<HelperFrame>(),
    });
    let sf = h as *mut StackFrame;
    api::enter_frame_fast(w, sf);
    api::detach(sf);
    api::save_context(sf, helper_continuation);

    deep(w, out, n);

    helper_continuation(w, sf)
}

unsafe fn helper_continuation(_w: &Worker, sf: *mut StackFrame) {
    api::pop_frame(sf);
    api::leave_frame(sf)
}

unsafe fn deep_cont(w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut DeepFrame;
    let n = (*f).n;

    api::save_context(sf, deep_join);
    deep(w, &mut (*f).right, n - 2);

    deep_join(w, sf)
}

unsafe fn deep_join(w: &Worker, sf: *mut StackFrame) {
    if (*sf).is_unsynched() {
        api::save_context(sf, deep_finish);
        api::sync(sf);
    }
    deep_finish(w, sf)
}

unsafe fn deep_finish(_w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut DeepFrame;
    *(*f).out = (*f).left + (*f).right;
    api::pop_frame(sf);
    api::leave_frame(sf)
}

// ------------------------------------------------------------- program

#[repr(C)]
struct MainFrame {
    sf: StackFrame,
    n: u64,
    calls: u64,
    out: *mut i32,
}

unsafe impl FrameRecord for MainFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

unsafe fn deep_main(w: &Worker, out: *mut i32, args: &[String]) {
    let n = match args.get(1).and_then(|s| s.parse::<u64>().ok()) {
        Some(n) => n,
        None => {
            eprintln!("Usage: spawn_deep [<runtime-options>] <n>");
            *out = 1;
            return;
        }
    };

    let f = api::alloc_frame(MainFrame {
        sf: StackFrame::new::<MainFrame>(),
        n,
        calls: 0,
        out,
    });
    let sf = f as *mut StackFrame;
    api::enter_frame(sf);

    api::save_context(sf, deep_main_finish);
    deep(w, &mut (*f).calls, n);

    deep_main_finish(w, sf)
}

unsafe fn deep_main_finish(_w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut MainFrame;
    println!("leaves: {}", (*f).calls);
    *(*f).out = 0;
    api::pop_frame(sf);
    api::leave_frame(sf)
}

fn main() {
    let code = match tine::run(env::args(), deep_main) {
        Ok(code) => code,
        Err(_) => 1,
    };
    process::exit(code);
}
