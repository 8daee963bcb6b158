//! Divide-and-conquer matrix multiply, hand-lowered. Computes C += A*B
//! over square power-of-two matrices: four spawned quadrant products, a
//! sync, four more, a sync. Verifies against the sequential triple loop.

extern crate tine;

use std::env;
use std::process;

use tine::api::{self, FrameRecord};
use tine::{StackFrame, Worker};

const THRESHOLD: usize = 16;

fn mm_dac_serial(c: &mut [i32], a: &[i32], b: &[i32], n: usize) {
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                c[i * n + j] += a[i * n + k] * b[k * n + j];
            }
        }
    }
}

#[repr(C)]
struct MmFrame {
    sf: StackFrame,
    c: *mut i32,
    a: *const i32,
    b: *const i32,
    n: usize,
    length: usize,
}

unsafe impl FrameRecord for MmFrame {
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

/// Base addresses for sub-product `index` (0..8): the first four fold the
/// left halves of A into C, the last four the right halves.
unsafe fn quadrant(f: *mut MmFrame, index: usize) -> (*mut i32, *const i32, *const i32) {
    let n = (*f).n;
    let mid = (*f).length >> 1;
    let c = (*f).c;
    let a = (*f).a;
    let b = (*f).b;

    let c00 = c;
    let c01 = c.add(mid);
    let c10 = c.add(n * mid);
    let c11 = c.add(n * mid + mid);

    let a00 = a;
    let a01 = a.add(mid);
    let a10 = a.add(n * mid);
    let a11 = a.add(n * mid + mid);

    let b00 = b;
    let b01 = b.add(mid);
    let b10 = b.add(n * mid);
    let b11 = b.add(n * mid + mid);

    match index {
        0 => (c00, a00, b00),
        1 => (c01, a00, b01),
        2 => (c10, a10, b00),
        3 => (c11, a10, b01),
        4 => (c00, a01, b10),
        5 => (c01, a01, b11),
        6 => (c10, a11, b10),
        _ => (c11, a11, b11),
    }
}

pub unsafe fn mm_dac(w: &Worker, c: *mut i32, a: *const i32, b: *const i32, n: usize, length: usize) {
    if length < THRESHOLD {
        for i in 0..length {
            for j in 0..length {
                for k in 0..length {
                    *c.add(i * n + j) += *a.add(i * n + k) * *b.add(k * n + j);
                }
            }
        }
        return;
    }

    let f = api::alloc_frame(MmFrame {
        sf: StackFrame::new::<MmFrame>(),
        c,
        a,
        b,
        n,
        length,
    });
    let sf = f as *mut StackFrame;
    api::enter_frame(sf);

    mm_steps(w, sf, 0)
}

unsafe fn mm_resume(w: &Worker, sf: *mut StackFrame) {
    let step = (*sf).ctx.scratch[0].get();
    mm_steps(w, sf, step)
}

/// The statement list of the lowered body; `step` indexes into it. Steps
/// 0-3 and 5-8 spawn quadrant products, 4 and 9 sync between the two
/// rounds (the second round reuses every C quadrant), 10 leaves.
unsafe fn mm_steps(w: &Worker, sf: *mut StackFrame, mut step: usize) {
    let f = sf as *mut MmFrame;
    loop {
        match step {
            0..=3 | 5..=8 => {
                let index = if step < 4 { step } else { step - 1 };
                let (c, a, b) = quadrant(f, index);
                let n = (*f).n;
                let mid = (*f).length >> 1;

                (*sf).ctx.scratch[0].set(step + 1);
                api::save_context(sf, mm_resume);
                mm_spawn_helper(w, c, a, b, n, mid);
                step += 1;
            }
            4 | 9 => {
                if (*sf).is_unsynched() {
                    (*sf).ctx.scratch[0].set(step + 1);
                    api::save_context(sf, mm_resume);
                    api::sync(sf);
                }
                step += 1;
            }
            _ => {
                api::pop_frame(sf);
                api::leave_frame(sf);
                return;
            }
        }
    }
}

unsafe fn mm_spawn_helper(
    w: &Worker,
    c: *mut i32,
    a: *const i32,
    b: *const i32,
    n: usize,
    length: usize,
) {
    let h = api::alloc_frame(HelperFrame {
        sf: StackFrame::new::<HelperFrame>(),
    });
    let sf = h as *mut StackFrame;
    api::enter_frame_fast(w, sf);
    api::detach(sf);
    api::save_context(sf, helper_continuation);

    mm_dac(w, c, a, b, n, length);

    helper_continuation(w, sf)
}

unsafe fn helper_continuation(_w: &Worker, sf: *mut StackFrame) {
    api::pop_frame(sf);
    api::leave_frame(sf)
}

// ------------------------------------------------------------- program

/// Deterministic in-order fill, same sequence on every run.
fn fill_matrix(dest: &mut [i32], seed: &mut u32) {
    for v in dest.iter_mut() {
        *seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        *v = ((*seed >> 16) & 0xff) as i32;
    }
}

#[repr(C)]
struct MainFrame {
    sf: StackFrame,
    c: *mut i32,
    a: *const i32,
    b: *const i32,
    n: usize,
    out: *mut i32,
}

unsafe impl FrameRecord for MainFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

unsafe fn mm_main(w: &Worker, out: *mut i32, args: &[String]) {
    let n = match args.get(1).and_then(|s| s.parse::<usize>().ok()) {
        Some(n) if n.is_power_of_two() && n >= 2 => n,
        _ => {
            eprintln!("Usage: mm_dac [<runtime-options>] <n>   (n a power of 2)");
            *out = 1;
            return;
        }
    };

    let mut seed = 1u32;
    let mut a = vec![0i32; n * n];
    let mut b = vec![0i32; n * n];
    let c = vec![0i32; n * n];
    fill_matrix(&mut a, &mut seed);
    fill_matrix(&mut b, &mut seed);

    // The buffers must survive any migration of this computation, so they
    // leave the native stack for the duration; the finish step frees them.
    let a = Box::leak(a.into_boxed_slice());
    let b = Box::leak(b.into_boxed_slice());
    let c = Box::leak(c.into_boxed_slice());

    let f = api::alloc_frame(MainFrame {
        sf: StackFrame::new::<MainFrame>(),
        c: c.as_mut_ptr(),
        a: a.as_ptr(),
        b: b.as_ptr(),
        n,
        out,
    });
    let sf = f as *mut StackFrame;
    api::enter_frame(sf);

    api::save_context(sf, mm_main_finish);
    mm_dac(w, (*f).c, (*f).a, (*f).b, n, n);

    mm_main_finish(w, sf)
}

unsafe fn mm_main_finish(_w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut MainFrame;
    let n = (*f).n;
    let a = ::std::slice::from_raw_parts((*f).a, n * n);
    let b = ::std::slice::from_raw_parts((*f).b, n * n);
    let c = ::std::slice::from_raw_parts((*f).c, n * n);

    let mut reference = vec![0i32; n * n];
    mm_dac_serial(&mut reference, a, b, n);

    if reference[..] == c[..] {
        println!("mm_dac test passed");
        *(*f).out = 0;
    } else {
        eprintln!("mm_dac test FAILED");
        *(*f).out = 1;
    }

    for ptr in &[(*f).a as *mut i32, (*f).b as *mut i32, (*f).c] {
        drop(Box::from_raw(::std::ptr::slice_from_raw_parts_mut(*ptr, n * n)));
    }

    api::pop_frame(sf);
    api::leave_frame(sf)
}

fn main() {
    let code = match tine::run(env::args(), mm_main) {
        Ok(code) => code,
        Err(_) => 1,
    };
    process::exit(code);
}
