//! Global runtime state and the program lifecycle: boot the pool, run the
//! root computation, join, tear down.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::api;
use crate::closure::{Closure, Status};
use crate::deque::ReadyDeque;
use crate::errors::{Error, Result};
use crate::exception::signal_immediate_exception_to_all;
use crate::fiber::Fiber;
use crate::frame::{FrameRecord, StackFrame, FRAME_STOLEN, FRAME_VERSION};
use crate::membar;
use crate::options::{self, Options, Parsed};
use crate::pool::GlobalPool;
use crate::sched;
use crate::tls;
use crate::worker::Worker;

/// The program entry function, in lowered form. Receives the worker it was
/// spawned on, the slot for the exit code, and the program arguments the
/// option parser left over (`argv[0]` first).
pub type EntryFn = unsafe fn(w: &Worker, out: *mut i32, args: &[String]);

/// Everything process-wide: one instance per [`run_with`] call, created at
/// entry and owned by it. Workers reach it through a back pointer that
/// stays valid until every pool thread has joined.
pub struct Global {
    options: Options,
    nworkers: usize,
    workers: Box<[Worker]>,
    deques: Box<[ReadyDeque]>,
    args: Vec<String>,

    start: AtomicBool,
    done: AtomicBool,
    exit_code: AtomicI32,

    root: Cell<*mut Closure>,

    // keeps the spill pool alive as long as any worker's local pool
    #[allow(dead_code)]
    closure_pool: Arc<GlobalPool>,
}

unsafe impl Send for Global {}
unsafe impl Sync for Global {}

impl Global {
    fn new(options: Options, args: Vec<String>) -> Arc<Global> {
        let nworkers = options.effective_nproc();
        let closure_pool = GlobalPool::new();

        let workers = (0..nworkers)
            .map(|i| Worker::new(i, &options, closure_pool.clone()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let deques = (0..nworkers)
            .map(ReadyDeque::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let g = Arc::new(Global {
            options,
            nworkers,
            workers,
            deques,
            args,
            start: AtomicBool::new(false),
            done: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            root: Cell::new(ptr::null_mut()),
            closure_pool,
        });

        for w in g.workers.iter() {
            w.bind_global(&*g as *const Global);
        }
        g
    }

    #[inline]
    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    #[inline]
    pub fn worker(&self, index: usize) -> &Worker {
        &self.workers[index]
    }

    #[inline]
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    #[inline]
    pub fn deque(&self, index: usize) -> &ReadyDeque {
        &self.deques[index]
    }

    #[inline]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.start.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn set_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }
}

// ------------------------------------------------------------- root frame

#[repr(C)]
struct RootFrame {
    sf: StackFrame,
    entry: EntryFn,
    ret: i32,
}

unsafe impl FrameRecord for RootFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

#[repr(C)]
struct RootHelperFrame {
    sf: StackFrame,
    entry: EntryFn,
    out: *mut i32,
}

unsafe impl FrameRecord for RootHelperFrame {
    fn descriptor(&mut self) -> &mut StackFrame {
        &mut self.sf
    }
}

/// First continuation of the root closure. Spawning the entry function
/// (rather than calling it) gives the pool something to steal immediately
/// and gives the root a natural place to wait for everything: its sync.
unsafe fn root_continuation(w: &Worker, sf: *mut StackFrame) {
    debug!("[{}] root computation starting", w.id());
    let f = sf as *mut RootFrame;

    api::save_context(sf, root_sync);
    root_spawn_helper(w, (*f).entry, &mut (*f).ret);
    root_sync(w, sf)
}

unsafe fn root_spawn_helper(w: &Worker, entry: EntryFn, out: *mut i32) {
    let h = api::alloc_frame(RootHelperFrame {
        sf: StackFrame::new::<RootHelperFrame>(),
        entry,
        out,
    });
    let hsf = h as *mut StackFrame;
    api::enter_frame_fast(w, hsf);
    api::detach(hsf);
    api::save_context(hsf, root_helper_continuation);

    entry(w, out, w.global().args());

    root_helper_continuation(w, hsf)
}

unsafe fn root_helper_continuation(_w: &Worker, sf: *mut StackFrame) {
    api::pop_frame(sf);
    api::leave_frame(sf)
}

unsafe fn root_sync(w: &Worker, sf: *mut StackFrame) {
    if (*sf).is_unsynched() {
        api::save_context(sf, root_finish);
        api::sync(sf);
    }
    root_finish(w, sf)
}

unsafe fn root_finish(w: &Worker, sf: *mut StackFrame) {
    let f = sf as *mut RootFrame;
    let g = w.global();

    debug!("[{}] root computation done, exit code {}", w.id(), (*f).ret);
    g.set_exit_code((*f).ret);
    membar::store_store();
    g.set_done();
    signal_immediate_exception_to_all(g);

    sched::longjmp_to_runtime(w)
}

fn create_root(g: &Global, entry: EntryFn) -> *mut Closure {
    let frame = api::alloc_frame(RootFrame {
        sf: StackFrame::new::<RootFrame>(),
        entry,
        ret: 0,
    });
    let sf = frame as *mut StackFrame;
    unsafe {
        (*sf).set_flags(FRAME_VERSION | FRAME_STOLEN);
        (*sf).save_pc(root_continuation);
    }

    // The root closure is built by the main thread before the pool wakes,
    // so it bypasses the per-worker pools.
    let root = Box::into_raw(Box::new(Closure::empty()));
    unsafe {
        (*root).init(Status::Ready);
        (*root).set_frame(sf);
        (*root).give_fiber(Fiber::allocate(g.options.stacksize));
    }
    root
}

unsafe fn teardown_root(g: &Global) {
    let root = g.root.get();
    if root.is_null() {
        return;
    }
    g.root.set(ptr::null_mut());

    // the root finishes while still sitting at the bottom of the deque of
    // whichever worker resumed it last
    let owner = (*root).owner_ready_deque.get();
    if owner >= 0 {
        let w = g.worker(owner as usize);
        let deque = g.deque(owner as usize);
        deque.lock(w);
        let t = deque.xtract_bottom(w);
        rts_assert!(t == root);
        deque.unlock(w);
    }

    if let Some(fiber) = (*root).take_fiber() {
        drop(fiber);
    }
    let sf = (*root).frame();
    (*root).set_frame(ptr::null_mut());
    if !sf.is_null() {
        StackFrame::release(sf);
    }
    drop(Box::from_raw(root));
}

// ------------------------------------------------------------- lifecycle

/// Runs `entry` on a fresh pool configured by `options`, with `args` as
/// the program arguments. Returns the exit code the entry function left
/// behind. Blocks until every worker has joined; no runtime state outlives
/// the call except the process-wide counters.
pub fn run_with(options: Options, args: Vec<String>, entry: EntryFn) -> Result<i32> {
    let g = Global::new(options, args);
    debug!("booting {} workers", g.nworkers());

    let mut handles = Vec::with_capacity(g.nworkers());
    for i in 0..g.nworkers() {
        let g2 = Arc::clone(&g);
        let handle = thread::Builder::new()
            .name(format!("tine-worker-{}", i))
            .spawn(move || {
                let w = g2.worker(i);
                unsafe { tls::set_worker(w as *const Worker) };

                // startup barrier: the root closure is not built yet
                while !g2.is_started() {
                    thread::sleep(Duration::from_micros(1));
                }

                let initial = if i == 0 { g2.root.get() } else { ptr::null_mut() };
                sched::worker_scheduler(w, initial);
            });

        match handle {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                // release whatever already spun up, then report
                g.set_done();
                g.start.store(true, Ordering::SeqCst);
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(Error::ThreadSpawn(err.to_string()));
            }
        }
    }

    // the order matters: the root must be visible before start is
    g.root.set(create_root(&g, entry));
    membar::store_store();
    g.start.store(true, Ordering::SeqCst);

    for handle in handles {
        if handle.join().is_err() {
            rts_bug!("a worker thread panicked");
        }
    }

    let code = g.exit_code.load(Ordering::SeqCst);
    unsafe { teardown_root(&g) };
    drop(g);

    Ok(code)
}

/// Command-line front door: picks the runtime's options out of `args`,
/// then runs `entry` with the rest. `--help` prints usage and yields exit
/// code 0 without running the program; option errors surface as `Err`.
pub fn run<I>(args: I, entry: EntryFn) -> Result<i32>
where
    I: IntoIterator<Item = String>,
{
    let parsed = match options::parse(args) {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("tine: {}", err);
            options::usage();
            return Err(err);
        }
    };

    match parsed {
        Parsed::Help => Ok(0),
        Parsed::Run(options, rest) => run_with(options, rest, entry),
    }
}
