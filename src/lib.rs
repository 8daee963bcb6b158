//! A work-first fork-join runtime.
//!
//! `tine` executes programs annotated with `spawn`/`sync` on a fixed pool of
//! worker threads. A spawn is nothing but a stack-frame descriptor pushed
//! onto the spawning worker's lazy task queue; the frame is promoted to a
//! first-class closure only if some other worker actually steals it. Victim
//! and thief coordinate through the THE (Tail/Head/Exception) protocol, a
//! Dekker-style handshake on three shared indices, so the common case of an
//! unstolen spawn costs a couple of stores and one fence.
//!
//! The runtime keeps a tree of closures describing all unfinished parallel
//! work. A `sync` with outstanding children suspends its closure; the last
//! returning child revives the parent right on the returning worker (the
//! "provably good steal"), without a trip through the steal path. User code
//! runs on guard-paged fibers owned by closures, so a computation can leave
//! one worker at a spawn and finish its sync on another.
//!
//! User programs are expected in hand-lowered form: spawning functions keep
//! their live values in an explicit frame record and drive the runtime
//! through the calls in [`api`]. See `demos/fib.rs` for the canonical shape.

#[macro_use]
extern crate log;

#[macro_use]
mod bug;

mod closure;
mod deque;
mod exception;
mod fiber;
mod frame;
mod global;
mod membar;
mod mutex;
mod options;
mod pool;
mod rng;
mod sched;
mod steal;
mod tls;
mod worker;

pub mod api;
pub mod errors;

pub use self::frame::{ContinuationFn, StackFrame};
pub use self::global::{run, run_with, EntryFn};
pub use self::options::{Options, Parsed};
pub use self::worker::Worker;

/// Number of fibers currently alive, across all workers. Returns to zero
/// once [`run`] has torn the pool down; useful for leak checks.
pub fn live_fibers() -> isize {
    fiber::live_count()
}

/// Number of successful steals since the process started.
pub fn steal_count() -> u64 {
    steal::steal_count()
}
