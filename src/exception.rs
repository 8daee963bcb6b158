//! The exception half of the THE channel.
//!
//! A thief announces a steal attempt by raising the victim's exception
//! index; the victim compares against it after every detached pop. The
//! infinite exception is a broadcast that forces every worker through the
//! slow path so it observes shutdown.

use crate::closure::{Closure, Status};
use crate::global::Global;
use crate::membar;
use crate::worker::Worker;

pub const EXCEPTION_INFINITY: usize = usize::MAX;

/// Thief side of the handshake: raise the victim's exception index. Caller
/// holds the victim's deque lock and `cl`'s lock.
pub fn increment_exception_pointer(w: &Worker, victim: &Worker, cl: &Closure) {
    cl.assert_ownership(w);
    rts_assert!(cl.status() == Status::Running);

    let exc = victim.exc();
    if exc != EXCEPTION_INFINITY {
        victim.set_exc(exc + 1);
        // The exception must be visible before the thief re-reads the
        // queue bounds.
        membar::store_load();
    }
}

/// Retract a lost handshake.
pub fn decrement_exception_pointer(w: &Worker, victim: &Worker, cl: &Closure) {
    cl.assert_ownership(w);
    rts_assert!(cl.status() == Status::Running);

    let exc = victim.exc();
    if exc != EXCEPTION_INFINITY {
        victim.set_exc(exc - 1);
    }
}

/// Re-arms the owner's exception index at the start of an execution window.
pub fn reset_exception_pointer(w: &Worker, cl: &Closure) {
    cl.assert_ownership(w);
    let frame = cl.frame();
    rts_assert!(
        frame.is_null()
            || unsafe { (*frame).worker() } == w as *const Worker
            || unsafe { (*frame).worker() }.is_null()
    );
    w.set_exc(w.head());
}

/// Sends the infinite exception to every worker, so that whoever is deep in
/// user code falls into the runtime and sees the done flag.
pub fn signal_immediate_exception_to_all(g: &Global) {
    for w in g.workers() {
        w.set_exc(EXCEPTION_INFINITY);
    }
    membar::full();
}
