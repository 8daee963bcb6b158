//! The stack-frame descriptor every spawning function owns.
//!
//! Lowered code allocates one frame record per activation of a spawning
//! function and keeps everything that is live across a spawn, a call to
//! another spawning function, or a sync inside it. The descriptor itself is
//! the header of that record; the runtime only ever deals in `*mut
//! StackFrame` and relies on the embedded drop hook to release records whose
//! concrete layout it cannot know.

use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::worker::Worker;

pub const FRAME_VERSION: u32 = 0x1;
/// This frame is the spawned child of a parent exposed on the deque.
pub const FRAME_DETACHED: u32 = 0x2;
/// This frame has been promoted to a full closure.
pub const FRAME_STOLEN: u32 = 0x4;
/// There are outstanding spawned children past the last sync.
pub const FRAME_UNSYNCHED: u32 = 0x8;
/// The owning closure is suspended at a sync.
pub const FRAME_SUSPENDED: u32 = 0x10;

/// A resume entry point. Receives the worker the continuation was scheduled
/// on and the frame it belongs to; the frame carries all other state.
pub type ContinuationFn = unsafe fn(&Worker, *mut StackFrame);

/// The saved execution context of a spawning function: where to resume, plus
/// two scratch words lowered code may use to remember its position inside
/// the function (step counters and the like).
pub struct FrameCtx {
    pc: Cell<Option<ContinuationFn>>,
    pub scratch: [Cell<usize>; 2],
}

/// Frame descriptor. Embedded, first, in every lowered frame record.
#[repr(C)]
pub struct StackFrame {
    flags: AtomicU32,
    /// The closest older spawning frame on the same stack. The list ends at
    /// the oldest frame that has not been promoted; promotion severs it.
    call_parent: AtomicPtr<StackFrame>,
    /// The worker currently owning this frame; null when the frame is
    /// suspended or held by a closure that is not running.
    worker: AtomicPtr<Worker>,
    pub ctx: FrameCtx,
    drop_fn: unsafe fn(*mut StackFrame),
}

unsafe impl Send for StackFrame {}
unsafe impl Sync for StackFrame {}

/// Marker for lowered frame records: `#[repr(C)]` with the `StackFrame`
/// descriptor as the first field.
pub unsafe trait FrameRecord: Sized {
    fn descriptor(&mut self) -> &mut StackFrame;
}

unsafe fn drop_record<T: FrameRecord>(sf: *mut StackFrame) {
    drop(Box::from_raw(sf as *mut T));
}

impl StackFrame {
    pub fn new<T: FrameRecord>() -> StackFrame {
        StackFrame {
            flags: AtomicU32::new(0),
            call_parent: AtomicPtr::new(::std::ptr::null_mut()),
            worker: AtomicPtr::new(::std::ptr::null_mut()),
            ctx: FrameCtx {
                pc: Cell::new(None),
                scratch: [Cell::new(0), Cell::new(0)],
            },
            drop_fn: drop_record::<T>,
        }
    }

    // Mutations of flags and links happen either on the owning worker or
    // under the victim's deque lock during a steal; relaxed atomics carry
    // the values, the protocol carries the ordering.

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_flags(&self, flags: u32) {
        self.flags.fetch_or(flags, Ordering::Relaxed);
    }

    #[inline]
    pub fn clear_flags(&self, flags: u32) {
        self.flags.fetch_and(!flags, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_detached(&self) -> bool {
        self.flags() & FRAME_DETACHED != 0
    }

    #[inline]
    pub fn is_stolen(&self) -> bool {
        self.flags() & FRAME_STOLEN != 0
    }

    /// True when children spawned since the last sync may still be running;
    /// the sync fast path keys off this.
    #[inline]
    pub fn is_unsynched(&self) -> bool {
        self.flags() & FRAME_UNSYNCHED != 0
    }

    #[inline]
    pub fn call_parent(&self) -> *mut StackFrame {
        self.call_parent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_call_parent(&self, parent: *mut StackFrame) {
        self.call_parent.store(parent, Ordering::Relaxed);
    }

    #[inline]
    pub fn worker(&self) -> *const Worker {
        self.worker.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_worker(&self, w: *const Worker) {
        self.worker.store(w as *mut Worker, Ordering::Relaxed);
    }

    /// Records the entry point execution resumes at if this frame leaves the
    /// current stack. The setjmp of the lowered code.
    #[inline]
    pub fn save_pc(&self, pc: ContinuationFn) {
        self.ctx.pc.set(Some(pc));
    }

    /// Takes the saved entry point for dispatch.
    pub fn take_pc(&self) -> ContinuationFn {
        match self.ctx.pc.take() {
            Some(pc) => pc,
            None => rts_bug!("resuming a frame with no saved continuation"),
        }
    }

    /// Releases the whole lowered record this descriptor heads. The caller
    /// must be the last to touch the frame.
    pub unsafe fn release(sf: *mut StackFrame) {
        let drop_fn = (*sf).drop_fn;
        drop_fn(sf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct TestFrame {
        sf: StackFrame,
        value: u64,
    }

    unsafe impl FrameRecord for TestFrame {
        fn descriptor(&mut self) -> &mut StackFrame {
            &mut self.sf
        }
    }

    #[test]
    fn flag_algebra() {
        let sf = StackFrame::new::<TestFrame>();
        sf.set_flags(FRAME_VERSION);
        assert!(!sf.is_detached());

        sf.add_flags(FRAME_DETACHED | FRAME_UNSYNCHED);
        assert!(sf.is_detached());
        assert!(sf.is_unsynched());

        sf.clear_flags(FRAME_UNSYNCHED);
        assert!(!sf.is_unsynched());
        assert_eq!(sf.flags(), FRAME_VERSION | FRAME_DETACHED);
    }

    #[test]
    fn release_runs_record_drop() {
        let record = Box::new(TestFrame {
            sf: StackFrame::new::<TestFrame>(),
            value: 7,
        });
        let raw = Box::into_raw(record);
        unsafe {
            assert_eq!((*raw).value, 7);
            StackFrame::release(raw as *mut StackFrame);
        }
    }
}
