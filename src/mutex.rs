use std::cell::Cell;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

pub const NOBODY: isize = -1;

/// A mutex without a guard object. The scheduling protocols acquire and
/// release locks in non-lexical order (a deque lock is dropped halfway
/// through a steal, a child closure is unlocked before its parent), so
/// ownership is tracked by hand instead of by scope.
pub struct Mutex {
    raw: RawMutex,
    // Worker id of the holder, for assertions only. Writes race with
    // nothing: the field is touched right after acquiring and right before
    // releasing the raw lock.
    owner: Cell<isize>,
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            raw: RawMutex::INIT,
            owner: Cell::new(NOBODY),
        }
    }

    #[inline]
    pub fn lock(&self, who: isize) {
        self.raw.lock();
        self.owner.set(who);
    }

    /// Try to acquire the lock; returns false when contended.
    #[inline]
    pub fn try_lock(&self, who: isize) -> bool {
        if self.raw.try_lock() {
            self.owner.set(who);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn unlock(&self, who: isize) {
        debug_assert_eq!(self.owner.get(), who);
        self.owner.set(NOBODY);
        unsafe { self.raw.unlock() };
    }

    /// Asserts the lock is held by worker `who`.
    #[inline]
    pub fn assert_held_by(&self, who: isize) {
        rts_assert!(self.owner.get() == who);
    }

    /// Asserts the lock is *not* held by worker `who`.
    #[inline]
    pub fn assert_not_held_by(&self, who: isize) {
        rts_assert!(self.owner.get() != who);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_cycle() {
        let m = Mutex::new();
        m.lock(0);
        assert!(!m.try_lock(1));
        m.unlock(0);
        assert!(m.try_lock(1));
        m.unlock(1);
    }
}
