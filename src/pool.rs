//! Closure allocation pools: a free list per worker, refilled in batches,
//! with a global spill pool shared by everyone. Closure churn is tied to
//! steals, so none of this sits on the common spawn path.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use crate::closure::{Closure, Status};

pub struct GlobalPool {
    free: Mutex<Vec<*mut Closure>>,
}

unsafe impl Send for GlobalPool {}
unsafe impl Sync for GlobalPool {}

impl GlobalPool {
    pub fn new() -> Arc<GlobalPool> {
        Arc::new(GlobalPool {
            free: Mutex::new(Vec::new()),
        })
    }
}

impl Drop for GlobalPool {
    fn drop(&mut self) {
        let mut free = self.free.lock().unwrap();
        for cl in free.drain(..) {
            drop(unsafe { Box::from_raw(cl) });
        }
    }
}

pub struct ClosurePool {
    local: RefCell<Vec<*mut Closure>>,
    batch: usize,
    global: Arc<GlobalPool>,
}

impl ClosurePool {
    pub fn new(batch: usize, global: Arc<GlobalPool>) -> ClosurePool {
        ClosurePool {
            local: RefCell::new(Vec::with_capacity(2 * batch)),
            batch,
            global,
        }
    }

    /// Hands out a closure initialized to `status`.
    pub fn allocate(&self, status: Status) -> *mut Closure {
        let mut local = self.local.borrow_mut();
        if local.is_empty() {
            let mut global = self.global.free.lock().unwrap();
            let take = self.batch.min(global.len());
            let at = global.len() - take;
            local.extend(global.drain(at..));
            drop(global);

            while local.len() < self.batch {
                local.push(Box::into_raw(Box::new(Closure::empty())));
            }
        }
        let cl = local.pop().unwrap();
        unsafe { (*cl).init(status) };
        cl
    }

    /// Returns a dead closure to the pool.
    pub fn free(&self, cl: *mut Closure) {
        unsafe { (*cl).assert_clean() };
        let mut local = self.local.borrow_mut();
        local.push(cl);
        if local.len() > 2 * self.batch {
            let at = local.len() - self.batch;
            let mut global = self.global.free.lock().unwrap();
            global.extend(local.drain(at..));
        }
    }
}

impl Drop for ClosurePool {
    fn drop(&mut self) {
        for cl in self.local.borrow_mut().drain(..) {
            drop(unsafe { Box::from_raw(cl) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_through_global() {
        let global = GlobalPool::new();
        let a = ClosurePool::new(8, global.clone());
        let b = ClosurePool::new(8, global.clone());

        let mut taken = Vec::new();
        for _ in 0..24 {
            taken.push(a.allocate(Status::Ready));
        }
        for cl in taken.drain(..) {
            a.free(cl);
        }
        // a spilled into the global pool; b refills from there
        let cl = b.allocate(Status::Running);
        assert_eq!(unsafe { (*cl).status() }, Status::Running);
        b.free(cl);
    }
}
