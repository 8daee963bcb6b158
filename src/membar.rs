//! Memory barriers, named after the reordering they forbid.

use std::sync::atomic::{fence, Ordering};

/// Ensure that all previous reads are globally visible before any future
/// reads become visible.
#[inline]
pub fn load_load() {
    fence(Ordering::Acquire);
}

/// Ensure that all previous writes are globally visible before any future
/// writes become visible.
#[inline]
pub fn store_store() {
    fence(Ordering::Release);
}

/// Ensure that all previous writes are globally visible before any future
/// reads are performed. This is the expensive one, and the one the steal
/// handshake leans on from both sides.
#[inline]
pub fn store_load() {
    fence(Ordering::SeqCst);
}

/// Full barrier.
#[inline]
pub fn full() {
    fence(Ordering::SeqCst);
}
