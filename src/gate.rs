//! Collection gate
//!
//! The coordinator's own dependencies may be instrumented themselves, so
//! constructing it can trigger reentrant callbacks. The gate is flipped to
//! paused before construction and back afterwards; callbacks observing a
//! paused gate return without collecting anything.

use std::sync::atomic::{AtomicBool, Ordering};

/// Pause switch checked by every callback entry point before any other work.
#[derive(Debug)]
pub struct CollectionGate {
    paused: AtomicBool,
}

impl CollectionGate {
    pub const fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

impl Default for CollectionGate {
    fn default() -> Self {
        Self::new()
    }
}
