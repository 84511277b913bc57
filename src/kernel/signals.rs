//! Per-process signal state
//!
//! Handlers are absolute function indices (the guest registers table
//! indices; the syscall layer translates before they land here).
//! Queued signals are a set: posting the same signal twice before
//! delivery coalesces.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct SignalsInner {
    handlers: HashMap<i32, i64>,
    waiting: BTreeSet<i32>,
}

/// Signal handlers and the pending queue for one process.
#[derive(Default)]
pub struct Signals {
    inner: Mutex<SignalsInner>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handler; zero removes it.
    pub fn add_handler(&self, signo: i32, handler: i64) {
        let mut inner = self.inner.lock().unwrap();
        if handler == 0 {
            inner.handlers.remove(&signo);
        } else {
            inner.handlers.insert(signo, handler);
        }
    }

    pub fn handler(&self, signo: i32) -> Option<i64> {
        self.inner.lock().unwrap().handlers.get(&signo).copied()
    }

    /// Queue a signal for delivery at the next interrupt check.
    pub fn queue(&self, signo: i32) {
        self.inner.lock().unwrap().waiting.insert(signo);
    }

    /// Take one pending signal together with its handler, if any is
    /// registered.
    pub fn dequeue(&self) -> Option<(i32, Option<i64>)> {
        let mut inner = self.inner.lock().unwrap();
        let signo = *inner.waiting.iter().next()?;
        inner.waiting.remove(&signo);
        let handler = inner.handlers.get(&signo).copied();
        Some((signo, handler))
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().waiting.is_empty()
    }
}
