//! Wakeup plumbing: notifications, waiters, and interrupt tokens
//!
//! Blocking points (pipe I/O, wait4) follow one discipline: create a
//! [`Notify`], register it with every event source that could unblock
//! the sleep, re-check the condition, then wait. Because registration
//! happens before the re-check, a wakeup that races the check is never
//! lost.
//!
//! An [`InterruptToken`] is the cancellation half: one is minted per
//! syscall, its `cancel` is installed as the task's interrupt hook, and
//! signal delivery fires it to kick the task out of any blocking
//! operation with `Interrupted`.

use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// A one-slot wakeup flag a thread can sleep on.
pub struct Notify {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Notify {
    pub fn new() -> Arc<Notify> {
        Arc::new(Notify {
            state: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// Wake the sleeper (or make the next wait return immediately).
    pub fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.cond.notify_all();
    }

    /// Sleep until notified, consuming the notification.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !*state {
            state = self.cond.wait(state).unwrap();
        }
        *state = false;
    }
}

/// A set of registered notifications, woken together.
#[derive(Default)]
pub struct Waiter {
    waiters: Mutex<Vec<Arc<Notify>>>,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, notify: Arc<Notify>) {
        self.waiters.lock().unwrap().push(notify);
    }

    pub fn unregister(&self, notify: &Arc<Notify>) {
        self.waiters
            .lock()
            .unwrap()
            .retain(|n| !Arc::ptr_eq(n, notify));
    }

    pub fn notify_all(&self) {
        let waiters = self.waiters.lock().unwrap();
        log::trace!("waiter: notify count={}", waiters.len());
        for n in waiters.iter() {
            n.notify();
        }
    }
}

/// Registration that detaches on drop, so early returns from blocking
/// code never leak a waiter slot.
pub struct Registration<'a> {
    waiter: &'a Waiter,
    notify: Arc<Notify>,
}

impl<'a> Registration<'a> {
    pub fn new(waiter: &'a Waiter, notify: Arc<Notify>) -> Self {
        waiter.register(Arc::clone(&notify));
        Self { waiter, notify }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.waiter.unregister(&self.notify);
    }
}

struct TokenInner {
    cancelled: AtomicBool,
    waiter: Waiter,
}

/// Cancellation handle for one syscall invocation.
#[derive(Clone)]
pub struct InterruptToken {
    inner: Arc<TokenInner>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                waiter: Waiter::new(),
            }),
        }
    }

    /// Mark the token cancelled and wake everything sleeping on it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.waiter.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Attach a notify for the duration of a blocking wait.
    pub fn register(&self, notify: Arc<Notify>) -> Registration<'_> {
        Registration::new(&self.inner.waiter, notify)
    }
}

impl Default for InterruptToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_notify_before_wait_does_not_block() {
        let n = Notify::new();
        n.notify();
        n.wait(); // consumed, returns at once
    }

    #[test]
    fn test_notify_wakes_sleeper() {
        let n = Notify::new();
        let n2 = Arc::clone(&n);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            n2.notify();
        });
        n.wait();
        t.join().unwrap();
    }

    #[test]
    fn test_waiter_fans_out() {
        let w = Waiter::new();
        let a = Notify::new();
        let b = Notify::new();
        w.register(Arc::clone(&a));
        w.register(Arc::clone(&b));
        w.notify_all();
        a.wait();
        b.wait();
    }

    #[test]
    fn test_registration_drops_cleanly() {
        let w = Waiter::new();
        let n = Notify::new();
        {
            let _reg = Registration::new(&w, Arc::clone(&n));
            assert_eq!(w.waiters.lock().unwrap().len(), 1);
        }
        assert_eq!(w.waiters.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_cancel_wakes_registered_notify() {
        let token = InterruptToken::new();
        let n = Notify::new();
        let _reg = token.register(Arc::clone(&n));

        let token2 = token.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token2.cancel();
        });

        n.wait();
        assert!(token.is_cancelled());
        t.join().unwrap();
    }
}
