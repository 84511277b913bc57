//! Process groups
//!
//! A group holds a process and its descendants for wait semantics.
//! Members are weak references (the process table owns processes); the
//! group's waiter carries child-exit notifications so a blocked
//! `wait_any_child` is always retried after a concurrent exit.

use std::sync::{Arc, RwLock, Weak};

use super::process::{Process, ProcessStatus};
use super::waiter::{InterruptToken, Notify, Waiter};

/// Reasons a blocking reap can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The wait was cancelled by signal delivery.
    Interrupted,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupted => write!(f, "wait interrupted"),
        }
    }
}

impl std::error::Error for WaitError {}

#[derive(Default)]
pub struct ProcessGroup {
    members: RwLock<Vec<Weak<Process>>>,
    events: Waiter,
}

impl ProcessGroup {
    pub fn new() -> Arc<ProcessGroup> {
        Arc::new(ProcessGroup::default())
    }

    pub fn add(&self, p: &Arc<Process>) {
        self.members.write().unwrap().push(Arc::downgrade(p));
    }

    pub fn remove(&self, p: &Arc<Process>) {
        self.members
            .write()
            .unwrap()
            .retain(|w| !w.upgrade().map(|m| Arc::ptr_eq(&m, p)).unwrap_or(false));
    }

    pub fn len(&self) -> usize {
        self.members.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called by an exiting member: wake every blocked reaper.
    pub fn process_exited(&self, pid: i32) {
        log::trace!("process-exited pid={}", pid);
        self.events.notify_all();
    }

    /// Take one Dead member out of the group, if there is one.
    fn reap_once(&self) -> Option<Arc<Process>> {
        let mut members = self.members.write().unwrap();

        let mut found = None;
        members.retain(|w| {
            if found.is_some() {
                return true;
            }
            match w.upgrade() {
                Some(p) if p.status() == ProcessStatus::Dead => {
                    found = Some(p);
                    false
                }
                Some(_) => true,
                // Dropped without exiting; prune.
                None => false,
            }
        });

        found
    }

    /// Reap one Dead member, optionally blocking until one appears or
    /// the interrupt token fires.
    pub fn reap_any(
        &self,
        intr: &InterruptToken,
        block: bool,
    ) -> Result<Option<Arc<Process>>, WaitError> {
        if !block {
            return Ok(self.reap_once());
        }

        let notify = Notify::new();
        self.events.register(Arc::clone(&notify));
        let _cancel = intr.register(Arc::clone(&notify));

        let result = loop {
            if let Some(p) = self.reap_once() {
                break Ok(Some(p));
            }
            if intr.is_cancelled() {
                break Err(WaitError::Interrupted);
            }
            log::trace!("process-waiting-reap");
            notify.wait();
        };

        self.events.unregister(&notify);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::super::process::tests::bare_process;
    use super::*;

    #[test]
    fn test_reap_finds_dead_member() {
        let group = ProcessGroup::new();
        let parent = bare_process(1, Arc::clone(&group));
        let child = bare_process(2, Arc::clone(&group));
        group.add(&parent);
        group.add(&child);

        child.exit(1);

        let intr = InterruptToken::new();
        let reaped = group.reap_any(&intr, false).unwrap().unwrap();
        assert_eq!(reaped.pid, 2);
        assert_eq!(reaped.exit_status().code, 1);

        // Reaped once; the dead child is gone from the group.
        assert!(group.reap_any(&intr, false).unwrap().is_none());
    }

    #[test]
    fn test_nonblocking_reap_returns_none() {
        let group = ProcessGroup::new();
        let parent = bare_process(1, Arc::clone(&group));
        group.add(&parent);

        let intr = InterruptToken::new();
        assert!(group.reap_any(&intr, false).unwrap().is_none());
    }

    #[test]
    fn test_blocking_reap_sees_concurrent_exit() {
        let group = ProcessGroup::new();
        let parent = bare_process(1, Arc::clone(&group));
        let child = bare_process(2, Arc::clone(&group));
        group.add(&parent);
        group.add(&child);

        let child2 = Arc::clone(&child);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            child2.exit(7);
        });

        let intr = InterruptToken::new();
        let reaped = group.reap_any(&intr, true).unwrap().unwrap();
        assert_eq!(reaped.pid, 2);
        assert_eq!(reaped.exit_status().code, 7);
        t.join().unwrap();
    }

    #[test]
    fn test_blocking_reap_interrupted() {
        let group = ProcessGroup::new();
        let parent = bare_process(1, Arc::clone(&group));
        group.add(&parent);

        let intr = InterruptToken::new();
        let intr2 = intr.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            intr2.cancel();
        });

        assert_eq!(
            group.reap_any(&intr, true).unwrap_err(),
            WaitError::Interrupted
        );
        t.join().unwrap();
    }
}
