//! In-kernel pipes
//!
//! A bounded byte queue with one logical read end and one logical
//! write end. Reads block until data arrives, the last writer goes
//! away (EOF), or the caller's interrupt token fires; writes block
//! while the buffer is full and fail with `BrokenPipe` once no reader
//! remains. End counts grow on fork (the two ends are shared through
//! the refcounted File layer, so each File closes its end exactly
//! once).

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use super::waiter::{InterruptToken, Notify, Registration, Waiter};

/// Buffered capacity, matching the Linux default.
pub const PIPE_CAPACITY: usize = 65536;

struct PipeState {
    data: VecDeque<u8>,
    readers: u32,
    writers: u32,
}

struct Shared {
    state: Mutex<PipeState>,
    waiter: Waiter,
}

/// Create a connected pipe pair.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState {
            data: VecDeque::with_capacity(PIPE_CAPACITY),
            readers: 1,
            writers: 1,
        }),
        waiter: Waiter::new(),
    });

    (
        PipeReader {
            shared: Arc::clone(&shared),
            closed: false,
        },
        PipeWriter {
            shared,
            closed: false,
        },
    )
}

pub struct PipeReader {
    shared: Arc<Shared>,
    closed: bool,
}

pub struct PipeWriter {
    shared: Arc<Shared>,
    closed: bool,
}

impl PipeReader {
    /// Blocking read. Returns 0 at EOF (no writers, buffer drained) and
    /// `Interrupted` when the token fires first.
    pub fn read(&mut self, buf: &mut [u8], intr: &InterruptToken) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let notify = Notify::new();
        let _queue = Registration::new(&self.shared.waiter, Arc::clone(&notify));
        let _cancel = intr.register(Arc::clone(&notify));

        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if !state.data.is_empty() {
                    let n = buf.len().min(state.data.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = state.data.pop_front().unwrap();
                    }
                    // Space opened up; unblock writers.
                    self.shared.waiter.notify_all();
                    return Ok(n);
                }
                if state.writers == 0 {
                    return Ok(0);
                }
            }

            if intr.is_cancelled() {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }

            notify.wait();
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.state.lock().unwrap().readers -= 1;
        self.shared.waiter.notify_all();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl PipeWriter {
    /// Blocking write of the whole buffer. Fails with `BrokenPipe` once
    /// no reader remains, `Interrupted` when the token fires while the
    /// buffer is full.
    pub fn write(&mut self, buf: &[u8], intr: &InterruptToken) -> io::Result<usize> {
        let notify = Notify::new();
        let _queue = Registration::new(&self.shared.waiter, Arc::clone(&notify));
        let _cancel = intr.register(Arc::clone(&notify));

        let mut written = 0;
        while written < buf.len() {
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.readers == 0 {
                    return Err(io::Error::from(io::ErrorKind::BrokenPipe));
                }
                let room = PIPE_CAPACITY - state.data.len();
                if room > 0 {
                    let n = room.min(buf.len() - written);
                    state.data.extend(&buf[written..written + n]);
                    written += n;
                    self.shared.waiter.notify_all();
                    continue;
                }
            }

            if intr.is_cancelled() {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }

            notify.wait();
        }

        Ok(written)
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.state.lock().unwrap().writers -= 1;
        self.shared.waiter.notify_all();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}
