//! The kernel: processes, files, signals, and process setup
//!
//! Core abstractions:
//! - Process: unit of isolation; owns fds, memory, and signal state
//! - Task: the running side of a process, handed to syscall handlers
//! - ProcessGroup: wait/reap semantics for a process and its children
//! - Kernel: process table, module cache, and the environment module
//!
//! One host thread runs one guest process. Fork and exec spawn new
//! threads that re-enter the interpreter; exit and signal delivery are
//! the only cross-thread signals into a running VM.

pub mod file;
mod init;
pub mod pipe;
pub mod process;
pub mod process_group;
pub mod signals;
pub mod waiter;

pub use file::{DirContext, File, FileReader, FileWriter};
pub use process::{ExitStatus, Process, ProcessError, ProcessManager, ProcessStatus, Task};
pub use process_group::{ProcessGroup, WaitError};
pub use signals::Signals;
pub use waiter::{InterruptToken, Notify, Waiter};

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::exec::ExecError;
use crate::fs::FsError;
use crate::loader::{LoadError, ModuleCache, ModuleDecoder};
use crate::memory::MemoryError;
use crate::wasm::Module;

/// Errors raised while bringing a process up.
#[derive(Debug)]
pub enum KernelError {
    /// The program exports no `_start`.
    NoStart,
    /// The program exports no usable `__heap_base` global.
    NoHeapBase,
    Fs(FsError),
    Io(io::Error),
    Load(LoadError),
    Exec(ExecError),
    Memory(MemoryError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStart => write!(f, "no _start function defined"),
            Self::NoHeapBase => write!(f, "no __heap_base"),
            Self::Fs(e) => write!(f, "filesystem: {}", e),
            Self::Io(e) => write!(f, "i/o: {}", e),
            Self::Load(e) => write!(f, "load: {}", e),
            Self::Exec(e) => write!(f, "exec: {}", e),
            Self::Memory(e) => write!(f, "memory: {}", e),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<FsError> for KernelError {
    fn from(e: FsError) -> Self {
        Self::Fs(e)
    }
}

impl From<io::Error> for KernelError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<LoadError> for KernelError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

impl From<ExecError> for KernelError {
    fn from(e: ExecError) -> Self {
        Self::Exec(e)
    }
}

impl From<MemoryError> for KernelError {
    fn from(e: MemoryError) -> Self {
        Self::Memory(e)
    }
}

/// Global kernel state: the process table, the module cache, and the
/// host-import (environment) module guests link against.
pub struct Kernel {
    env: Module,
    processes: ProcessManager,
    loader_cache: Arc<ModuleCache>,
    decoder: Box<dyn ModuleDecoder + Send + Sync>,
}

impl Kernel {
    pub fn new(env: Module, decoder: Box<dyn ModuleDecoder + Send + Sync>) -> Arc<Kernel> {
        Arc::new(Kernel {
            env,
            processes: ProcessManager::new(),
            loader_cache: Arc::new(ModuleCache::default()),
            decoder,
        })
    }

    pub fn env_module(&self) -> &Module {
        &self.env
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    pub fn module_cache(&self) -> &Arc<ModuleCache> {
        &self.loader_cache
    }
}

/// The ambient per-task data host functions downcast out of the
/// execution context.
pub struct TaskContext {
    pub kernel: Arc<Kernel>,
    pub task: Task,
}

/// A cloneable in-memory byte sink, handy as captured stdout/stderr.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().unwrap().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
