//! Syscall dispatch
//!
//! A fixed 1024-slot table maps 32-bit Linux syscall numbers to
//! handlers. The invoker wires each call up with a fresh interrupt
//! token (installed as the task's interrupt hook), runs the handler,
//! and checks for pending signals before the guest resumes, so a
//! signal queued during the call is injected with the syscall's return
//! value as its continuation.
//!
//! Handlers return a signed 32-bit value; negative magnitudes are
//! Linux errno codes. A missing slot returns -1.

mod clock;
mod fs;
mod io;
mod mmap;
mod proc;
mod signal;
mod user;

use std::sync::Arc;

use crate::abi::Abi;
use crate::exec::Vm;
use crate::kernel::{InterruptToken, Kernel, Task};

/// The six integer registers plus one spare, as packed by the variadic
/// `__syscall(idx, reqPtr)` entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallRequest {
    pub r0: i32,
    pub r1: i32,
    pub r2: i32,
    pub r3: i32,
    pub r4: i32,
    pub r5: i32,
    pub r6: i32,
}

impl SyscallRequest {
    /// Pack up to seven integer arguments, register-style.
    pub fn from_regs(regs: &[i32]) -> SyscallRequest {
        let mut req = SyscallRequest::default();
        let slots = [
            &mut req.r0,
            &mut req.r1,
            &mut req.r2,
            &mut req.r3,
            &mut req.r4,
            &mut req.r5,
            &mut req.r6,
        ];
        for (slot, v) in slots.into_iter().zip(regs) {
            *slot = *v;
        }
        req
    }
}

impl Abi for SyscallRequest {
    const SIZE: usize = 28;

    fn encode(&self, buf: &mut [u8]) {
        for (i, v) in [
            self.r0, self.r1, self.r2, self.r3, self.r4, self.r5, self.r6,
        ]
        .into_iter()
        .enumerate()
        {
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    fn decode(buf: &[u8]) -> Self {
        let at = |i: usize| {
            i32::from_le_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]])
        };
        Self {
            r0: at(0),
            r1: at(1),
            r2: at(2),
            r3: at(3),
            r4: at(4),
            r5: at(5),
            r6: at(6),
        }
    }
}

/// One decoded syscall invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysArgs {
    pub index: i32,
    pub args: SyscallRequest,
}

/// Everything a handler can reach: the kernel, the calling task, the
/// running VM, and this call's interrupt token.
pub struct SyscallContext<'a> {
    pub kernel: &'a Arc<Kernel>,
    pub task: &'a Task,
    pub vm: &'a mut Vm,
    pub intr: &'a InterruptToken,
}

pub type SyscallFn = fn(&mut SyscallContext<'_>, SysArgs) -> i32;

const TABLE_SIZE: usize = 1024;

/// The numbered handler registry. Built explicitly; no global state.
pub struct SyscallTable {
    handlers: Box<[Option<SyscallFn>; TABLE_SIZE]>,
}

impl SyscallTable {
    /// An empty table.
    pub fn empty() -> Self {
        Self {
            handlers: Box::new([None; TABLE_SIZE]),
        }
    }

    /// The reference syscall surface.
    pub fn new() -> Self {
        let mut table = Self::empty();
        io::register(&mut table);
        fs::register(&mut table);
        proc::register(&mut table);
        signal::register(&mut table);
        mmap::register(&mut table);
        clock::register(&mut table);
        user::register(&mut table);
        table
    }

    pub fn set(&mut self, index: usize, f: SyscallFn) {
        self.handlers[index] = Some(f);
    }

    pub fn get(&self, index: i32) -> Option<SyscallFn> {
        if index < 0 {
            return None;
        }
        self.handlers.get(index as usize).copied().flatten()
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable name of a syscall number, for trace logs.
pub fn name(index: i32) -> &'static str {
    match index {
        1 => "exit",
        2 => "fork",
        3 => "read",
        4 => "write",
        5 => "open",
        6 => "close",
        11 => "execve",
        42 => "pipe",
        54 => "ioctl",
        63 => "dup2",
        85 => "readlink",
        114 => "wait4",
        146 => "writev",
        174 => "rt_sigaction",
        175 => "rt_sigprocmask",
        192 => "mmap",
        195 => "stat64",
        196 => "lstat64",
        199 => "getuid32",
        200 => "getgid32",
        214 => "setgid32",
        220 => "getdents64",
        252 => "exit_group",
        265 => "clock_gettime",
        _ => "unknown",
    }
}

/// Dispatches syscalls on behalf of the host-import shim. The kernel
/// reference travels with the task context rather than living here,
/// so the environment module can be built before the kernel exists.
pub struct Invoker {
    table: SyscallTable,
}

impl Invoker {
    pub fn new() -> Invoker {
        Invoker {
            table: SyscallTable::new(),
        }
    }

    pub fn with_table(table: SyscallTable) -> Invoker {
        Invoker { table }
    }

    /// Run one syscall: derive a cancellable interrupt token, install
    /// it as the task's interrupt hook, invoke the handler, then let
    /// any signal queued meanwhile take effect before the guest
    /// resumes.
    pub fn invoke(&self, kernel: &Arc<Kernel>, task: &Task, vm: &mut Vm, args: SysArgs) -> i32 {
        let Some(handler) = self.table.get(args.index) else {
            return -1;
        };

        let intr = InterruptToken::new();
        task.process.set_interrupt(intr.clone());

        let ret = {
            let mut ctx = SyscallContext {
                kernel,
                task,
                vm: &mut *vm,
                intr: &intr,
            };
            handler(&mut ctx, args)
        };

        task.check_interrupt(vm, ret as i64);

        ret
    }
}

impl Default for Invoker {
    fn default() -> Self {
        Self::new()
    }
}
