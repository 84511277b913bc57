//! Process syscalls: fork, execve, wait4, exit_group

use std::sync::Arc;
use std::thread;

use crate::abi;
use crate::exec::HostCtx;
use crate::fs::FsError;
use crate::kernel::{KernelError, Task, TaskContext, WaitError};

use super::{SysArgs, SyscallContext, SyscallTable};

pub(super) fn register(table: &mut SyscallTable) {
    table.set(1, sys_exit_group);
    table.set(2, sys_fork);
    table.set(11, sys_execve);
    table.set(114, sys_wait4);
    table.set(252, sys_exit_group);
}

fn sys_fork(ctx: &mut SyscallContext<'_>, _args: SysArgs) -> i32 {
    let (child, mut child_vm) = ctx.kernel.fork_process(ctx.task, ctx.vm);
    let pid = child.pid;
    let kernel = Arc::clone(ctx.kernel);

    // The child picks up exactly where the parent is: inside this
    // syscall. restart(0) resumes it as if fork had returned 0.
    thread::spawn(move || {
        let tc = TaskContext {
            kernel,
            task: Task::new(child),
        };
        let hctx = HostCtx::new(&tc);
        if let Err(err) = child_vm.restart(&hctx, &[0]) {
            log::error!("child pid={} failed: {}", child_vm.pid, err);
        }
    });

    pid
}

/// Walk a NUL-terminated array of string pointers out of guest memory.
fn copy_string_array(task: &Task, addr: i32) -> Result<Vec<String>, crate::memory::MemoryError> {
    let mut out = Vec::new();
    let mut ptr = addr;
    loop {
        let str_addr: i32 = task.copy_in(ptr)?;
        if str_addr == 0 {
            break;
        }
        let bytes = task.read_cstring(str_addr)?;
        out.push(String::from_utf8_lossy(&bytes).into_owned());
        ptr += 4;
    }
    Ok(out)
}

fn sys_execve(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (path_addr, argv_addr, envp_addr) = (args.args.r0, args.args.r1, args.args.r2);

    let path = match ctx.task.read_cstring(path_addr) {
        Ok(p) => String::from_utf8_lossy(&p).into_owned(),
        Err(err) => {
            log::error!("execve: reading path: {}", err);
            return -abi::ENOSYS;
        }
    };

    let argv = match copy_string_array(ctx.task, argv_addr) {
        Ok(v) => v,
        Err(err) => {
            log::error!("execve: copying argv: {}", err);
            return -abi::ENOSYS;
        }
    };
    let envp = match copy_string_array(ctx.task, envp_addr) {
        Ok(v) => v,
        Err(err) => {
            log::error!("execve: copying envp: {}", err);
            return -abi::ENOSYS;
        }
    };

    log::trace!("execve pid={} path={}", ctx.task.pid, path);

    // Builds the replacement VM and aborts the one executing this very
    // syscall; our loop exits at its next abort check.
    let new_vm = match ctx.kernel.setup_process(&ctx.task.process, &path, &argv, &envp) {
        Ok(vm) => vm,
        Err(KernelError::Fs(FsError::UnknownPath)) => return -abi::ENOENT,
        Err(err) => {
            log::error!("execve: unable to exec {}: {}", path, err);
            return -abi::ENOEXEC;
        }
    };

    let kernel = Arc::clone(ctx.kernel);
    let proc = Arc::clone(&ctx.task.process);
    thread::spawn(move || {
        let mut vm = new_vm;
        if let Err(err) = kernel.start_process(&proc, &mut vm) {
            log::error!("exec'd pid={} failed: {}", proc.pid, err);
        }
    });

    0
}

fn sys_wait4(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (pid, stat_addr, flags) = (args.args.r0, args.args.r1, args.args.r2);

    match pid {
        -1 => {
            let block = flags & abi::WNOHANG == 0;
            match ctx.task.wait_any_child(ctx.intr, block) {
                Ok((0, _)) => {
                    log::trace!("wait4-no-child pid={}", ctx.task.pid);
                    -abi::ECHILD
                }
                Ok((child_pid, status)) => {
                    let _ = ctx.task.copy_out(stat_addr, &status.status());
                    // The child is reaped; release its pid.
                    ctx.kernel.processes().remove(child_pid);
                    log::trace!(
                        "wait4-found-child pid={} status={}",
                        child_pid,
                        status.code
                    );
                    child_pid
                }
                Err(WaitError::Interrupted) => -abi::EINTR,
            }
        }
        _ => {
            log::debug!("wait4: pid selector {} not supported", pid);
            -abi::ENOSYS
        }
    }
}

fn sys_exit_group(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    ctx.task.exit(args.args.r0);
    0
}
