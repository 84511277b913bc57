//! Signal syscalls: rt_sigaction, rt_sigprocmask

use crate::abi::{self, KSigAction};

use super::{SysArgs, SyscallContext, SyscallTable};

pub(super) fn register(table: &mut SyscallTable) {
    table.set(174, sys_rt_sigaction);
    table.set(175, sys_rt_sigprocmask);
}

fn sys_rt_sigaction(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (signo, action_addr) = (args.args.r0, args.args.r1);

    let act: KSigAction = match ctx.task.copy_in(action_addr) {
        Ok(a) => a,
        Err(err) => {
            log::error!("rt_sigaction: copying sigaction: {}", err);
            return -abi::EFAULT;
        }
    };

    ctx.task
        .add_signal_handler(ctx.vm, signo, act.handler as i64);

    0
}

/// Signal masking is not modeled; pretend success so guests proceed.
fn sys_rt_sigprocmask(_ctx: &mut SyscallContext<'_>, _args: SysArgs) -> i32 {
    0
}
