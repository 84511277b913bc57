//! User and group identity
//!
//! Guests always run as root inside the emulator.

use super::{SysArgs, SyscallContext, SyscallTable};

pub(super) fn register(table: &mut SyscallTable) {
    table.set(199, sys_getuid32);
    table.set(200, sys_getgid32);
    table.set(214, sys_setgid32);
}

fn sys_getuid32(_ctx: &mut SyscallContext<'_>, _args: SysArgs) -> i32 {
    0
}

fn sys_getgid32(_ctx: &mut SyscallContext<'_>, _args: SysArgs) -> i32 {
    0
}

fn sys_setgid32(_ctx: &mut SyscallContext<'_>, _args: SysArgs) -> i32 {
    0
}
