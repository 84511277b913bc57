//! Memory mapping

use crate::abi;

use super::{SysArgs, SyscallContext, SyscallTable};

pub(super) fn register(table: &mut SyscallTable) {
    table.set(192, sys_mmap);
}

fn sys_mmap(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let mut ptr = args.args.r0;
    let size = args.args.r1;
    let flags = args.args.r3;

    let private = flags & abi::MAP_PRIVATE != 0;
    let shared = flags & abi::MAP_SHARED != 0;
    let anon = flags & abi::MAP_ANONYMOUS != 0;

    // Exactly one of MAP_PRIVATE and MAP_SHARED.
    if private == shared {
        return -abi::EINVAL;
    }

    if anon {
        ptr = -1;
    }

    let memory = ctx.task.memory();
    let mut mem = memory.lock().unwrap();
    match mem.new_region(ptr, size) {
        Ok(region) => {
            log::trace!("mmap: new region addr={:#x} size={:#x}", region.start, region.size);
            region.start
        }
        Err(err) => {
            log::debug!("mmap: {}", err);
            -abi::EINVAL
        }
    }
}
