//! Clocks

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::abi::{self, Timespec};

use super::{SysArgs, SyscallContext, SyscallTable};

/// Epoch for CLOCK_MONOTONIC readings.
static START: Lazy<Instant> = Lazy::new(Instant::now);

pub(super) fn register(table: &mut SyscallTable) {
    table.set(265, sys_clock_gettime);
}

fn sys_clock_gettime(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (clk, ptr) = (args.args.r0, args.args.r1);

    let ts = match clk {
        // CLOCK_REALTIME
        0 => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            Timespec {
                sec: now.as_secs() as i64,
                nsec: now.subsec_nanos() as i32,
            }
        }
        // CLOCK_MONOTONIC and CLOCK_MONOTONIC_COARSE
        1 | 6 => {
            let elapsed = START.elapsed();
            Timespec {
                sec: elapsed.as_secs() as i64,
                nsec: elapsed.subsec_nanos() as i32,
            }
        }
        _ => return -abi::EINVAL,
    };

    match ctx.task.copy_out(ptr, &ts) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}
