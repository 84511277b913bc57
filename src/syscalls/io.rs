//! Descriptor I/O: read, write, writev, pipe, dup2, close, ioctl

use std::io::ErrorKind;
use std::mem::MaybeUninit;

use crate::abi::{self, Abi, IoVec, PipeFds, Winsize};

use super::{SysArgs, SyscallContext, SyscallTable};

pub(super) fn register(table: &mut SyscallTable) {
    table.set(3, sys_read);
    table.set(4, sys_write);
    table.set(6, sys_close);
    table.set(42, sys_pipe);
    table.set(54, sys_ioctl);
    table.set(63, sys_dup2);
    table.set(146, sys_writev);
}

fn sys_close(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let fd = args.args.r0;

    match ctx.task.close_file(fd) {
        Ok(()) => 0,
        Err(_) => -abi::EINVAL,
    }
}

fn sys_write(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (fd, ptr, sz) = (args.args.r0, args.args.r1, args.args.r2);
    if sz < 0 {
        return -abi::EINVAL;
    }

    let Some(file) = ctx.task.get_file(fd) else {
        return -abi::EINVAL;
    };
    if !file.has_writer() {
        return -abi::EBADF;
    }

    let mut data = vec![0u8; sz as usize];
    if let Err(err) = ctx.task.read_at(ptr, &mut data) {
        log::error!("write: reading data from guest: {}", err);
        return -abi::EFAULT;
    }

    match file.write(&data, ctx.intr) {
        Ok(n) => n as i32,
        Err(err) if err.kind() == ErrorKind::Interrupted => -abi::EINTR,
        Err(err) => {
            log::error!("write: fd={} error: {}", fd, err);
            -abi::EFAULT
        }
    }
}

fn sys_writev(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (fd, iov, cnt) = (args.args.r0, args.args.r1, args.args.r2);

    let Some(file) = ctx.task.get_file(fd) else {
        return -abi::EINVAL;
    };
    if !file.has_writer() {
        return -abi::EBADF;
    }

    let mut ret = 0i32;
    for i in 0..cnt {
        let entry: IoVec = match ctx.task.copy_in(iov + i * IoVec::SIZE as i32) {
            Ok(v) => v,
            Err(_) => return -1,
        };

        let mut data = vec![0u8; entry.len as usize];
        if ctx.task.read_at(entry.base as i32, &mut data).is_err() {
            return -1;
        }
        ret += data.len() as i32;

        match file.write(&data, ctx.intr) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return -abi::EINTR,
            Err(err) => {
                log::error!("writev: fd={} error: {}", fd, err);
                return -abi::EFAULT;
            }
        }
    }

    ret
}

fn sys_read(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (fd, buf, sz) = (args.args.r0, args.args.r1, args.args.r2);
    if sz < 0 {
        return -abi::EINVAL;
    }

    let Some(file) = ctx.task.get_file(fd) else {
        return -abi::EINVAL;
    };
    if !file.has_reader() {
        return -abi::EBADF;
    }

    let mut tmp = vec![0u8; sz as usize];
    let n = match file.read(&mut tmp, ctx.intr) {
        Ok(n) => n,
        Err(err) if err.kind() == ErrorKind::Interrupted => return -abi::EINTR,
        Err(err) => {
            log::error!("read: fd={} error: {}", fd, err);
            return -abi::EIO;
        }
    };

    if let Err(err) = ctx.task.write_at(buf, &tmp[..n]) {
        log::error!("read: copying data out: {}", err);
        return -abi::EFAULT;
    }

    n as i32
}

fn sys_dup2(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (from, to) = (args.args.r0, args.args.r1);

    match ctx.task.dup2(from, to) {
        Ok(()) => 0,
        Err(_) => {
            log::error!("dup2: bad descriptor from={} to={}", from, to);
            -abi::EINVAL
        }
    }
}

fn sys_pipe(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let addr = args.args.r0;

    let (_, rfd, _, wfd) = ctx.task.create_pipe();

    let fds = PipeFds {
        read: rfd,
        write: wfd,
    };
    if let Err(err) = ctx.task.copy_out(addr, &fds) {
        log::error!("pipe: writing descriptor pair: {}", err);
        return -abi::ENOSYS;
    }

    0
}

fn sys_ioctl(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (fd, cmd, addr) = (args.args.r0, args.args.r1, args.args.r2);

    let Some(file) = ctx.task.get_file(fd) else {
        return -abi::EBADF;
    };

    match cmd {
        abi::TIOCGWINSZ => {
            let Some(host_fd) = file.host_fd() else {
                return -abi::EINVAL;
            };

            let mut ws = MaybeUninit::<libc::winsize>::zeroed();
            let rc = unsafe { libc::ioctl(host_fd, libc::TIOCGWINSZ, ws.as_mut_ptr()) };
            if rc != 0 {
                return -abi::EINVAL;
            }
            let ws = unsafe { ws.assume_init() };

            let out = Winsize {
                row: ws.ws_row,
                col: ws.ws_col,
                xpixel: ws.ws_xpixel,
                ypixel: ws.ws_ypixel,
            };
            match ctx.task.copy_out(addr, &out) {
                Ok(()) => 0,
                Err(err) => {
                    log::error!("ioctl: copying winsize out: {}", err);
                    -abi::ENOSYS
                }
            }
        }
        _ => -abi::EINVAL,
    }
}
