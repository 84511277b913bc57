//! Filesystem syscalls: open, stat64, lstat64, getdents64, readlink

use crate::abi::{self, Abi, DirentHeader, Stat64};
use crate::fs::{Dirent, FsError, Inode, InodeType, ReadDirEmit};
use crate::kernel::{File, Task};

use super::{SysArgs, SyscallContext, SyscallTable};

pub(super) fn register(table: &mut SyscallTable) {
    table.set(5, sys_open);
    table.set(85, sys_readlink);
    table.set(195, sys_stat64);
    table.set(196, sys_lstat64);
    table.set(220, sys_getdents64);
}

/// Absolutize a guest path against the task's working directory.
fn absolute(task: &Task, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        let cwd = task.curwd();
        if cwd == "/" {
            format!("/{}", path)
        } else {
            format!("{}/{}", cwd, path)
        }
    }
}

fn sys_open(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (ptr, mode) = (args.args.r0, args.args.r1);

    let path = match ctx.task.read_cstring(ptr) {
        Ok(p) => p,
        Err(err) => {
            log::error!("open: reading path: {}", err);
            return -1;
        }
    };
    let path = String::from_utf8_lossy(&path).into_owned();

    log::trace!("open path={} mode={:#x}", path, mode);

    let dirent = match ctx.task.mount().lookup_path(&absolute(ctx.task, &path)) {
        Ok(d) => d,
        Err(FsError::UnknownPath) => return -abi::ENOENT,
        Err(err) => {
            log::error!("open: resolving {}: {}", path, err);
            return -abi::ENOSYS;
        }
    };

    let file = match File::open_dirent(dirent) {
        Ok(f) => f,
        Err(err) => {
            log::error!("open: {}: {}", path, err);
            return -abi::ENOSYS;
        }
    };

    ctx.task.alloc_fd(file)
}

fn sys_stat64(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    stat(ctx, args, true)
}

fn sys_lstat64(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    stat(ctx, args, false)
}

/// Mode type bits for an inode kind.
fn type_mode(typ: InodeType) -> u32 {
    match typ {
        InodeType::RegularFile | InodeType::SpecialFile => abi::MODE_REGULAR,
        InodeType::Symlink => abi::MODE_SYMLINK,
        InodeType::Directory | InodeType::SpecialDirectory => abi::MODE_DIRECTORY,
        InodeType::Pipe => abi::MODE_NAMED_PIPE,
        InodeType::CharacterDevice => abi::MODE_CHARACTER_DEVICE,
        InodeType::BlockDevice => abi::MODE_BLOCK_DEVICE,
        InodeType::Socket => abi::MODE_SOCKET,
        InodeType::Anonymous => 0,
    }
}

fn stat(ctx: &mut SyscallContext<'_>, args: SysArgs, resolve: bool) -> i32 {
    let (ptr, buf) = (args.args.r0, args.args.r1);

    let path = match ctx.task.read_cstring(ptr) {
        Ok(p) => p,
        Err(err) => {
            log::error!("stat: reading path: {}", err);
            return -abi::ENOSYS;
        }
    };
    let abs = absolute(ctx.task, &String::from_utf8_lossy(&path));

    log::trace!("stat path={} resolve={}", abs, resolve);

    let lookup = if resolve {
        ctx.task.mount().lookup_path(&abs)
    } else {
        ctx.task.mount().lookup_dirent(&abs)
    };
    let dirent = match lookup {
        Ok(d) => d,
        Err(FsError::UnknownPath) => return -abi::ENOENT,
        Err(err) => {
            log::error!("stat: resolving {}: {}", abs, err);
            return -abi::ENOSYS;
        }
    };

    let inode = &dirent.inode;
    let us = match inode.ops.unstable_attr(inode) {
        Ok(us) => us,
        Err(err) => {
            log::error!("stat: unstable attrs for {}: {}", abs, err);
            return -abi::ENOSYS;
        }
    };

    let stable = &inode.stable_attr;
    let st = Stat64 {
        dev: make_device_id(stable.device_file_major, stable.device_file_minor),
        ino: stable.inode_id,
        mode: type_mode(stable.typ) | us.perms,
        uid: us.user_id,
        gid: us.group_id,
        size: us.size,
        blksize: stable.block_size,
        blocks: us.size / 512,
        atime: us.access_time,
        mtime: us.modification_time,
        ctime: us.status_change_time,
    };

    match ctx.task.copy_out(buf, &st) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("stat: copying out: {}", err);
            -abi::EINVAL
        }
    }
}

fn make_device_id(major: u16, minor: u32) -> u64 {
    ((major as u64) << 32) | minor as u64
}

fn dirent_type(typ: InodeType) -> u8 {
    match typ {
        InodeType::Symlink => abi::DT_LNK,
        InodeType::BlockDevice => abi::DT_BLK,
        InodeType::CharacterDevice => abi::DT_CHR,
        InodeType::Directory | InodeType::SpecialDirectory => abi::DT_DIR,
        InodeType::RegularFile | InodeType::SpecialFile => abi::DT_REG,
        _ => 0,
    }
}

/// Streams dirent64 records into the guest buffer until it fills.
struct DirentEmitter<'a> {
    offset: u64,
    addr: i32,
    left: i32,
    task: &'a Task,
}

impl DirentEmitter<'_> {
    /// reclen rounds the record up and always leaves at least one NUL
    /// after the name.
    fn reclen(name_len: usize) -> u16 {
        let a = DirentHeader::SIZE + name_len;
        ((a + 4) & !3) as u16
    }
}

impl ReadDirEmit for DirentEmitter<'_> {
    fn emit_entry(&mut self, name: &str, inode: &Inode) -> bool {
        let reclen = Self::reclen(name.len());
        if reclen as i32 > self.left {
            return false;
        }

        let hdr = DirentHeader {
            ino: inode.stable_attr.inode_id,
            off: self.offset,
            reclen,
            typ: dirent_type(inode.stable_attr.typ),
        };
        if self.task.copy_out(self.addr, &hdr).is_err() {
            return false;
        }
        self.addr += DirentHeader::SIZE as i32;
        self.left -= DirentHeader::SIZE as i32;

        let mut padded = name.as_bytes().to_vec();
        padded.resize(reclen as usize - DirentHeader::SIZE, 0);
        if self.task.write_at(self.addr, &padded).is_err() {
            return false;
        }
        self.addr += padded.len() as i32;
        self.left -= padded.len() as i32;

        self.offset += 1;
        true
    }
}

fn sys_getdents64(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (fd, ptr, size) = (args.args.r0, args.args.r1, args.args.r2);

    let Some(file) = ctx.task.get_file(fd) else {
        return -abi::EINVAL;
    };
    let Some(dirent) = file.dirent().cloned() else {
        return -abi::EINVAL;
    };
    let Some(offset) = file.with_dir_context(|dc| dc.offset) else {
        return -abi::EINVAL;
    };

    let mut emitter = DirentEmitter {
        offset: offset as u64,
        addr: ptr,
        left: size,
        task: ctx.task,
    };

    let inode = &dirent.inode;
    if let Err(err) = inode.ops.read_dir(inode, offset, &mut emitter) {
        log::error!("getdents64: {}", err);
        return -abi::ENOSYS;
    }

    let new_offset = emitter.offset as usize;
    let left = emitter.left;
    file.with_dir_context(|dc| dc.offset = new_offset);

    size - left
}

fn sys_readlink(ctx: &mut SyscallContext<'_>, args: SysArgs) -> i32 {
    let (addr, ptr, size) = (args.args.r0, args.args.r1, args.args.r2);

    let path = match ctx.task.read_cstring(addr) {
        Ok(p) => p,
        Err(_) => return -abi::EFAULT,
    };
    let abs = absolute(ctx.task, &String::from_utf8_lossy(&path));

    let dirent: std::sync::Arc<Dirent> = match ctx.task.mount().lookup_dirent(&abs) {
        Ok(d) => d,
        Err(FsError::UnknownPath) => return -abi::ENOENT,
        Err(err) => {
            log::error!("readlink: resolving {}: {}", abs, err);
            return -abi::ENOSYS;
        }
    };

    let mut target = match dirent.inode.ops.read_link(&dirent.inode) {
        Ok(t) => t,
        Err(err) => {
            log::error!("readlink: {}: {}", abs, err);
            return -abi::ENOSYS;
        }
    };

    if target.len() > size as usize {
        target.truncate(size as usize);
    }

    match ctx.task.write_at(ptr, target.as_bytes()) {
        Ok(()) => target.len() as i32,
        Err(err) => {
            log::error!("readlink: copying out: {}", err);
            -abi::EFAULT
        }
    }
}
