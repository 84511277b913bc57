//! Linux ABI surface shared with the guest
//!
//! Everything a 32-bit Linux guest sees crosses this module: errno
//! values, signal numbers, file mode bits, and the fixed little-endian
//! struct layouts copied in and out of linear memory.
//!
//! All multi-byte integers are little-endian and structs are packed in
//! declaration order with no padding, matching what musl-built guests
//! expect from the kernel side of the ABI.

/// Guest-visible error numbers. Syscalls return `-errno` on failure.
pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const ECHILD: i32 = 10;
pub const EFAULT: i32 = 14;
pub const EINVAL: i32 = 22;
pub const ENOSYS: i32 = 38;
pub const ENOEXEC: i32 = 8;

/// Signal numbers (32-bit Linux numbering).
pub const SIGINT: i32 = 2;
pub const SIGKILL: i32 = 9;
pub const SIGTERM: i32 = 15;
pub const SIGCHLD: i32 = 17;

/// File mode type bits, as found in `stat.st_mode` (high bits).
pub const MODE_REGULAR: u32 = 0o100000;
pub const MODE_DIRECTORY: u32 = 0o040000;
pub const MODE_SYMLINK: u32 = 0o120000;
pub const MODE_NAMED_PIPE: u32 = 0o010000;
pub const MODE_CHARACTER_DEVICE: u32 = 0o020000;
pub const MODE_BLOCK_DEVICE: u32 = 0o060000;
pub const MODE_SOCKET: u32 = 0o140000;

/// `mmap` flag bits the emulator understands.
pub const MAP_PRIVATE: i32 = 0x02;
pub const MAP_SHARED: i32 = 0x01;
pub const MAP_FIXED: i32 = 0x10;
pub const MAP_ANONYMOUS: i32 = 0x20;

/// `wait4` option bits.
pub const WNOHANG: i32 = 1;

/// The TIOCGWINSZ ioctl request number.
pub const TIOCGWINSZ: i32 = 0x5413;

/// Fixed-layout serialization to and from guest memory.
///
/// Implementors define the exact on-wire size and the little-endian
/// field order. This is the moral equivalent of writing the struct
/// through `binary.Write` on the original kernel side: field by field,
/// no padding.
pub trait Abi: Sized {
    /// Serialized size in bytes.
    const SIZE: usize;

    /// Write the value into `buf` (`buf.len() == SIZE`).
    fn encode(&self, buf: &mut [u8]);

    /// Read a value out of `buf` (`buf.len() == SIZE`).
    fn decode(buf: &[u8]) -> Self;
}

impl Abi for i32 {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
}

impl Abi for u32 {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
}

/// A kernel timespec: seconds plus nanoseconds, 12 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i32,
}

impl Abi for Timespec {
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.sec.to_le_bytes());
        buf[8..12].copy_from_slice(&self.nsec.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            sec: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            nsec: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// The stat64 structure handed back by stat64/lstat64 (88 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat64 {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl Abi for Stat64 {
    const SIZE: usize = 88;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.dev.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ino.to_le_bytes());
        buf[16..20].copy_from_slice(&self.mode.to_le_bytes());
        buf[20..24].copy_from_slice(&self.uid.to_le_bytes());
        buf[24..28].copy_from_slice(&self.gid.to_le_bytes());
        buf[28..36].copy_from_slice(&self.size.to_le_bytes());
        buf[36..44].copy_from_slice(&self.blksize.to_le_bytes());
        buf[44..52].copy_from_slice(&self.blocks.to_le_bytes());
        self.atime.encode(&mut buf[52..64]);
        self.mtime.encode(&mut buf[64..76]);
        self.ctime.encode(&mut buf[76..88]);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            dev: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            ino: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            mode: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            uid: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            gid: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            size: i64::from_le_bytes(buf[28..36].try_into().unwrap()),
            blksize: i64::from_le_bytes(buf[36..44].try_into().unwrap()),
            blocks: i64::from_le_bytes(buf[44..52].try_into().unwrap()),
            atime: Timespec::decode(&buf[52..64]),
            mtime: Timespec::decode(&buf[64..76]),
            ctime: Timespec::decode(&buf[76..88]),
        }
    }
}

/// Header of a dirent64 record; a NUL-terminated, 4-byte padded name
/// follows it in the guest buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirentHeader {
    pub ino: u64,
    pub off: u64,
    pub reclen: u16,
    pub typ: u8,
}

impl Abi for DirentHeader {
    const SIZE: usize = 19;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.ino.to_le_bytes());
        buf[8..16].copy_from_slice(&self.off.to_le_bytes());
        buf[16..18].copy_from_slice(&self.reclen.to_le_bytes());
        buf[18] = self.typ;
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            ino: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            off: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            reclen: u16::from_le_bytes([buf[16], buf[17]]),
            typ: buf[18],
        }
    }
}

/// dirent64 `d_type` values.
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;

/// Guest-side sigaction as passed to rt_sigaction. The handler is an
/// index into the module's function table, not a code address.
#[derive(Debug, Clone, Copy, Default)]
pub struct KSigAction {
    pub handler: i32,
    pub flags: i32,
}

impl Abi for KSigAction {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.handler.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            handler: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            flags: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

/// Terminal window size returned by ioctl(TIOCGWINSZ).
#[derive(Debug, Clone, Copy, Default)]
pub struct Winsize {
    pub row: u16,
    pub col: u16,
    pub xpixel: u16,
    pub ypixel: u16,
}

impl Abi for Winsize {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.row.to_le_bytes());
        buf[2..4].copy_from_slice(&self.col.to_le_bytes());
        buf[4..6].copy_from_slice(&self.xpixel.to_le_bytes());
        buf[6..8].copy_from_slice(&self.ypixel.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            row: u16::from_le_bytes([buf[0], buf[1]]),
            col: u16::from_le_bytes([buf[2], buf[3]]),
            xpixel: u16::from_le_bytes([buf[4], buf[5]]),
            ypixel: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}

/// The two descriptors written back by the pipe syscall.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeFds {
    pub read: i32,
    pub write: i32,
}

impl Abi for PipeFds {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.read.to_le_bytes());
        buf[4..8].copy_from_slice(&self.write.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            read: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            write: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

/// One iovec entry as used by writev: pointer plus length.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoVec {
    pub base: u32,
    pub len: u32,
}

impl Abi for IoVec {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.base.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            base: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            len: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}
