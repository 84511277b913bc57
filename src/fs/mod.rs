//! Filesystem façade
//!
//! The execution core consumes exactly three contracts: path resolution
//! through [`namespace::MountNamespace`], metadata and content through
//! [`InodeOps`], and directory walking through [`ReadDirEmit`].
//! Filesystem implementations live behind these traits; a tar-backed
//! read-only one ships in [`tarfs`].

pub mod namespace;
pub mod tarfs;

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use crate::abi::Timespec;

/// Filesystem errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    /// Path does not resolve.
    UnknownPath,
    /// ReadLink on something that is not a symlink.
    NotSymlink,
    /// Path component is not a directory.
    NotDirectory,
    /// The inode does not support this operation.
    NotImplemented,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPath => write!(f, "unknown path"),
            Self::NotSymlink => write!(f, "not symlink"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::NotImplemented => write!(f, "not implemented"),
        }
    }
}

impl std::error::Error for FsError {}

/// What an inode is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    RegularFile,
    /// A file that doesn't support SeekEnd, proc-style.
    SpecialFile,
    Directory,
    SpecialDirectory,
    Symlink,
    Pipe,
    Socket,
    CharacterDevice,
    BlockDevice,
    /// None of the above; event fds and the like.
    Anonymous,
}

impl fmt::Display for InodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RegularFile | Self::SpecialFile => "file",
            Self::Directory | Self::SpecialDirectory => "directory",
            Self::Symlink => "symlink",
            Self::Pipe => "pipe",
            Self::Socket => "socket",
            Self::CharacterDevice => "character-device",
            Self::BlockDevice => "block-device",
            Self::Anonymous => "anonymous",
        };
        f.write_str(s)
    }
}

/// Inode attributes fixed for the inode's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct InodeStableAttr {
    pub typ: InodeType,
    /// Device this inode lives on.
    pub device_id: u64,
    /// Unique id on its device.
    pub inode_id: u64,
    pub block_size: i64,
    pub device_file_major: u16,
    pub device_file_minor: u32,
}

impl Default for InodeStableAttr {
    fn default() -> Self {
        Self {
            typ: InodeType::RegularFile,
            device_id: 0,
            inode_id: 0,
            block_size: 4096,
            device_file_major: 0,
            device_file_minor: 0,
        }
    }
}

/// Inode attributes that may change over its lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeUnstableAttr {
    pub size: i64,
    pub usage: i64,
    pub perms: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub access_time: Timespec,
    pub modification_time: Timespec,
    pub status_change_time: Timespec,
    pub links: u64,
}

/// Callback sink for ReadDir; return false to stop early.
pub trait ReadDirEmit {
    fn emit_entry(&mut self, name: &str, inode: &Inode) -> bool;
}

/// Operations a filesystem provides per inode. Defaults reject what a
/// given inode kind cannot do, so directories only implement lookup
/// and readdir, files only attrs, content, and links.
pub trait InodeOps: Send + Sync {
    fn lookup_child(&self, _inode: &Inode, _name: &str) -> Result<Arc<Inode>, FsError> {
        Err(FsError::NotImplemented)
    }

    fn unstable_attr(&self, inode: &Inode) -> Result<InodeUnstableAttr, FsError>;

    fn read_link(&self, _inode: &Inode) -> Result<String, FsError> {
        Err(FsError::NotSymlink)
    }

    fn reader(&self, _inode: &Inode) -> Result<Box<dyn Read + Send>, FsError> {
        Err(FsError::NotImplemented)
    }

    fn read_dir(
        &self,
        _inode: &Inode,
        _offset: usize,
        _emit: &mut dyn ReadDirEmit,
    ) -> Result<(), FsError> {
        Err(FsError::NotImplemented)
    }
}

/// An inode: stable attributes plus its filesystem's operations.
pub struct Inode {
    pub stable_attr: InodeStableAttr,
    pub ops: Arc<dyn InodeOps>,
}

impl Inode {
    pub fn new(stable_attr: InodeStableAttr, ops: Arc<dyn InodeOps>) -> Self {
        Self { stable_attr, ops }
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("stable_attr", &self.stable_attr)
            .finish()
    }
}

/// A resolved path component: a name bound to an inode, linked to its
/// parent directory.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub name: String,
    pub parent: Option<Arc<Dirent>>,
    pub inode: Arc<Inode>,
}

impl Dirent {
    pub fn root(inode: Arc<Inode>) -> Arc<Dirent> {
        Arc::new(Dirent {
            name: String::new(),
            parent: None,
            inode,
        })
    }

    /// Content reader for this entry.
    pub fn reader(&self) -> Result<Box<dyn Read + Send>, FsError> {
        self.inode.ops.reader(&self.inode)
    }
}
