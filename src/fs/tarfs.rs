//! Tar-backed read-only filesystem
//!
//! Builds an inode tree from a tar image at mount time. File bodies
//! are held in memory and shared between opens; symlink targets come
//! from the tar link name. Missing intermediate directories are
//! created on the fly, the way archivers that omit directory entries
//! expect.

use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::abi::Timespec;

use super::{
    FsError, Inode, InodeOps, InodeStableAttr, InodeType, InodeUnstableAttr, ReadDirEmit,
};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// A mounted tar image.
pub struct TarFs {
    root: Arc<Inode>,
}

struct Dir {
    unstable: RwLock<InodeUnstableAttr>,
    children: RwLock<HashMap<String, Arc<Inode>>>,
    /// Insertion order, which readdir walks.
    order: RwLock<Vec<String>>,
}

impl Dir {
    fn new(unstable: InodeUnstableAttr) -> Self {
        Self {
            unstable: RwLock::new(unstable),
            children: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    fn add_child(&self, name: &str, inode: Arc<Inode>) {
        let mut children = self.children.write().unwrap();
        if children.insert(name.to_string(), inode).is_none() {
            self.order.write().unwrap().push(name.to_string());
        }
    }
}

impl InodeOps for Dir {
    fn lookup_child(&self, _inode: &Inode, name: &str) -> Result<Arc<Inode>, FsError> {
        self.children
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(FsError::UnknownPath)
    }

    fn unstable_attr(&self, _inode: &Inode) -> Result<InodeUnstableAttr, FsError> {
        Ok(*self.unstable.read().unwrap())
    }

    fn read_dir(
        &self,
        _inode: &Inode,
        offset: usize,
        emit: &mut dyn ReadDirEmit,
    ) -> Result<(), FsError> {
        let order = self.order.read().unwrap();
        let children = self.children.read().unwrap();
        for name in order.iter().skip(offset) {
            let child = &children[name];
            if !emit.emit_entry(name, child) {
                break;
            }
        }
        Ok(())
    }
}

struct File {
    unstable: InodeUnstableAttr,
    body: Arc<[u8]>,
}

impl InodeOps for File {
    fn unstable_attr(&self, _inode: &Inode) -> Result<InodeUnstableAttr, FsError> {
        Ok(self.unstable)
    }

    fn read_link(&self, inode: &Inode) -> Result<String, FsError> {
        if inode.stable_attr.typ != InodeType::Symlink {
            return Err(FsError::NotSymlink);
        }
        Ok(String::from_utf8_lossy(&self.body).into_owned())
    }

    fn reader(&self, _inode: &Inode) -> Result<Box<dyn Read + Send>, FsError> {
        Ok(Box::new(Cursor::new(Arc::clone(&self.body))))
    }
}

/// Construction-time view of the tree: typed handles to every
/// directory, keyed by slash path ("" is the root).
struct TreeBuilder {
    device_id: u64,
    next_ino: u64,
    dirs: HashMap<String, Arc<Dir>>,
}

impl TreeBuilder {
    fn stable(&mut self, typ: InodeType) -> InodeStableAttr {
        let ino = self.next_ino;
        self.next_ino += 1;
        InodeStableAttr {
            typ,
            device_id: self.device_id,
            inode_id: ino,
            block_size: 4096,
            device_file_major: 0,
            device_file_minor: 0,
        }
    }

    /// Directory handle for `path`, creating intermediate directories
    /// as needed.
    fn dir_for(&mut self, path: &str) -> io::Result<Arc<Dir>> {
        if let Some(dir) = self.dirs.get(path) {
            return Ok(Arc::clone(dir));
        }

        let (parent_path, name) = split_path(path);
        let parent = self.dir_for(parent_path)?;

        if parent.children.read().unwrap().contains_key(name) {
            // The name exists but is not a known directory.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tar member parent {} is not a directory", path),
            ));
        }

        let ops = Arc::new(Dir::new(InodeUnstableAttr {
            perms: 0o755,
            ..Default::default()
        }));
        let inode = Arc::new(Inode::new(
            self.stable(InodeType::Directory),
            Arc::clone(&ops) as Arc<dyn InodeOps>,
        ));
        parent.add_child(name, inode);
        self.dirs.insert(path.to_string(), Arc::clone(&ops));
        Ok(ops)
    }
}

impl TarFs {
    pub fn new<R: Read>(reader: R) -> io::Result<TarFs> {
        let mut builder = TreeBuilder {
            device_id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            next_ino: 1,
            dirs: HashMap::new(),
        };

        let root_ops = Arc::new(Dir::new(InodeUnstableAttr {
            perms: 0o755,
            ..Default::default()
        }));
        let root = Arc::new(Inode::new(
            builder.stable(InodeType::Directory),
            Arc::clone(&root_ops) as Arc<dyn InodeOps>,
        ));
        builder.dirs.insert(String::new(), Arc::clone(&root_ops));

        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let header = entry.header();

            let kind = match header.entry_type() {
                tar::EntryType::Regular | tar::EntryType::Continuous => InodeType::RegularFile,
                tar::EntryType::Directory => InodeType::Directory,
                tar::EntryType::Symlink => InodeType::Symlink,
                tar::EntryType::Char => InodeType::CharacterDevice,
                tar::EntryType::Block => InodeType::BlockDevice,
                tar::EntryType::Fifo => InodeType::Pipe,
                _ => continue,
            };

            let mtime = Timespec {
                sec: header.mtime().unwrap_or(0) as i64,
                nsec: 0,
            };
            let mut unstable = InodeUnstableAttr {
                size: header.size().unwrap_or(0) as i64,
                perms: (header.mode().unwrap_or(0) & 0o7777) as u32,
                user_id: header.uid().unwrap_or(0) as u32,
                group_id: header.gid().unwrap_or(0) as u32,
                access_time: mtime,
                modification_time: mtime,
                status_change_time: mtime,
                links: 1,
                ..Default::default()
            };

            let name = normalize_name(&entry.path_bytes());
            if name.is_empty() {
                // The archive's own root entry carries the root attrs.
                *root_ops.unstable.write().unwrap() = unstable;
                continue;
            }

            if kind == InodeType::Directory {
                let dir = builder.dir_for(&name)?;
                *dir.unstable.write().unwrap() = unstable;
                continue;
            }

            let body: Arc<[u8]> = if kind == InodeType::Symlink {
                let target = entry
                    .link_name_bytes()
                    .map(|b| b.into_owned())
                    .unwrap_or_default();
                unstable.size = target.len() as i64;
                target.into()
            } else {
                let mut body = Vec::with_capacity(unstable.size as usize);
                entry.read_to_end(&mut body)?;
                body.into()
            };

            let inode = Arc::new(Inode::new(
                builder.stable(kind),
                Arc::new(File { unstable, body }) as Arc<dyn InodeOps>,
            ));

            let (dir_path, base) = split_path(&name);
            let parent = builder.dir_for(dir_path)?;
            parent.add_child(base, inode);
        }

        Ok(TarFs { root })
    }

    pub fn root(&self) -> Arc<Inode> {
        Arc::clone(&self.root)
    }
}

/// Strip "./" and surrounding slashes from an archive member name.
fn normalize_name(raw: &[u8]) -> String {
    let mut name = String::from_utf8_lossy(raw).into_owned();
    if let Some(stripped) = name.strip_prefix("./") {
        name = stripped.to_string();
    }
    name.trim_matches('/').to_string()
}

fn split_path(name: &str) -> (&str, &str) {
    match name.rfind('/') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => ("", name),
    }
}
