//! Path resolution
//!
//! A mount namespace walks paths from its root dirent, one component
//! at a time, caching full-path results. `lookup_path` follows
//! symlinks (targets resolved relative to the containing directory),
//! `lookup_dirent` does not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Dirent, FsError, Inode, InodeType};

/// Bound on the dirent cache.
const DIRENT_CACHE_CAP: usize = 1000;

/// Symlink chains longer than this resolve to UnknownPath.
const MAX_SYMLINK_DEPTH: usize = 40;

struct DirentCache {
    entries: HashMap<String, Arc<Dirent>>,
    /// Access order, most recent last.
    order: Vec<String>,
    cap: usize,
}

impl DirentCache {
    fn get(&mut self, key: &str) -> Option<Arc<Dirent>> {
        let hit = self.entries.get(key).cloned();
        if hit.is_some() {
            self.order.retain(|k| k != key);
            self.order.push(key.to_string());
        }
        hit
    }

    fn add(&mut self, key: String, dirent: Arc<Dirent>) {
        while self.entries.len() >= self.cap && !self.entries.contains_key(&key) {
            let Some(oldest) = self.order.first().cloned() else {
                break;
            };
            self.entries.remove(&oldest);
            self.order.remove(0);
        }
        self.order.retain(|k| k != &key);
        self.order.push(key.clone());
        self.entries.insert(key, dirent);
    }
}

/// One process's view of the filesystem.
pub struct MountNamespace {
    root: Arc<Dirent>,
    cache: Mutex<DirentCache>,
}

impl MountNamespace {
    pub fn new(root: Arc<Inode>) -> Self {
        Self {
            root: Dirent::root(root),
            cache: Mutex::new(DirentCache {
                entries: HashMap::new(),
                order: Vec::new(),
                cap: DIRENT_CACHE_CAP,
            }),
        }
    }

    pub fn root(&self) -> &Arc<Dirent> {
        &self.root
    }

    /// Resolve a path, following symlinks.
    pub fn lookup_path(&self, path: &str) -> Result<Arc<Dirent>, FsError> {
        self.lookup_path_depth(path, 0)
    }

    fn lookup_path_depth(&self, path: &str, depth: usize) -> Result<Arc<Dirent>, FsError> {
        if depth > MAX_SYMLINK_DEPTH {
            return Err(FsError::UnknownPath);
        }

        let dirent = self.lookup_dirent(path)?;
        if dirent.inode.stable_attr.typ != InodeType::Symlink {
            return Ok(dirent);
        }

        let target = dirent.inode.ops.read_link(&dirent.inode)?;
        let full = join_and_clean(parent_dir(path), &target);
        self.lookup_path_depth(&full, depth + 1)
    }

    /// Resolve a path without following a final symlink.
    pub fn lookup_dirent(&self, path: &str) -> Result<Arc<Dirent>, FsError> {
        let path = path.strip_prefix('/').unwrap_or(path);
        if path.is_empty() {
            return Ok(Arc::clone(&self.root));
        }

        if let Some(hit) = self.cache.lock().unwrap().get(path) {
            return Ok(hit);
        }

        let mut cur = Arc::clone(&self.root);
        for part in path.split('/') {
            if cur.inode.stable_attr.typ != InodeType::Directory {
                return Err(FsError::NotDirectory);
            }
            let inode = cur.inode.ops.lookup_child(&cur.inode, part)?;
            cur = Arc::new(Dirent {
                name: part.to_string(),
                parent: Some(Arc::clone(&cur)),
                inode,
            });
        }

        self.cache
            .lock()
            .unwrap()
            .add(path.to_string(), Arc::clone(&cur));

        Ok(cur)
    }
}

/// Directory part of a slash path ("/a/b/c" -> "/a/b").
fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

/// Join `target` onto `dir` (absolute targets win) and normalize away
/// `.` and `..` components.
fn join_and_clean(dir: &str, target: &str) -> String {
    let joined = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("{}/{}", dir, target)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

#[cfg(test)]
mod tests {
    use super::super::tarfs::TarFs;
    use super::*;

    fn sample_namespace() -> MountNamespace {
        let mut builder = tar::Builder::new(Vec::new());

        let mut add_file = |path: &str, body: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_path(path).unwrap();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, body).unwrap();
        };
        add_file("etc/passwd", b"root:x:0:0:root:/root:/bin/sh\n");
        add_file("bin/sh", b"#!");

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_path("etc/alias").unwrap();
        header.set_link_name("passwd").unwrap();
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, &[][..]).unwrap();

        let bytes = builder.into_inner().unwrap();
        let fs = TarFs::new(std::io::Cursor::new(bytes)).unwrap();
        MountNamespace::new(fs.root())
    }

    #[test]
    fn test_lookup_dirent_walks_components() {
        let ns = sample_namespace();
        let d = ns.lookup_dirent("/etc/passwd").unwrap();
        assert_eq!(d.name, "passwd");
        assert_eq!(d.inode.stable_attr.typ, InodeType::RegularFile);
        assert_eq!(d.parent.as_ref().unwrap().name, "etc");
    }

    #[test]
    fn test_lookup_root() {
        let ns = sample_namespace();
        let d = ns.lookup_dirent("/").unwrap();
        assert_eq!(d.inode.stable_attr.typ, InodeType::Directory);
    }

    #[test]
    fn test_unknown_path() {
        let ns = sample_namespace();
        assert_eq!(
            ns.lookup_dirent("/etc/shadow").unwrap_err(),
            FsError::UnknownPath
        );
    }

    #[test]
    fn test_component_of_file_fails() {
        let ns = sample_namespace();
        assert_eq!(
            ns.lookup_dirent("/etc/passwd/extra").unwrap_err(),
            FsError::NotDirectory
        );
    }

    #[test]
    fn test_lookup_path_follows_symlink() {
        let ns = sample_namespace();
        // Without following: the symlink itself.
        let link = ns.lookup_dirent("/etc/alias").unwrap();
        assert_eq!(link.inode.stable_attr.typ, InodeType::Symlink);

        // Following: the target file, resolved relative to /etc.
        let resolved = ns.lookup_path("/etc/alias").unwrap();
        assert_eq!(resolved.inode.stable_attr.typ, InodeType::RegularFile);
        assert_eq!(resolved.name, "passwd");
    }

    #[test]
    fn test_cache_returns_same_dirent() {
        let ns = sample_namespace();
        let a = ns.lookup_dirent("/etc/passwd").unwrap();
        let b = ns.lookup_dirent("/etc/passwd").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_join_and_clean() {
        assert_eq!(join_and_clean("/etc", "passwd"), "/etc/passwd");
        assert_eq!(join_and_clean("/etc", "/abs"), "/abs");
        assert_eq!(join_and_clean("/a/b", "../c"), "/a/c");
        assert_eq!(join_and_clean("/a", "./b//c"), "/a/b/c");
    }
}
