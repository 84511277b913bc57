//! Open file objects
//!
//! A `File` is shared by dup and fork, so it carries a reference
//! count; the underlying streams close when the count reaches zero.
//! The count lives under its own small lock so that closing one
//! process's descriptor never waits behind another process blocked in
//! I/O on the same object.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::fs::{Dirent, FsError, InodeType};

use super::pipe::{PipeReader, PipeWriter};
use super::waiter::InterruptToken;

/// Read offset state for directory descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirContext {
    pub offset: usize,
}

/// The readable end behind a descriptor.
pub enum FileReader {
    /// A host stream: stdin, or filesystem content.
    Host(Box<dyn Read + Send>),
    Pipe(PipeReader),
}

/// The writable end behind a descriptor.
pub enum FileWriter {
    Host(Box<dyn Write + Send>),
    Pipe(PipeWriter),
}

/// One open file, shared across descriptors and processes.
pub struct File {
    refs: Mutex<i32>,
    close_on_exec: AtomicBool,
    dirent: Option<Arc<Dirent>>,
    reader: Mutex<Option<FileReader>>,
    writer: Mutex<Option<FileWriter>>,
    dir_context: Mutex<Option<DirContext>>,
    /// Real host descriptor when this file fronts one (stdio); lets
    /// ioctl reach the actual tty.
    host_fd: Option<i32>,
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("refs", &*self.refs.lock().unwrap())
            .field("host_fd", &self.host_fd)
            .finish()
    }
}

impl File {
    fn new(
        dirent: Option<Arc<Dirent>>,
        reader: Option<FileReader>,
        writer: Option<FileWriter>,
        dir_context: Option<DirContext>,
        host_fd: Option<i32>,
    ) -> Arc<File> {
        Arc::new(File {
            refs: Mutex::new(1),
            close_on_exec: AtomicBool::new(false),
            dirent,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            dir_context: Mutex::new(dir_context),
            host_fd,
        })
    }

    pub fn new_reader(reader: FileReader, host_fd: Option<i32>) -> Arc<File> {
        Self::new(None, Some(reader), None, None, host_fd)
    }

    pub fn new_writer(writer: FileWriter, host_fd: Option<i32>) -> Arc<File> {
        Self::new(None, None, Some(writer), None, host_fd)
    }

    /// Open a resolved dirent: directories get a read offset for
    /// getdents, everything else gets a content reader.
    pub fn open_dirent(dirent: Arc<Dirent>) -> Result<Arc<File>, FsError> {
        match dirent.inode.stable_attr.typ {
            InodeType::Directory | InodeType::SpecialDirectory => Ok(Self::new(
                Some(dirent),
                None,
                None,
                Some(DirContext::default()),
                None,
            )),
            _ => {
                let reader = dirent.reader()?;
                Ok(Self::new(
                    Some(dirent),
                    Some(FileReader::Host(reader)),
                    None,
                    None,
                    None,
                ))
            }
        }
    }

    pub fn inc_ref(&self) {
        *self.refs.lock().unwrap() += 1;
    }

    /// Drop one reference. Returns true when this was the last one and
    /// the underlying streams were closed.
    pub fn close(&self) -> bool {
        {
            let mut refs = self.refs.lock().unwrap();
            *refs -= 1;
            if *refs > 0 {
                return false;
            }
        }

        // Last reference: dropping the ends closes them (pipe ends
        // notify their peers).
        self.reader.lock().unwrap().take();
        self.writer.lock().unwrap().take();
        true
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> i32 {
        *self.refs.lock().unwrap()
    }

    pub fn close_on_exec(&self) -> bool {
        self.close_on_exec.load(Ordering::Relaxed)
    }

    pub fn set_close_on_exec(&self, v: bool) {
        self.close_on_exec.store(v, Ordering::Relaxed);
    }

    pub fn dirent(&self) -> Option<&Arc<Dirent>> {
        self.dirent.as_ref()
    }

    pub fn host_fd(&self) -> Option<i32> {
        self.host_fd
    }

    pub fn has_reader(&self) -> bool {
        self.reader.lock().unwrap().is_some()
    }

    pub fn has_writer(&self) -> bool {
        self.writer.lock().unwrap().is_some()
    }

    /// Read from the file's read end, honoring the interrupt token for
    /// ends that support cancellation.
    pub fn read(&self, buf: &mut [u8], intr: &InterruptToken) -> io::Result<usize> {
        let mut reader = self.reader.lock().unwrap();
        match reader.as_mut() {
            Some(FileReader::Host(r)) => r.read(buf),
            Some(FileReader::Pipe(p)) => p.read(buf, intr),
            None => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }

    pub fn write(&self, buf: &[u8], intr: &InterruptToken) -> io::Result<usize> {
        let mut writer = self.writer.lock().unwrap();
        match writer.as_mut() {
            Some(FileWriter::Host(w)) => {
                let n = w.write(buf)?;
                w.flush()?;
                Ok(n)
            }
            Some(FileWriter::Pipe(p)) => p.write(buf, intr),
            None => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }

    /// Run `f` with the directory read offset, if this is a directory
    /// descriptor.
    pub fn with_dir_context<R>(&self, f: impl FnOnce(&mut DirContext) -> R) -> Option<R> {
        self.dir_context.lock().unwrap().as_mut().map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::super::pipe;
    use super::*;

    #[test]
    fn test_refcount_close() {
        let (r, _w) = pipe::pipe();
        let file = File::new_reader(FileReader::Pipe(r), None);

        file.inc_ref();
        assert_eq!(file.refs(), 2);

        assert!(!file.close());
        assert!(file.has_reader());

        assert!(file.close());
        assert!(!file.has_reader());
    }

    #[test]
    fn test_pipe_close_propagates_eof() {
        let (r, w) = pipe::pipe();
        let rf = File::new_reader(FileReader::Pipe(r), None);
        let wf = File::new_writer(FileWriter::Pipe(w), None);
        let intr = InterruptToken::new();

        wf.write(b"bye", &intr).unwrap();
        assert!(wf.close());

        let mut buf = [0u8; 8];
        assert_eq!(rf.read(&mut buf, &intr).unwrap(), 3);
        assert_eq!(rf.read(&mut buf, &intr).unwrap(), 0); // EOF
    }

    #[test]
    fn test_read_without_reader() {
        let file = File::new_writer(FileWriter::Host(Box::new(Vec::new())), None);
        let intr = InterruptToken::new();
        let mut buf = [0u8; 4];
        assert!(file.read(&mut buf, &intr).is_err());
    }
}
