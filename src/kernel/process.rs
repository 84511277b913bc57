//! Processes and tasks
//!
//! A `Process` owns the kernel-visible identity of one guest: pid,
//! descriptor table, memory handle, signal state, and its place in the
//! process tree. The interpreter state itself (the `Vm`) lives on the
//! executing thread; the process keeps only the abort handle so exit
//! and exec can stop it from outside.
//!
//! Ownership is split deliberately: the process table holds processes
//! strongly, groups and children hold weak back-references, so the
//! parent/child/group cycle never leaks.

use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Weak};

use crate::abi::{self, Abi};
use crate::exec::Vm;
use crate::fs::namespace::MountNamespace;
use crate::memory::{MemoryError, VirtualMemory};

use super::file::{File, FileReader, FileWriter};
use super::pipe;
use super::process_group::{ProcessGroup, WaitError};
use super::signals::Signals;
use super::waiter::InterruptToken;

/// Process errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The descriptor does not name an open file.
    UnknownFile,
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFile => write!(f, "unknown file"),
        }
    }
}

impl std::error::Error for ProcessError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Init,
    Running,
    Dead,
}

/// How a process ended, in wait4 encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub signo: i32,
}

impl ExitStatus {
    /// The packed status word wait4 writes to the guest.
    pub fn status(&self) -> i32 {
        ((self.code & 0xff) << 8) | (self.signo & 0xff)
    }
}

struct ProcState {
    status: ProcessStatus,
    exit_status: ExitStatus,
    entry_index: i64,
    vm_abort: Option<Arc<AtomicBool>>,
    interrupt: Option<InterruptToken>,
    cwd: String,
}

/// One guest process.
pub struct Process {
    pub pid: i32,
    parent: Option<Weak<Process>>,
    group: Arc<ProcessGroup>,
    mount: Arc<MountNamespace>,

    mem: Mutex<Arc<Mutex<VirtualMemory>>>,
    fds: Mutex<Vec<Option<Arc<File>>>>,
    signals: Signals,
    state: Mutex<ProcState>,
}

impl Process {
    pub fn new(
        pid: i32,
        parent: Option<&Arc<Process>>,
        group: Arc<ProcessGroup>,
        mount: Arc<MountNamespace>,
    ) -> Arc<Process> {
        Arc::new(Process {
            pid,
            parent: parent.map(Arc::downgrade),
            group,
            mount,
            mem: Mutex::new(Arc::new(Mutex::new(VirtualMemory::new()))),
            fds: Mutex::new(Vec::new()),
            signals: Signals::new(),
            state: Mutex::new(ProcState {
                status: ProcessStatus::Init,
                exit_status: ExitStatus::default(),
                entry_index: 0,
                vm_abort: None,
                interrupt: None,
                cwd: "/".to_string(),
            }),
        })
    }

    pub fn group(&self) -> &Arc<ProcessGroup> {
        &self.group
    }

    pub fn mount(&self) -> &Arc<MountNamespace> {
        &self.mount
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().unwrap().status
    }

    pub fn set_running(&self) {
        self.state.lock().unwrap().status = ProcessStatus::Running;
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.state.lock().unwrap().exit_status
    }

    pub fn entry_index(&self) -> i64 {
        self.state.lock().unwrap().entry_index
    }

    pub fn set_entry_index(&self, index: i64) {
        self.state.lock().unwrap().entry_index = index;
    }

    pub fn curwd(&self) -> String {
        self.state.lock().unwrap().cwd.clone()
    }

    // ---- memory --------------------------------------------------------

    pub fn memory(&self) -> Arc<Mutex<VirtualMemory>> {
        Arc::clone(&self.mem.lock().unwrap())
    }

    /// Swap in a fresh address space (exec).
    pub fn set_memory(&self, mem: Arc<Mutex<VirtualMemory>>) {
        *self.mem.lock().unwrap() = mem;
    }

    /// Copy bytes out of guest memory.
    pub fn read_at(&self, addr: i32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mem = self.memory();
        let mut mem = mem.lock().unwrap();
        let src = mem.project(addr, buf.len() as i32)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    /// Copy bytes into guest memory.
    pub fn write_at(&self, addr: i32, buf: &[u8]) -> Result<(), MemoryError> {
        let mem = self.memory();
        let mut mem = mem.lock().unwrap();
        let dst = mem.project(addr, buf.len() as i32)?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    /// Read a NUL-terminated string, one byte at a time.
    pub fn read_cstring(&self, addr: i32) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::new();
        let mut off = addr;
        loop {
            let mut b = [0u8; 1];
            self.read_at(off, &mut b)?;
            if b[0] == 0 {
                break;
            }
            out.push(b[0]);
            off += 1;
        }
        Ok(out)
    }

    /// Decode a fixed-layout value from guest memory.
    pub fn copy_in<T: Abi>(&self, addr: i32) -> Result<T, MemoryError> {
        let mut buf = vec![0u8; T::SIZE];
        self.read_at(addr, &mut buf)?;
        Ok(T::decode(&buf))
    }

    /// Encode a fixed-layout value into guest memory.
    pub fn copy_out<T: Abi>(&self, addr: i32, val: &T) -> Result<(), MemoryError> {
        let mut buf = vec![0u8; T::SIZE];
        val.encode(&mut buf);
        self.write_at(addr, &buf)
    }

    // ---- descriptors ---------------------------------------------------

    /// Pre-populate fds 0/1/2.
    pub fn hookup_stdio(
        &self,
        stdin: Box<dyn Read + Send>,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) {
        let mut fds = self.fds.lock().unwrap();
        fds.push(Some(File::new_reader(FileReader::Host(stdin), None)));
        fds.push(Some(File::new_writer(FileWriter::Host(stdout), None)));
        fds.push(Some(File::new_writer(FileWriter::Host(stderr), None)));
    }

    /// Pre-populate fds 0/1/2 with the host's own stdio, remembering
    /// the real descriptors so ioctl can reach the tty.
    pub fn hookup_host_stdio(&self) {
        let mut fds = self.fds.lock().unwrap();
        fds.push(Some(File::new_reader(
            FileReader::Host(Box::new(std::io::stdin())),
            Some(0),
        )));
        fds.push(Some(File::new_writer(
            FileWriter::Host(Box::new(std::io::stdout())),
            Some(1),
        )));
        fds.push(Some(File::new_writer(
            FileWriter::Host(Box::new(std::io::stderr())),
            Some(2),
        )));
    }

    /// Append a connected pipe pair to the descriptor table.
    pub fn create_pipe(&self) -> (Arc<File>, i32, Arc<File>, i32) {
        let (r, w) = pipe::pipe();
        let read = File::new_reader(FileReader::Pipe(r), None);
        let write = File::new_writer(FileWriter::Pipe(w), None);

        let mut fds = self.fds.lock().unwrap();
        let rfd = fds.len() as i32;
        fds.push(Some(Arc::clone(&read)));
        fds.push(Some(Arc::clone(&write)));

        (read, rfd, write, rfd + 1)
    }

    /// Place a file in the lowest free slot.
    pub fn alloc_fd(&self, file: Arc<File>) -> i32 {
        let mut fds = self.fds.lock().unwrap();
        for (i, slot) in fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return i as i32;
            }
        }
        fds.push(Some(file));
        (fds.len() - 1) as i32
    }

    pub fn get_file(&self, fd: i32) -> Option<Arc<File>> {
        if fd < 0 {
            return None;
        }
        self.fds.lock().unwrap().get(fd as usize)?.clone()
    }

    /// Clear the slot and drop one reference; the underlying streams
    /// close when the last reference goes.
    pub fn close_file(&self, fd: i32) -> Result<(), ProcessError> {
        let file = {
            let mut fds = self.fds.lock().unwrap();
            if fd < 0 || fd as usize >= fds.len() {
                return Err(ProcessError::UnknownFile);
            }
            fds[fd as usize].take().ok_or(ProcessError::UnknownFile)?
        };
        file.close();
        Ok(())
    }

    /// Alias `to` to the file at `from`, closing whatever `to` held.
    pub fn dup2(&self, from: i32, to: i32) -> Result<(), ProcessError> {
        if from < 0 || to < 0 {
            return Err(ProcessError::UnknownFile);
        }

        let old = {
            let mut fds = self.fds.lock().unwrap();
            let source = fds
                .get(from as usize)
                .cloned()
                .flatten()
                .ok_or(ProcessError::UnknownFile)?;
            source.inc_ref();

            if (to as usize) >= fds.len() {
                fds.resize(to as usize + 1, None);
            }
            fds[to as usize].replace(source)
        };

        if let Some(old) = old {
            old.close();
        }
        Ok(())
    }

    /// Snapshot of the descriptor table with every ref bumped, for
    /// fork.
    pub(super) fn share_fds(&self) -> Vec<Option<Arc<File>>> {
        let fds = self.fds.lock().unwrap();
        for file in fds.iter().flatten() {
            file.inc_ref();
        }
        fds.clone()
    }

    pub(super) fn adopt_fds(&self, fds: Vec<Option<Arc<File>>>) {
        *self.fds.lock().unwrap() = fds;
    }

    // ---- lifecycle -----------------------------------------------------

    /// Track the abort flag of the currently live VM, returning the
    /// previous one (exec aborts it).
    pub fn swap_vm_abort(&self, handle: Arc<AtomicBool>) -> Option<Arc<AtomicBool>> {
        self.state.lock().unwrap().vm_abort.replace(handle)
    }

    fn abort_vm(&self) {
        if let Some(h) = &self.state.lock().unwrap().vm_abort {
            h.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Exit: close descriptors, go Dead, wake reapers, stop the VM,
    /// tell the parent.
    pub fn exit(&self, code: i32) {
        log::trace!("process-exit pid={} code={}", self.pid, code);

        let files: Vec<Arc<File>> = {
            let mut fds = self.fds.lock().unwrap();
            fds.iter_mut().filter_map(Option::take).collect()
        };
        for file in files {
            file.close();
        }

        {
            let mut state = self.state.lock().unwrap();
            state.exit_status.code = code;
            state.status = ProcessStatus::Dead;
        }

        self.group.process_exited(self.pid);
        self.abort_vm();

        if let Some(parent) = self.parent() {
            parent.deliver_signal(abi::SIGCHLD);
        }
    }

    /// Reap one Dead child (any member of the group). Returns pid 0
    /// when nothing is reapable and `block` is false.
    pub fn wait_any_child(
        &self,
        intr: &InterruptToken,
        block: bool,
    ) -> Result<(i32, ExitStatus), WaitError> {
        match self.group.reap_any(intr, block)? {
            Some(target) => Ok((target.pid, target.exit_status())),
            None => Ok((0, ExitStatus::default())),
        }
    }

    // ---- signals -------------------------------------------------------

    /// Queue a signal and kick the task out of any blocking syscall.
    pub fn deliver_signal(&self, signo: i32) {
        self.signals.queue(signo);
        self.interrupt();
    }

    pub fn set_interrupt(&self, token: InterruptToken) {
        self.state.lock().unwrap().interrupt = Some(token);
    }

    pub fn interrupt(&self) {
        if let Some(token) = &self.state.lock().unwrap().interrupt {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}

/// The running side of a process: what syscall handlers see.
#[derive(Clone)]
pub struct Task {
    pub process: Arc<Process>,
}

impl Task {
    pub fn new(process: Arc<Process>) -> Task {
        Task { process }
    }

    /// Register (or clear, when `table_entry` is 0) a signal handler.
    /// The guest hands over an index into the module's function table;
    /// it is translated to an absolute function index here.
    pub fn add_signal_handler(&self, vm: &Vm, signo: i32, table_entry: i64) {
        let handler = if table_entry == 0 {
            0
        } else {
            vm.resolve_from_table(table_entry).unwrap_or(0)
        };
        log::trace!(
            "add-signal-handler pid={} signal={} handler={}",
            self.process.pid,
            signo,
            handler
        );
        self.process.signals.add_handler(signo, handler);
    }

    /// Called at the end of every syscall: if a signal is pending and
    /// handled, inject the handler call so it runs before the guest
    /// resumes; its return path re-delivers `ret`.
    pub fn check_interrupt(&self, vm: &mut Vm, ret: i64) -> bool {
        let Some((signo, handler)) = self.process.signals.dequeue() else {
            return false;
        };

        let Some(handler) = handler else {
            log::trace!(
                "process-signal-unhandled pid={} signal={}",
                self.process.pid,
                signo
            );
            return false;
        };

        log::trace!(
            "process-setup-signal pid={} signal={} handler={}",
            self.process.pid,
            signo,
            handler
        );

        if let Err(trap) = vm.setup_into_function(ret, handler, &[signo as u64]) {
            log::error!("signal setup failed: {}", trap);
            return false;
        }
        true
    }
}

impl std::ops::Deref for Task {
    type Target = Process;

    fn deref(&self) -> &Process {
        &self.process
    }
}

/// Pid allocation and the table of live processes.
#[derive(Default)]
pub struct ProcessManager {
    inner: Mutex<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    high_water: i32,
    processes: std::collections::HashMap<i32, Option<Arc<Process>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the lowest unused pid, starting at 1.
    pub fn assign_pid(&self) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        for pid in 1..=inner.high_water {
            if !inner.processes.contains_key(&pid) {
                inner.processes.insert(pid, None);
                return pid;
            }
        }
        inner.high_water += 1;
        let pid = inner.high_water;
        inner.processes.insert(pid, None);
        pid
    }

    /// Fill the reserved slot with the constructed process.
    pub fn register(&self, proc: &Arc<Process>) {
        self.inner
            .lock()
            .unwrap()
            .processes
            .insert(proc.pid, Some(Arc::clone(proc)));
    }

    pub fn get(&self, pid: i32) -> Option<Arc<Process>> {
        self.inner.lock().unwrap().processes.get(&pid)?.clone()
    }

    /// Free a pid once its process has been reaped.
    pub fn remove(&self, pid: i32) {
        self.inner.lock().unwrap().processes.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::tarfs::TarFs;

    /// A process with an empty mount namespace, for unit tests.
    pub(crate) fn bare_process(pid: i32, group: Arc<ProcessGroup>) -> Arc<Process> {
        let empty = tar::Builder::new(Vec::new()).into_inner().unwrap();
        let fs = TarFs::new(std::io::Cursor::new(empty)).unwrap();
        let mount = Arc::new(MountNamespace::new(fs.root()));
        Process::new(pid, None, group, mount)
    }

    #[test]
    fn test_pid_allocation_lowest_unused() {
        let mgr = ProcessManager::new();
        assert_eq!(mgr.assign_pid(), 1);
        assert_eq!(mgr.assign_pid(), 2);
        assert_eq!(mgr.assign_pid(), 3);

        mgr.remove(2);
        assert_eq!(mgr.assign_pid(), 2);
        assert_eq!(mgr.assign_pid(), 4);
    }

    #[test]
    fn test_exit_status_encoding() {
        let st = ExitStatus { code: 7, signo: 0 };
        assert_eq!(st.status(), 7 << 8);

        let st = ExitStatus { code: 1, signo: 9 };
        assert_eq!(st.status(), (1 << 8) | 9);
    }

    #[test]
    fn test_stdio_hookup_and_write() {
        let group = ProcessGroup::new();
        let p = bare_process(1, group);

        let sink = super::super::SharedBuffer::new();
        p.hookup_stdio(
            Box::new(std::io::empty()),
            Box::new(sink.clone()),
            Box::new(std::io::sink()),
        );

        let out = p.get_file(1).unwrap();
        let intr = InterruptToken::new();
        out.write(b"hi", &intr).unwrap();
        assert_eq!(sink.contents(), b"hi");
    }

    #[test]
    fn test_pipe_dup2_close_accounting() {
        let group = ProcessGroup::new();
        let p = bare_process(1, group);
        p.hookup_stdio(
            Box::new(std::io::empty()),
            Box::new(std::io::sink()),
            Box::new(std::io::sink()),
        );

        let (read, rfd, _write, wfd) = p.create_pipe();
        assert_eq!((rfd, wfd), (3, 4));

        // dup2 the read end over stdin: the read file now has 2 refs.
        p.dup2(rfd, 0).unwrap();
        assert_eq!(read.refs(), 2);

        p.close_file(0).unwrap();
        assert_eq!(read.refs(), 1);
        assert!(read.has_reader());

        p.close_file(rfd).unwrap();
        assert!(!read.has_reader());

        // Slots are cleared.
        assert!(p.get_file(rfd).is_none());
        assert!(p.close_file(rfd).is_err());
    }

    #[test]
    fn test_copy_helpers_round_trip() {
        let group = ProcessGroup::new();
        let p = bare_process(1, group);
        p.memory()
            .lock()
            .unwrap()
            .new_region(0, crate::memory::WASM_PAGE_SIZE)
            .unwrap();

        p.copy_out(0x100, &0x11223344u32).unwrap();
        let v: u32 = p.copy_in(0x100).unwrap();
        assert_eq!(v, 0x11223344);

        p.write_at(0x200, b"string\0").unwrap();
        assert_eq!(p.read_cstring(0x200).unwrap(), b"string");
    }

    #[test]
    fn test_pid_allocation_property() {
        use proptest::prelude::*;

        // After any interleaving of allocations and frees, the next
        // pid is the smallest unused positive integer.
        proptest!(|(ops in proptest::collection::vec(any::<bool>(), 1..40))| {
            let mgr = ProcessManager::new();
            let mut held: Vec<i32> = Vec::new();

            for alloc in ops {
                if alloc || held.is_empty() {
                    let pid = mgr.assign_pid();
                    let expected = (1..).find(|p| !held.contains(p)).unwrap();
                    prop_assert_eq!(pid, expected);
                    held.push(pid);
                    held.sort_unstable();
                } else {
                    let pid = held.remove(held.len() / 2);
                    mgr.remove(pid);
                }
            }
        });
    }

    #[test]
    fn test_exit_delivers_sigchld_to_parent() {
        let group = ProcessGroup::new();
        let parent = bare_process(1, Arc::clone(&group));
        group.add(&parent);

        let child = {
            let empty = tar::Builder::new(Vec::new()).into_inner().unwrap();
            let fs = TarFs::new(std::io::Cursor::new(empty)).unwrap();
            let mount = Arc::new(MountNamespace::new(fs.root()));
            Process::new(2, Some(&parent), Arc::clone(&group), mount)
        };
        group.add(&child);

        child.exit(3);

        assert_eq!(child.status(), ProcessStatus::Dead);
        assert!(parent.signals().has_pending());

        let intr = InterruptToken::new();
        let (pid, status) = parent.wait_any_child(&intr, false).unwrap();
        assert_eq!(pid, 2);
        assert_eq!(status.code, 3);
    }
}
