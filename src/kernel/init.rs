//! Process bring-up: init, exec, fork, start
//!
//! `setup_process` is shared by first-process creation and execve: it
//! loads the target module (cache-aware), builds a fresh address space
//! and VM under the same process identity, aborts any previous VM so a
//! single interpreter is live per process, and writes the exec header
//! the guest's C runtime expects just below `__heap_base`.

use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::exec::{HostCtx, Vm};
use crate::fs::namespace::MountNamespace;
use crate::loader::Loader;
use crate::memory::{MemoryError, VirtualMemory, WASM_PAGE_SIZE};

use super::process::{Process, Task};
use super::process_group::ProcessGroup;
use super::{Kernel, KernelError, TaskContext};

impl Kernel {
    /// Create the first process of a session: allocate a pid, a fresh
    /// process group, and set the program up ready to start.
    pub fn init_process(
        self: &Arc<Kernel>,
        mount: Arc<MountNamespace>,
        path: &str,
        args: &[String],
        env: &[String],
    ) -> Result<(Arc<Process>, Vm), KernelError> {
        let pid = self.processes.assign_pid();
        let group = ProcessGroup::new();
        let proc = Process::new(pid, None, Arc::clone(&group), mount);
        group.add(&proc);
        self.processes.register(&proc);

        let vm = self.setup_process(&proc, path, args, env)?;
        Ok((proc, vm))
    }

    /// Replace (or first-populate) the program under an existing
    /// process identity. Returns the new VM; the caller decides which
    /// thread re-enters it.
    pub fn setup_process(
        self: &Arc<Kernel>,
        proc: &Arc<Process>,
        path: &str,
        args: &[String],
        env: &[String],
    ) -> Result<Vm, KernelError> {
        let dirent = proc.mount().lookup_path(path)?;
        let mut reader = dirent.reader()?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        let loader = Loader::new(Some(Arc::clone(&self.loader_cache)));
        let prepared = loader.load(self.decoder.as_ref(), &bytes, &self.env)?;

        let mut virtmem = VirtualMemory::new();
        if let Some(desc) = &prepared.module.memory {
            virtmem.new_region(0, desc.initial_pages as i32 * WASM_PAGE_SIZE)?;
        }
        let memory = Arc::new(Mutex::new(virtmem));
        proc.set_memory(Arc::clone(&memory));

        let task = Task::new(Arc::clone(proc));
        let tc = TaskContext {
            kernel: Arc::clone(self),
            task,
        };
        let hctx = HostCtx::new(&tc);
        let mut vm = Vm::new(&hctx, Arc::clone(&prepared), Arc::clone(&memory))?;
        vm.pid = proc.pid;

        // Stop the previous interpreter so exactly one is live for
        // this process; it samples the flag on its next instruction.
        if let Some(old) = proc.swap_vm_abort(vm.abort_handle()) {
            old.store(true, Ordering::SeqCst);
        }

        let (entry, _) = prepared
            .module
            .export_function("_start")
            .ok_or(KernelError::NoStart)?;
        proc.set_entry_index(entry as i64);

        let heap_base = prepared
            .module
            .exported_global_i32("__heap_base")
            .ok_or(KernelError::NoHeapBase)?;

        let d0 = heap_base - 16;
        let sca = d0 + 12;
        write_exec_header(sca, &memory, args, env)?;

        Ok(vm)
    }

    /// Run the process entry on the calling thread until it exits or
    /// aborts.
    pub fn start_process(
        self: &Arc<Kernel>,
        proc: &Arc<Process>,
        vm: &mut Vm,
    ) -> Result<Option<u64>, KernelError> {
        proc.set_running();
        let tc = TaskContext {
            kernel: Arc::clone(self),
            task: Task::new(Arc::clone(proc)),
        };
        let hctx = HostCtx::new(&tc);
        Ok(vm.exec_code(&hctx, proc.entry_index(), &[])?)
    }

    /// Fork: new pid in the parent's group, deep-copied memory, shared
    /// files, and a VM carrying the parent's full interpreter state.
    /// The child resumes via `restart(&[0])` on its own thread.
    pub fn fork_process(self: &Arc<Kernel>, parent: &Task, vm: &Vm) -> (Arc<Process>, Vm) {
        let pid = self.processes.assign_pid();

        let child_mem = Arc::new(Mutex::new(parent.memory().lock().unwrap().fork()));

        let child = Process::new(
            pid,
            Some(&parent.process),
            Arc::clone(parent.group()),
            Arc::clone(parent.mount()),
        );
        child.set_memory(Arc::clone(&child_mem));
        child.adopt_fds(parent.share_fds());

        let mut child_vm = vm.fork(child_mem);
        child_vm.pid = pid;
        child.swap_vm_abort(child_vm.abort_handle());

        parent.group().add(&child);
        self.processes.register(&child);

        log::trace!("fork pid={} -> child={}", parent.pid, pid);
        (child, child_vm)
    }
}

/// Write the exec header: `argc, argv..., NUL, envp..., NUL, auxv=0,
/// NUL`, followed by the interned NUL-terminated strings, all
/// little-endian, at `base`.
fn write_exec_header(
    base: i32,
    memory: &Arc<Mutex<VirtualMemory>>,
    args: &[String],
    env: &[String],
) -> Result<(), MemoryError> {
    let data_start = 4 // argc
        + 4 * args.len() // argv
        + 4 // null
        + 4 * env.len() // envp
        + 4 // null
        + 4 // auxv
        + 4; // null

    let strings: usize = args
        .iter()
        .chain(env.iter())
        .map(|s| s.len() + 1)
        .sum();
    let total = data_start + strings;

    let mut mem = memory.lock().unwrap();
    let buf = mem.project(base, total as i32)?;

    buf[0..4].copy_from_slice(&(args.len() as u32).to_le_bytes());

    let mut next_str = data_start;
    let mut ptr = 4;

    let mut put_string = |buf: &mut [u8], ptr: usize, s: &str| {
        buf[ptr..ptr + 4].copy_from_slice(&((base + next_str as i32) as u32).to_le_bytes());
        buf[next_str..next_str + s.len()].copy_from_slice(s.as_bytes());
        buf[next_str + s.len()] = 0;
        next_str += s.len() + 1;
    };

    for s in args {
        put_string(buf, ptr, s);
        ptr += 4;
    }
    buf[ptr..ptr + 4].copy_from_slice(&0u32.to_le_bytes()); // null after argv
    ptr += 4;

    for s in env {
        put_string(buf, ptr, s);
        ptr += 4;
    }
    buf[ptr..ptr + 4].copy_from_slice(&0u32.to_le_bytes()); // null after envp
    buf[ptr + 4..ptr + 8].copy_from_slice(&0u32.to_le_bytes()); // auxv
    buf[ptr + 8..ptr + 12].copy_from_slice(&0u32.to_le_bytes()); // null after auxv

    Ok(())
}
