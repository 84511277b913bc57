//! atlantis - run 32-bit Linux programs compiled to WebAssembly
//!
//! A user-space emulator: guest binaries issue Linux syscalls through
//! a small set of WebAssembly host imports, and atlantis gives them a
//! POSIX-like process model in return - fork/exec/wait, file
//! descriptors and pipes, signals delivered by interpreter frame
//! injection, mmap over a paged virtual address space, and a read-only
//! tar-image filesystem.
//!
//! Layering, leaves first:
//! - `memory`: per-process regions with bounds-checked projection
//! - `wasm`: the decoded-module data model (decoding itself is a
//!   collaborator behind `loader::ModuleDecoder`)
//! - `exec`: bytecode lowering and the stack-machine interpreter
//! - `loader`: fingerprinting and the prepared-module cache
//! - `fs`: inode/dirent/namespace contracts plus the tar filesystem
//! - `kernel`: processes, files, signals, process groups, bring-up
//! - `syscalls`: the numbered handler table and dispatch
//! - `boundary`: the `env` host-import module guests link against
//!
//! A typical embedding builds the environment module, a kernel around
//! it, mounts a tar image, and starts `/bin/...` from it:
//!
//! ```ignore
//! let invoker = Arc::new(Invoker::new());
//! let env = WasmInterface::new(invoker).env_module();
//! let kernel = Kernel::new(env, Box::new(decoder));
//! let (proc, mut vm) = kernel.init_process(mount, "/bin/sh", &args, &envs)?;
//! proc.hookup_host_stdio();
//! kernel.start_process(&proc, &mut vm)?;
//! ```

pub mod abi;
pub mod boundary;
pub mod exec;
pub mod fs;
pub mod kernel;
pub mod loader;
pub mod memory;
pub mod syscalls;
pub mod wasm;
