//! Host-import shim
//!
//! The fixed set of host functions a guest links against under the
//! `env` module: `__syscall0..__syscall6` passing arguments in
//! registers, the variadic `__syscall(idx, reqPtr)` reading a packed
//! 7×i32 request from guest memory, `setjmp`/`longjmp` snapshotting
//! and restoring interpreter state, and `debug`.
//!
//! Every entry re-derives the task from the ambient execution context;
//! a context without one (host-induced reentry) fails soft with
//! -ENOSYS rather than trapping.

use std::sync::Arc;

use crate::abi;
use crate::exec::JmpBuf;
use crate::syscalls::{self, Invoker, SysArgs, SyscallRequest};
use crate::wasm::{ExportEntry, ExternalKind, Function, FunctionSig, HostFn, Module, ValueType};

use crate::kernel::TaskContext;

/// Builds the environment module around a syscall invoker.
pub struct WasmInterface {
    invoker: Arc<Invoker>,
}

fn sig(params: usize, returns: bool) -> FunctionSig {
    FunctionSig::new(
        vec![ValueType::I32; params],
        if returns {
            vec![ValueType::I32]
        } else {
            Vec::new()
        },
    )
}

impl WasmInterface {
    pub fn new(invoker: Arc<Invoker>) -> WasmInterface {
        WasmInterface { invoker }
    }

    /// A host function for `__syscallN`: syscall number plus N
    /// register arguments.
    fn syscall_n(&self, nargs: usize) -> HostFn {
        let invoker = Arc::clone(&self.invoker);
        Arc::new(move |vm, ctx, args| {
            let Some(tc) = ctx.value::<TaskContext>() else {
                log::error!("syscall: unknown task context");
                return Some(-abi::ENOSYS as i64 as u64);
            };

            let index = args[0] as u32 as i32;
            let regs: Vec<i32> = args[1..=nargs].iter().map(|&a| a as u32 as i32).collect();

            log::trace!(
                "syscall pid={} index={} name={} args={:?}",
                tc.task.pid,
                index,
                syscalls::name(index),
                regs
            );

            let req = SyscallRequest::from_regs(&regs);
            let ret = invoker.invoke(&tc.kernel, &tc.task, vm, SysArgs { index, args: req });
            Some(ret as i64 as u64)
        })
    }

    /// The variadic `__syscall(idx, reqPtr)` entry.
    fn syscall_packed(&self) -> HostFn {
        let invoker = Arc::clone(&self.invoker);
        Arc::new(move |vm, ctx, args| {
            let Some(tc) = ctx.value::<TaskContext>() else {
                log::error!("syscall: unknown task context");
                return Some(-abi::ENOSYS as i64 as u64);
            };

            let index = args[0] as u32 as i32;
            let addr = args[1] as u32 as i32;

            let req: SyscallRequest = match tc.task.copy_in(addr) {
                Ok(req) => req,
                Err(err) => {
                    log::error!("syscall: decoding request: {}", err);
                    return Some(-1i64 as u64);
                }
            };

            log::trace!(
                "syscall-vararg pid={} ip={:#x} index={} name={} req={:?}",
                tc.task.pid,
                vm.ip(),
                index,
                syscalls::name(index),
                req
            );

            let ret = invoker.invoke(&tc.kernel, &tc.task, vm, SysArgs { index, args: req });
            Some(ret as i64 as u64)
        })
    }

    fn setjmp(&self) -> HostFn {
        Arc::new(move |vm, ctx, args| {
            let Some(tc) = ctx.value::<TaskContext>() else {
                log::error!("setjmp: unknown task context");
                return Some(-abi::ENOSYS as i64 as u64);
            };

            let addr = args[0] as u32 as i32;
            let buf = vm.get_context();
            log::trace!("setjmp pid={} addr={:#x} {:?}", tc.task.pid, addr, buf);

            if let Err(err) = tc.task.copy_out(addr, &buf) {
                log::error!("setjmp: writing jmpbuf: {}", err);
                return Some(-abi::EINVAL as i64 as u64);
            }

            Some(0)
        })
    }

    fn longjmp(&self) -> HostFn {
        Arc::new(move |vm, ctx, args| {
            let Some(tc) = ctx.value::<TaskContext>() else {
                log::error!("longjmp: unknown task context");
                return None;
            };

            let addr = args[0] as u32 as i32;
            let val = args[1] as u32 as i32;

            let buf: JmpBuf = match tc.task.copy_in(addr) {
                Ok(b) => b,
                Err(err) => {
                    log::error!("longjmp: reading jmpbuf: {}", err);
                    return None;
                }
            };

            log::trace!("longjmp pid={} addr={:#x} val={}", tc.task.pid, addr, val);

            if let Err(trap) = vm.set_context(&buf, val as i64 as u64) {
                // Unwinding toward newer frames corrupts the stack; an
                // invalid jmpbuf is fatal to the host.
                panic!("longjmp: {}", trap);
            }

            None
        })
    }

    fn debug(&self) -> HostFn {
        Arc::new(move |_vm, _ctx, args| {
            log::debug!("guest-debug value={:#x}", args[0] as u32);
            None
        })
    }

    /// Assemble the `env` module. Function indices and export names
    /// are a stable part of the guest ABI.
    pub fn env_module(&self) -> Module {
        let mut m = Module::new();

        let entries: [(&str, usize, bool, HostFn); 11] = [
            ("__syscall0", 1, true, self.syscall_n(0)),
            ("__syscall1", 2, true, self.syscall_n(1)),
            ("__syscall2", 3, true, self.syscall_n(2)),
            ("__syscall3", 4, true, self.syscall_n(3)),
            ("__syscall4", 5, true, self.syscall_n(4)),
            ("__syscall5", 6, true, self.syscall_n(5)),
            ("setjmp", 1, true, self.setjmp()),
            ("longjmp", 2, false, self.longjmp()),
            ("__syscall6", 7, true, self.syscall_n(6)),
            ("__syscall", 2, true, self.syscall_packed()),
            ("debug", 1, false, self.debug()),
        ];

        for (index, (name, params, returns, f)) in entries.into_iter().enumerate() {
            m.funcs.push(Function::host(sig(params, returns), name, f));
            m.exports.insert(
                name.to_string(),
                ExportEntry {
                    kind: ExternalKind::Function,
                    index: index as u32,
                },
            );
        }

        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_module_export_indices() {
        let invoker = Arc::new(Invoker::new());
        let wi = WasmInterface::new(invoker);
        let env = wi.env_module();

        assert_eq!(env.funcs.len(), 11);
        for (name, index) in [
            ("__syscall0", 0u32),
            ("__syscall5", 5),
            ("setjmp", 6),
            ("longjmp", 7),
            ("__syscall6", 8),
            ("__syscall", 9),
            ("debug", 10),
        ] {
            assert_eq!(env.export(name).unwrap().index, index, "export {}", name);
        }

        // Signatures: __syscall3 takes the number plus three args.
        let (_, f) = env.export_function("__syscall3").unwrap();
        assert_eq!(f.sig.params.len(), 4);
        assert_eq!(f.sig.results.len(), 1);

        // longjmp returns nothing.
        let (_, f) = env.export_function("longjmp").unwrap();
        assert!(f.sig.results.is_empty());
    }
}
