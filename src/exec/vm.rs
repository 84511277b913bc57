//! The stack-machine interpreter
//!
//! A `Vm` is one execution of a prepared module bound to one virtual
//! memory. Call frames alias their arguments into the caller's operand
//! stack (zero copy): on a call, `callee.fp = caller.sp - nargs + 1`
//! and the caller's `sp` is rolled back by `nargs`, so the arguments
//! are reinterpreted in place as the callee's first locals. Free locals
//! beyond the arguments are left uninitialized; the guest writes before
//! it reads.
//!
//! Host functions never push frames. A host callable that *does* move
//! the frame pointer (signal injection, longjmp) is detected by
//! snapshotting the frame index around the call, and the normal
//! return-value push is skipped because the host already arranged the
//! stack.

use std::any::Any;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::abi::Abi;
use crate::memory::{VirtualMemory, WASM_PAGE_SIZE};
use crate::wasm::op;

use super::compile::{compile_function, CompileError, CompiledFunction};
use super::numeric::new_func_table;

/// Upper bound on call depth.
pub const MAX_FRAMES: usize = 100;

pub(super) const NO_RETURN_VALUE: u8 = 0x1;

/// One entry of the prepared function index space.
#[derive(Clone)]
pub enum FuncKind {
    Compiled(Arc<CompiledFunction>),
    Host(Arc<HostFunction>),
}

/// A host function with its typed signature.
pub struct HostFunction {
    pub name: String,
    pub sig: crate::wasm::FunctionSig,
    pub f: crate::wasm::HostFn,
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.name)
    }
}

/// The immutable, sharable compiled form of a guest program.
#[derive(Debug)]
pub struct PreparedModule {
    pub module: crate::wasm::Module,
    funcs: Vec<FuncKind>,
}

impl fmt::Debug for FuncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuncKind::Compiled(c) => write!(f, "Compiled({})", c.name),
            FuncKind::Host(h) => write!(f, "Host({})", h.name),
        }
    }
}

impl PreparedModule {
    pub fn funcs(&self) -> &[FuncKind] {
        &self.funcs
    }

    pub fn func(&self, index: usize) -> Option<&FuncKind> {
        self.funcs.get(index)
    }
}

/// Compile every non-host function of a decoded module. The result is
/// immutable and safe to share across processes.
pub fn prepare_module(module: crate::wasm::Module) -> Result<PreparedModule, CompileError> {
    let mut funcs = Vec::with_capacity(module.funcs.len());

    for (i, func) in module.funcs.iter().enumerate() {
        if let Some(host) = &func.host {
            funcs.push(FuncKind::Host(Arc::new(HostFunction {
                name: func.name().to_string(),
                sig: func.sig.clone(),
                f: host.f.clone(),
            })));
        } else {
            funcs.push(FuncKind::Compiled(Arc::new(compile_function(&module, i)?)));
        }
    }

    Ok(PreparedModule { module, funcs })
}

/// One call activation.
#[derive(Clone)]
pub struct Frame {
    pub fp: i64,
    pub sp: i64,
    pub ip: i64,
    pub(super) flags: u8,
    pub(super) func: Arc<CompiledFunction>,
}

/// Interpreter snapshot sufficient to resume an earlier point in the
/// same VM; the guest-visible half of setjmp/longjmp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JmpBuf {
    pub sp: u32,
    pub ip: u32,
    pub frame: u32,
}

impl Abi for JmpBuf {
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.sp.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ip.to_le_bytes());
        buf[8..12].copy_from_slice(&self.frame.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            sp: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            ip: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            frame: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// Conditions that terminate the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    MemoryAccess { addr: i32, size: i32 },
    InvalidOpcode(u8),
    InvalidFunctionIndex(i64),
    UndefinedTableElement(i32),
    IndirectSignatureMismatch(u32),
    CallStackExhausted,
    IntegerDivideByZero,
    IntegerOverflow,
    LongjmpWrongDirection,
    Unreachable,
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryAccess { addr, size } => {
                write!(f, "out of bounds memory access: addr={:#x} size={}", addr, size)
            }
            Self::InvalidOpcode(op) => write!(f, "invalid opcode {:#x}", op),
            Self::InvalidFunctionIndex(i) => {
                write!(f, "invalid index to function index space: {}", i)
            }
            Self::UndefinedTableElement(i) => write!(f, "undefined table element {}", i),
            Self::IndirectSignatureMismatch(t) => {
                write!(f, "indirect call signature mismatch (type {})", t)
            }
            Self::CallStackExhausted => write!(f, "call stack exhausted"),
            Self::IntegerDivideByZero => write!(f, "integer divide by zero"),
            Self::IntegerOverflow => write!(f, "integer overflow"),
            Self::LongjmpWrongDirection => write!(f, "longjmp wrong direction on stack"),
            Self::Unreachable => write!(f, "unreachable executed"),
        }
    }
}

impl std::error::Error for Trap {}

/// Errors surfaced by VM construction and entry.
#[derive(Debug)]
pub enum ExecError {
    /// The target of ExecCode is not in the function index space.
    InvalidFunctionIndex(i64),
    /// The target of ExecCode is a host function.
    NotCompiledFunction(i64),
    InvalidArgumentCount { expected: usize, got: usize },
    /// A global initializer referenced a missing global.
    BadGlobalInit(usize),
    /// The initial linear memory could not be projected.
    MemorySetup(crate::memory::MemoryError),
    Trap(Trap),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFunctionIndex(i) => {
                write!(f, "invalid index to function index space: {}", i)
            }
            Self::NotCompiledFunction(i) => {
                write!(f, "function at index {} is not a compiled function", i)
            }
            Self::InvalidArgumentCount { expected, got } => {
                write!(
                    f,
                    "invalid number of arguments to function: expected {}, got {}",
                    expected, got
                )
            }
            Self::BadGlobalInit(i) => write!(f, "global {} has an unresolvable initializer", i),
            Self::MemorySetup(e) => write!(f, "loading initial linear memory: {}", e),
            Self::Trap(t) => write!(f, "trap: {}", t),
        }
    }
}

impl std::error::Error for ExecError {}

/// Ambient context handed to host functions as a hidden first
/// argument. Carries arbitrary task-scoped data; consumers downcast.
#[derive(Clone, Copy)]
pub struct HostCtx<'a> {
    data: Option<&'a (dyn Any + Send + Sync)>,
}

impl<'a> HostCtx<'a> {
    pub fn new(data: &'a (dyn Any + Send + Sync)) -> Self {
        Self { data: Some(data) }
    }

    /// A context carrying nothing; host functions that need task state
    /// fail soft when invoked under it.
    pub fn background() -> Self {
        Self { data: None }
    }

    pub fn value<T: Any>(&self) -> Option<&'a T> {
        self.data.and_then(|d| d.downcast_ref::<T>())
    }
}

pub(super) type OpFn = fn(&mut Vm, &HostCtx<'_>) -> Result<(), Trap>;

/// A bound execution of one prepared module against one linear memory.
pub struct Vm {
    pub pid: i32,

    frames: Vec<Frame>,
    stack: Vec<u64>,
    globals: Vec<u64>,

    memory: Arc<Mutex<VirtualMemory>>,
    module: Arc<PreparedModule>,

    func_table: [Option<OpFn>; 256],

    /// When set, traps surface as `ExecError` instead of panicking.
    pub recover_panic: bool,

    abort: Arc<AtomicBool>,
}

impl Vm {
    /// Create a VM, seed its linear memory from the module image,
    /// initialize globals, and run the start function if there is one.
    ///
    /// The caller must have created the main region (address 0) large
    /// enough for the module's initial pages.
    pub fn new(
        ctx: &HostCtx<'_>,
        module: Arc<PreparedModule>,
        memory: Arc<Mutex<VirtualMemory>>,
    ) -> Result<Vm, ExecError> {
        if let Some(desc) = &module.module.memory {
            let sz = desc.initial_pages as i32 * WASM_PAGE_SIZE;
            let image = &module.module.memory_image;
            let mut mem = memory.lock().unwrap();
            let slice = mem.project(0, sz).map_err(ExecError::MemorySetup)?;
            let n = image.len().min(slice.len());
            slice[..n].copy_from_slice(&image[..n]);
        }

        let mut globals = Vec::with_capacity(module.module.globals.len());
        for (i, g) in module.module.globals.iter().enumerate() {
            let v = module
                .module
                .eval_init(&g.init)
                .ok_or(ExecError::BadGlobalInit(i))?;
            globals.push(v);
        }

        let start = module.module.start;

        let mut vm = Vm {
            pid: 0,
            frames: Vec::new(),
            stack: Vec::new(),
            globals,
            memory,
            module,
            func_table: new_func_table(),
            recover_panic: false,
            abort: Arc::new(AtomicBool::new(false)),
        };

        if let Some(index) = start {
            vm.exec_code(ctx, index as i64, &[])?;
        }

        Ok(vm)
    }

    pub fn memory(&self) -> &Arc<Mutex<VirtualMemory>> {
        &self.memory
    }

    pub fn module(&self) -> &Arc<PreparedModule> {
        &self.module
    }

    /// Instruction pointer of the active frame.
    pub fn ip(&self) -> i64 {
        self.frames.last().map(|f| f.ip).unwrap_or(0)
    }

    /// Raise the abort flag; the interpreter loop samples it before
    /// every instruction and exits cleanly.
    pub fn terminate(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Handle that lets other threads abort this VM.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Translate a guest-visible function-table index into an absolute
    /// function index.
    pub fn resolve_from_table(&self, index: i64) -> Option<i64> {
        self.module
            .module
            .table
            .get(index as usize)
            .map(|&i| i as i64)
    }

    /// Call the function with the given index and arguments, running
    /// until the outermost frame returns or the VM aborts.
    pub fn exec_code(
        &mut self,
        ctx: &HostCtx<'_>,
        fn_index: i64,
        args: &[u64],
    ) -> Result<Option<u64>, ExecError> {
        let kind = self
            .module
            .func(fn_index as usize)
            .ok_or(ExecError::InvalidFunctionIndex(fn_index))?;

        let compiled = match kind {
            FuncKind::Compiled(c) => Arc::clone(c),
            FuncKind::Host(_) => return Err(ExecError::NotCompiledFunction(fn_index)),
        };

        if compiled.args != args.len() {
            return Err(ExecError::InvalidArgumentCount {
                expected: compiled.args,
                got: args.len(),
            });
        }

        let init_stack = compiled.max_depth + compiled.total_local_vars + 1024;
        self.stack = vec![0; init_stack];
        self.frames = Vec::with_capacity(MAX_FRAMES);

        self.stack[..args.len()].copy_from_slice(args);

        let sp = args.len() as i64 + (compiled.total_local_vars - compiled.args) as i64 - 1;
        let returns = compiled.returns;
        self.frames.push(Frame {
            fp: 0,
            sp,
            ip: 0,
            flags: 0,
            func: compiled,
        });

        let res = self.run(ctx).map_err(|t| self.surface(t))?;
        Ok(returns.then_some(res))
    }

    /// Push the supplied values and re-enter the interpreter loop from
    /// the current frame. Used by the child side of fork to resume as
    /// if its pending syscall had returned.
    pub fn restart(&mut self, ctx: &HostCtx<'_>, args: &[u64]) -> Result<(), ExecError> {
        for &a in args {
            self.push_u64(a);
        }
        self.run(ctx).map_err(|t| self.surface(t))?;
        Ok(())
    }

    fn surface(&self, trap: Trap) -> ExecError {
        if self.recover_panic {
            ExecError::Trap(trap)
        } else {
            panic!("vm: pid={} trap: {}", self.pid, trap);
        }
    }

    // ---- the main loop -------------------------------------------------

    fn run(&mut self, ctx: &HostCtx<'_>) -> Result<u64, Trap> {
        loop {
            'instloop: loop {
                let fi = self.frames.len() - 1;
                let ip = self.frames[fi].ip as usize;
                if ip >= self.frames[fi].func.code.len() || self.abort.load(Ordering::Relaxed) {
                    break 'instloop;
                }

                let opcode = self.frames[fi].func.code[ip];
                self.frames[fi].ip += 1;

                match opcode {
                    op::RETURN => break 'instloop,

                    op::JMP => {
                        let target = self.fetch_i64();
                        let fi = self.frames.len() - 1;
                        self.frames[fi].ip = target;
                    }

                    op::JMP_Z => {
                        let target = self.fetch_i64();
                        if self.pop_u32() == 0 {
                            let fi = self.frames.len() - 1;
                            self.frames[fi].ip = target;
                        }
                    }

                    op::JMP_NZ => {
                        let target = self.fetch_i64();
                        let preserve_top = self.fetch_u8() != 0;
                        let discard = self.fetch_i64();
                        if self.pop_u32() != 0 {
                            let fi = self.frames.len() - 1;
                            let top = if preserve_top {
                                self.stack[self.frames[fi].sp as usize]
                            } else {
                                0
                            };
                            self.frames[fi].ip = target;
                            self.frames[fi].sp -= discard;
                            if preserve_top {
                                self.push_u64(top);
                            }
                        }
                    }

                    op::BR_TABLE => {
                        let index = self.fetch_i64();
                        let label = self.pop_i32();
                        let fi = self.frames.len() - 1;
                        let table = &self.frames[fi].func.branch_tables[index as usize];
                        let target = if label >= 0 && (label as usize) < table.targets.len() {
                            table.targets[label as usize]
                        } else {
                            table.default_target
                        };

                        if target.return_ {
                            break 'instloop;
                        }

                        let top = if target.preserve_top {
                            self.stack[self.frames[fi].sp as usize]
                        } else {
                            0
                        };
                        self.frames[fi].ip = target.addr;
                        self.frames[fi].sp -= target.discard;
                        if target.preserve_top {
                            self.push_u64(top);
                        }
                    }

                    op::DISCARD => {
                        let n = self.fetch_i64();
                        let fi = self.frames.len() - 1;
                        self.frames[fi].sp -= n;
                    }

                    op::DISCARD_PRESERVE_TOP => {
                        let fi = self.frames.len() - 1;
                        let top = self.stack[self.frames[fi].sp as usize];
                        let n = self.fetch_i64();
                        self.frames[fi].sp -= n;
                        self.push_u64(top);
                    }

                    other => match self.func_table[other as usize] {
                        Some(handler) => handler(self, ctx)?,
                        None => return Err(Trap::InvalidOpcode(other)),
                    },
                }
            }

            let fi = self.frames.len() - 1;
            let frame = &self.frames[fi];
            let returns = frame.func.returns;
            let flags = frame.flags;
            let top = if frame.sp >= 0 {
                self.stack[frame.sp as usize]
            } else {
                0
            };

            if fi == 0 {
                return Ok(if returns { top } else { 0 });
            }

            self.frames.pop();

            if returns && flags & NO_RETURN_VALUE == 0 {
                self.push_u64(top);
            }
        }
    }

    // ---- calls ---------------------------------------------------------

    pub(super) fn invoke_function(
        &mut self,
        ctx: &HostCtx<'_>,
        index: i64,
    ) -> Result<(), Trap> {
        let kind = self
            .module
            .func(index as usize)
            .cloned()
            .ok_or(Trap::InvalidFunctionIndex(index))?;

        match kind {
            FuncKind::Compiled(compiled) => self.push_frame(compiled),
            FuncKind::Host(host) => self.call_host(ctx, &host),
        }
    }

    /// Push a frame whose locals alias the caller's argument slots.
    fn push_frame(&mut self, func: Arc<CompiledFunction>) -> Result<(), Trap> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(Trap::CallStackExhausted);
        }

        let fi = self.frames.len() - 1;
        let caller_sp = self.frames[fi].sp;
        let fp = caller_sp - func.args as i64 + 1;
        let sp = caller_sp + (func.total_local_vars as i64 - func.args as i64);

        // The caller's sp is rolled back now so the stack is correct
        // when the callee returns.
        self.frames[fi].sp -= func.args as i64;

        let needed = (sp + func.max_depth as i64 + 1) as usize;
        if self.stack.len() < needed {
            let add = (needed - self.stack.len() + 128).max(1024);
            let new_len = self.stack.len() + add;
            self.stack.resize(new_len, 0);
        }

        self.frames.push(Frame {
            fp,
            sp,
            ip: 0,
            flags: 0,
            func,
        });

        Ok(())
    }

    /// Dispatch a host function: pop typed arguments in reverse,
    /// invoke, and push the result unless the callable moved the frame
    /// pointer (it already arranged the stack in that case).
    fn call_host(&mut self, ctx: &HostCtx<'_>, host: &Arc<HostFunction>) -> Result<(), Trap> {
        let nargs = host.sig.params.len();
        let mut args = vec![0u64; nargs];
        for slot in args.iter_mut().rev() {
            *slot = self.pop_u64();
        }

        let depth_before = self.frames.len();
        let ret = (host.f)(self, ctx, &args);

        if self.frames.len() != depth_before {
            return Ok(());
        }

        if !host.sig.results.is_empty() {
            if let Some(v) = ret {
                self.push_u64(v);
            }
        }

        Ok(())
    }

    /// Arrange a synthetic call used for signal delivery: when the
    /// called function returns, control continues where it had been,
    /// with `prev_ret` as the pending return value.
    pub fn setup_into_function(
        &mut self,
        prev_ret: i64,
        fn_index: i64,
        args: &[u64],
    ) -> Result<(), Trap> {
        let fi = self.frames.len() - 1;
        if self.frames[fi].func.returns {
            self.push_u64(prev_ret as u64);
        }

        let compiled = match self.module.func(fn_index as usize) {
            Some(FuncKind::Compiled(c)) => Arc::clone(c),
            _ => return Err(Trap::InvalidFunctionIndex(fn_index)),
        };

        for &a in args {
            self.push_u64(a);
        }

        self.push_frame(compiled)?;
        let fi = self.frames.len() - 1;
        self.frames[fi].flags = NO_RETURN_VALUE;
        Ok(())
    }

    // ---- setjmp / longjmp ----------------------------------------------

    /// Snapshot the current frame for setjmp.
    pub fn get_context(&self) -> JmpBuf {
        let fi = self.frames.len() - 1;
        let frame = &self.frames[fi];
        JmpBuf {
            sp: frame.sp as u32,
            ip: frame.ip as u32,
            frame: fi as u32,
        }
    }

    /// Restore an earlier snapshot and push `val` as the next value
    /// the guest observes. Only unwinding toward older frames is
    /// legal.
    pub fn set_context(&mut self, buf: &JmpBuf, val: u64) -> Result<(), Trap> {
        let fi = self.frames.len() - 1;
        if fi < buf.frame as usize {
            return Err(Trap::LongjmpWrongDirection);
        }

        self.frames.truncate(buf.frame as usize + 1);
        let fi = self.frames.len() - 1;
        self.frames[fi].sp = buf.sp as i32 as i64;
        self.frames[fi].ip = buf.ip as i32 as i64;

        self.push_u64(val);
        Ok(())
    }

    // ---- fork ----------------------------------------------------------

    /// Copy the full interpreter state against a new memory. The child
    /// has its own abort flag and dispatch table.
    pub fn fork(&self, memory: Arc<Mutex<VirtualMemory>>) -> Vm {
        Vm {
            pid: self.pid,
            frames: self.frames.clone(),
            stack: self.stack.clone(),
            globals: self.globals.clone(),
            memory,
            module: Arc::clone(&self.module),
            func_table: new_func_table(),
            recover_panic: self.recover_panic,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    // ---- diagnostics ---------------------------------------------------

    /// Where execution currently is, as `name +0xip`.
    pub fn location(&self) -> String {
        let fi = self.frames.len() - 1;
        let frame = &self.frames[fi];
        format!(
            "{} {} +{:#x}",
            frame.func.name,
            self.nearest_offset(frame)
                .map(|o| format!("@{:#x}", o))
                .unwrap_or_else(|| "<unknown>".to_string()),
            frame.ip
        )
    }

    /// Render the call stack, innermost frame first.
    pub fn backtrace(&self) -> String {
        let mut out = String::new();
        for frame in self.frames.iter().rev() {
            let _ = write!(out, "{}(", frame.func.name);
            for i in 0..frame.func.args {
                let val = self.stack[(frame.fp + i as i64) as usize];
                if i + 1 < frame.func.args {
                    let _ = write!(out, "{:#x}, ", val);
                } else {
                    let _ = write!(out, "{:#x}", val);
                }
            }
            let _ = writeln!(
                out,
                ")\n    {} +{:#x}",
                self.nearest_offset(frame)
                    .map(|o| format!("@{:#x}", o))
                    .unwrap_or_else(|| "<unknown>".to_string()),
                frame.ip
            );
        }
        out
    }

    fn nearest_offset(&self, frame: &Frame) -> Option<u32> {
        let mut ip = frame.ip;
        while ip > 0 {
            if let Some(off) = frame.func.offsets.get(&(ip as usize)) {
                return Some(*off);
            }
            ip -= 1;
        }
        None
    }

    // ---- operand stack and immediates ---------------------------------

    pub(super) fn push_u64(&mut self, v: u64) {
        let fi = self.frames.len() - 1;
        let sp = self.frames[fi].sp + 1;
        if sp as usize >= self.stack.len() {
            let new_len = self.stack.len() + 1024;
            self.stack.resize(new_len, 0);
        }
        self.stack[sp as usize] = v;
        self.frames[fi].sp = sp;
    }

    pub(super) fn push_i64(&mut self, v: i64) {
        self.push_u64(v as u64);
    }

    pub(super) fn push_u32(&mut self, v: u32) {
        self.push_u64(v as u64);
    }

    pub(super) fn push_i32(&mut self, v: i32) {
        self.push_u64(v as u32 as u64);
    }

    pub(super) fn push_f32(&mut self, v: f32) {
        self.push_u64(v.to_bits() as u64);
    }

    pub(super) fn push_f64(&mut self, v: f64) {
        self.push_u64(v.to_bits());
    }

    pub(super) fn push_bool(&mut self, v: bool) {
        self.push_u64(u64::from(v));
    }

    pub(super) fn pop_u64(&mut self) -> u64 {
        let fi = self.frames.len() - 1;
        let sp = self.frames[fi].sp;
        let v = self.stack[sp as usize];
        self.frames[fi].sp = sp - 1;
        v
    }

    pub(super) fn pop_i64(&mut self) -> i64 {
        self.pop_u64() as i64
    }

    pub(super) fn pop_u32(&mut self) -> u32 {
        self.pop_u64() as u32
    }

    pub(super) fn pop_i32(&mut self) -> i32 {
        self.pop_u64() as u32 as i32
    }

    pub(super) fn pop_f32(&mut self) -> f32 {
        f32::from_bits(self.pop_u64() as u32)
    }

    pub(super) fn pop_f64(&mut self) -> f64 {
        f64::from_bits(self.pop_u64())
    }

    pub(super) fn fetch_u8(&mut self) -> u8 {
        let fi = self.frames.len() - 1;
        let frame = &mut self.frames[fi];
        let ip = frame.ip as usize;
        let v = frame.func.code[ip];
        frame.ip += 1;
        v
    }

    pub(super) fn fetch_u32(&mut self) -> u32 {
        let fi = self.frames.len() - 1;
        let frame = &mut self.frames[fi];
        let ip = frame.ip as usize;
        let c = &frame.func.code;
        let v = u32::from_le_bytes([c[ip], c[ip + 1], c[ip + 2], c[ip + 3]]);
        frame.ip += 4;
        v
    }

    pub(super) fn fetch_i32(&mut self) -> i32 {
        self.fetch_u32() as i32
    }

    pub(super) fn fetch_u64(&mut self) -> u64 {
        let fi = self.frames.len() - 1;
        let frame = &mut self.frames[fi];
        let ip = frame.ip as usize;
        let c = &frame.func.code;
        let v = u64::from_le_bytes([
            c[ip],
            c[ip + 1],
            c[ip + 2],
            c[ip + 3],
            c[ip + 4],
            c[ip + 5],
            c[ip + 6],
            c[ip + 7],
        ]);
        frame.ip += 8;
        v
    }

    pub(super) fn fetch_i64(&mut self) -> i64 {
        self.fetch_u64() as i64
    }

    // ---- locals and globals -------------------------------------------

    pub(super) fn local_get(&mut self, index: u32) {
        let fi = self.frames.len() - 1;
        let v = self.stack[(self.frames[fi].fp + index as i64) as usize];
        self.push_u64(v);
    }

    pub(super) fn local_set(&mut self, index: u32) {
        let v = self.pop_u64();
        let fi = self.frames.len() - 1;
        self.stack[(self.frames[fi].fp + index as i64) as usize] = v;
    }

    pub(super) fn local_tee(&mut self, index: u32) {
        let fi = self.frames.len() - 1;
        let v = self.stack[self.frames[fi].sp as usize];
        self.stack[(self.frames[fi].fp + index as i64) as usize] = v;
    }

    pub(super) fn global_get(&mut self, index: u32) {
        let v = self.globals[index as usize];
        self.push_u64(v);
    }

    pub(super) fn global_set(&mut self, index: u32) {
        let v = self.pop_u64();
        self.globals[index as usize] = v;
    }

    // ---- linear memory -------------------------------------------------

    /// Fetch the static offset, pop the dynamic base, and hand the
    /// projected guest range to `f`.
    pub(super) fn with_mem<R>(
        &mut self,
        sz: i32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, Trap> {
        let addr = self.fetch_u32().wrapping_add(self.pop_u32()) as i32;
        let memory = Arc::clone(&self.memory);
        let mut mem = memory.lock().unwrap();
        match mem.project(addr, sz) {
            Ok(slice) => Ok(f(slice)),
            Err(_) => Err(Trap::MemoryAccess { addr, size: sz }),
        }
    }

    pub(super) fn mem_pages(&self) -> i32 {
        (self.memory.lock().unwrap().size() / WASM_PAGE_SIZE as usize) as i32
    }

    pub(super) fn mem_grow(&mut self, pages: i32) {
        let mut mem = self.memory.lock().unwrap();
        if let Err(err) = mem.grow(pages * WASM_PAGE_SIZE) {
            log::debug!("memory.grow failed: {}", err);
        }
    }

    pub(super) fn table_lookup(&self, elem: i32, type_index: u32) -> Result<i64, Trap> {
        let func_index = *self
            .module
            .module
            .table
            .get(elem as usize)
            .ok_or(Trap::UndefinedTableElement(elem))?;

        let declared = self
            .module
            .module
            .types
            .get(type_index as usize)
            .ok_or(Trap::IndirectSignatureMismatch(type_index))?;
        let actual = &self
            .module
            .module
            .funcs
            .get(func_index as usize)
            .ok_or(Trap::InvalidFunctionIndex(func_index as i64))?
            .sig;

        if actual != declared {
            return Err(Trap::IndirectSignatureMismatch(type_index));
        }

        Ok(func_index as i64)
    }
}
