//! Decoded WebAssembly module model
//!
//! This is the contract between the binary decoder/validator (an
//! external collaborator, see `loader::ModuleDecoder`) and the
//! execution core. A decoded module carries its full function index
//! space with imports already resolved: host functions contributed by
//! the environment module come first, compiled bodies after.
//!
//! Function bodies are streams of [`Instr`] values: the original MVP
//! opcode byte plus its decoded immediate. Structured control flow
//! (block/loop/if) is still present here; `exec::compile` lowers it.

pub mod op;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::exec::{HostCtx, Vm};

/// A WebAssembly value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

/// A function signature: parameter and result types.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionSig {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

impl FunctionSig {
    pub fn new(params: Vec<ValueType>, results: Vec<ValueType>) -> Self {
        Self { params, results }
    }
}

/// Result arity of a block/loop/if construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValueType),
}

impl BlockType {
    pub fn arity(&self) -> usize {
        match self {
            BlockType::Empty => 0,
            BlockType::Value(_) => 1,
        }
    }
}

/// Immediate operand of a decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Imm {
    None,
    Block(BlockType),
    /// Relative branch depth for br / br_if.
    Depth(u32),
    BrTable {
        targets: Vec<u32>,
        default: u32,
    },
    /// Function, local, global, or type index.
    Index(u32),
    Mem {
        align: u32,
        offset: u32,
    },
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

/// One decoded instruction: opcode byte plus immediate.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: u8,
    pub imm: Imm,
}

impl Instr {
    /// An instruction with no immediate.
    pub fn op(op: u8) -> Self {
        Self { op, imm: Imm::None }
    }

    pub fn block(bt: BlockType) -> Self {
        Self {
            op: op::BLOCK,
            imm: Imm::Block(bt),
        }
    }

    pub fn loop_(bt: BlockType) -> Self {
        Self {
            op: op::LOOP,
            imm: Imm::Block(bt),
        }
    }

    pub fn if_(bt: BlockType) -> Self {
        Self {
            op: op::IF,
            imm: Imm::Block(bt),
        }
    }

    pub fn else_() -> Self {
        Self::op(op::ELSE)
    }

    pub fn end() -> Self {
        Self::op(op::END)
    }

    pub fn br(depth: u32) -> Self {
        Self {
            op: op::BR,
            imm: Imm::Depth(depth),
        }
    }

    pub fn br_if(depth: u32) -> Self {
        Self {
            op: op::BR_IF,
            imm: Imm::Depth(depth),
        }
    }

    pub fn br_table(targets: Vec<u32>, default: u32) -> Self {
        Self {
            op: op::BR_TABLE,
            imm: Imm::BrTable { targets, default },
        }
    }

    pub fn call(index: u32) -> Self {
        Self {
            op: op::CALL,
            imm: Imm::Index(index),
        }
    }

    pub fn call_indirect(type_index: u32) -> Self {
        Self {
            op: op::CALL_INDIRECT,
            imm: Imm::Index(type_index),
        }
    }

    pub fn local_get(index: u32) -> Self {
        Self {
            op: op::LOCAL_GET,
            imm: Imm::Index(index),
        }
    }

    pub fn local_set(index: u32) -> Self {
        Self {
            op: op::LOCAL_SET,
            imm: Imm::Index(index),
        }
    }

    pub fn local_tee(index: u32) -> Self {
        Self {
            op: op::LOCAL_TEE,
            imm: Imm::Index(index),
        }
    }

    pub fn global_get(index: u32) -> Self {
        Self {
            op: op::GLOBAL_GET,
            imm: Imm::Index(index),
        }
    }

    pub fn global_set(index: u32) -> Self {
        Self {
            op: op::GLOBAL_SET,
            imm: Imm::Index(index),
        }
    }

    pub fn load(op: u8, offset: u32) -> Self {
        Self {
            op,
            imm: Imm::Mem { align: 0, offset },
        }
    }

    pub fn store(op: u8, offset: u32) -> Self {
        Self {
            op,
            imm: Imm::Mem { align: 0, offset },
        }
    }

    pub fn i32_const(v: i32) -> Self {
        Self {
            op: op::I32_CONST,
            imm: Imm::I32(v),
        }
    }

    pub fn i64_const(v: i64) -> Self {
        Self {
            op: op::I64_CONST,
            imm: Imm::I64(v),
        }
    }

    pub fn f32_const(v: f32) -> Self {
        Self {
            op: op::F32_CONST,
            imm: Imm::F32(v),
        }
    }

    pub fn f64_const(v: f64) -> Self {
        Self {
            op: op::F64_CONST,
            imm: Imm::F64(v),
        }
    }
}

/// A decoded function body.
#[derive(Debug, Clone, Default)]
pub struct FunctionBody {
    /// Run-length encoded extra locals: (count, type).
    pub locals: Vec<(u32, ValueType)>,
    pub code: Vec<Instr>,
    /// Byte offset of each instruction in the original binary, used for
    /// diagnostics only. May be empty when the decoder drops them.
    pub offsets: Vec<u32>,
}

impl FunctionBody {
    /// Total count of declared locals (excluding parameters).
    pub fn local_count(&self) -> usize {
        self.locals.iter().map(|(n, _)| *n as usize).sum()
    }
}

/// The callable carried by a host function. The interpreter passes the
/// running VM, the ambient task context, and the popped arguments; the
/// return value (if the signature declares one) is pushed back unless
/// the callable changed the active frame.
pub type HostFn = Arc<dyn Fn(&mut Vm, &HostCtx<'_>, &[u64]) -> Option<u64> + Send + Sync>;

/// A host-implemented function.
#[derive(Clone)]
pub struct HostFunc {
    pub f: HostFn,
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostFunc")
    }
}

/// An entry in the function index space.
#[derive(Debug, Clone)]
pub struct Function {
    pub sig: FunctionSig,
    pub body: Option<FunctionBody>,
    pub host: Option<HostFunc>,
    pub name: Option<String>,
}

impl Function {
    pub fn compiled(sig: FunctionSig, body: FunctionBody, name: Option<String>) -> Self {
        Self {
            sig,
            body: Some(body),
            host: None,
            name,
        }
    }

    pub fn host(sig: FunctionSig, name: &str, f: HostFn) -> Self {
        Self {
            sig,
            body: None,
            host: Some(HostFunc { f }),
            name: Some(name.to_string()),
        }
    }

    pub fn is_host(&self) -> bool {
        self.host.is_some()
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unknown>")
    }
}

/// What an export refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Function,
    Table,
    Memory,
    Global,
}

#[derive(Debug, Clone, Copy)]
pub struct ExportEntry {
    pub kind: ExternalKind,
    pub index: u32,
}

/// Initializer expression of a global, already decoded to its constant
/// form (or a reference to an imported global).
#[derive(Debug, Clone, Copy)]
pub enum GlobalInit {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Global(u32),
}

#[derive(Debug, Clone)]
pub struct GlobalEntry {
    pub ty: ValueType,
    pub mutable: bool,
    pub init: GlobalInit,
}

/// Linear memory limits, in 64 KiB pages.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    pub initial_pages: u32,
    pub maximum_pages: Option<u32>,
}

/// A fully decoded module, imports resolved.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub types: Vec<FunctionSig>,
    /// Function index space; imported host functions come first.
    pub funcs: Vec<Function>,
    pub globals: Vec<GlobalEntry>,
    /// Table index space 0: function indices for call_indirect.
    pub table: Vec<u32>,
    pub memory: Option<MemoryDescriptor>,
    /// Initial contents of linear memory, data segments applied.
    pub memory_image: Vec<u8>,
    pub exports: HashMap<String, ExportEntry>,
    pub start: Option<u32>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate a global initializer down to its raw 64-bit value.
    /// Integers are sign-extended, floats carried as their bit pattern.
    pub fn eval_init(&self, init: &GlobalInit) -> Option<u64> {
        match *init {
            GlobalInit::I32(v) => Some(v as i64 as u64),
            GlobalInit::I64(v) => Some(v as u64),
            GlobalInit::F32(v) => Some(v.to_bits() as u64),
            GlobalInit::F64(v) => Some(v.to_bits()),
            GlobalInit::Global(i) => {
                let g = self.globals.get(i as usize)?;
                self.eval_init(&g.init)
            }
        }
    }

    pub fn export(&self, name: &str) -> Option<&ExportEntry> {
        self.exports.get(name)
    }

    /// Resolve an exported global's initial value as an i32.
    pub fn exported_global_i32(&self, name: &str) -> Option<i32> {
        let entry = self.exports.get(name)?;
        let g = self.globals.get(entry.index as usize)?;
        self.eval_init(&g.init).map(|v| v as i32)
    }

    /// Look up an exported function by name.
    pub fn export_function(&self, name: &str) -> Option<(u32, &Function)> {
        let entry = self.exports.get(name)?;
        if entry.kind != ExternalKind::Function {
            return None;
        }
        self.funcs.get(entry.index as usize).map(|f| (entry.index, f))
    }
}
