//! Bytecode compilation
//!
//! Lowers a decoded function body into the flat form the interpreter
//! executes: structured control flow (block/loop/if/else, br, br_if,
//! br_table) becomes absolute jumps with pre-computed stack fixups, so
//! the main loop never re-parses block structure.
//!
//! The lowered stream keeps the original opcode bytes for regular
//! instructions and encodes immediates raw little-endian. Five
//! synthetic opcodes carry the control flow:
//!
//! - `JMP   addr:i64`
//! - `JMP_Z addr:i64`: pop an i32, jump when zero
//! - `JMP_NZ addr:i64 preserve:u8 discard:i64`: pop an i32, jump when
//!   non-zero, dropping `discard` slots (optionally keeping the top)
//! - `DISCARD n:i64` / `DISCARD_PRESERVE_TOP n:i64`
//!
//! `br_table` arms live in side tables; the instruction stream only
//! carries the table index.

use std::collections::HashMap;
use std::fmt;

use crate::wasm::{op, Imm, Instr, Module};

/// One pre-baked branch destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct Target {
    pub addr: i64,
    pub discard: i64,
    pub preserve_top: bool,
    /// Branch out of the function entirely.
    pub return_: bool,
}

/// The arms of one lowered br_table.
#[derive(Debug, Clone, Default)]
pub struct BranchTable {
    pub targets: Vec<Target>,
    pub default_target: Target,
}

/// A function lowered for execution.
#[derive(Debug)]
pub struct CompiledFunction {
    pub code: Vec<u8>,
    pub branch_tables: Vec<BranchTable>,
    /// Maximum operand-stack depth reached while executing the body.
    pub max_depth: usize,
    /// Locals including arguments.
    pub total_local_vars: usize,
    pub args: usize,
    pub returns: bool,
    pub name: String,
    /// Lowered ip -> original byte offset, for diagnostics only.
    pub offsets: HashMap<usize, u32>,
}

/// Compilation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The function index does not name a compiled (non-host) function.
    NotCompiled(usize),
    /// Branch depth reaches outside the block stack.
    BadBranchDepth(u32),
    /// Block/end pairs don't balance.
    UnbalancedBlocks,
    /// The operand stack model went negative; the body is invalid.
    StackUnderflow,
    /// A call names an unknown function or type.
    UnknownIndex(u32),
    /// An instruction has the wrong immediate for its opcode.
    BadImmediate(u8),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCompiled(i) => write!(f, "function {} has no body to compile", i),
            Self::BadBranchDepth(d) => write!(f, "branch depth {} exceeds block nesting", d),
            Self::UnbalancedBlocks => write!(f, "unbalanced block structure"),
            Self::StackUnderflow => write!(f, "operand stack model underflow"),
            Self::UnknownIndex(i) => write!(f, "unknown function or type index {}", i),
            Self::BadImmediate(op) => write!(f, "wrong immediate for opcode {:#x}", op),
        }
    }
}

impl std::error::Error for CompileError {}

struct Block {
    /// Jump target for branches to a loop; None for block/if (forward).
    loop_start: Option<i64>,
    /// Values the block leaves on the stack at its end.
    arity: usize,
    entry_depth: i64,
    /// Byte positions of i64 placeholders to patch with the end address.
    jmp_fixups: Vec<usize>,
    /// (branch table index, arm index or None for default) awaiting the
    /// end address.
    table_fixups: Vec<(usize, Option<usize>)>,
    /// Pending JMP_Z of an `if` with no `else` seen yet.
    else_fixup: Option<usize>,
    is_if: bool,
}

impl Block {
    /// Stack depth a branch to this block must restore.
    fn branch_arity(&self) -> usize {
        if self.loop_start.is_some() {
            0
        } else {
            self.arity
        }
    }
}

struct Compiler<'m> {
    module: &'m Module,
    code: Vec<u8>,
    tables: Vec<BranchTable>,
    blocks: Vec<Block>,
    depth: i64,
    max_depth: i64,
    offsets: HashMap<usize, u32>,
    /// Nesting level at which control became unreachable, if any.
    dead_at: Option<usize>,
}

/// Compile one function of `module` into its lowered form.
pub fn compile_function(module: &Module, index: usize) -> Result<CompiledFunction, CompileError> {
    let func = module
        .funcs
        .get(index)
        .ok_or(CompileError::UnknownIndex(index as u32))?;
    let body = func.body.as_ref().ok_or(CompileError::NotCompiled(index))?;

    let mut c = Compiler {
        module,
        code: Vec::with_capacity(body.code.len() * 4),
        tables: Vec::new(),
        blocks: Vec::new(),
        depth: 0,
        max_depth: 0,
        offsets: HashMap::new(),
        dead_at: None,
    };

    let returns = !func.sig.results.is_empty();

    // The function body behaves like an outermost block; branching to
    // it leaves the function.
    c.blocks.push(Block {
        loop_start: None,
        arity: usize::from(returns),
        entry_depth: 0,
        jmp_fixups: Vec::new(),
        table_fixups: Vec::new(),
        else_fixup: None,
        is_if: false,
    });

    for (i, instr) in body.code.iter().enumerate() {
        if let Some(off) = body.offsets.get(i) {
            c.offsets.insert(c.code.len(), *off);
        }
        c.instruction(instr)?;
        if c.blocks.is_empty() {
            if i + 1 != body.code.len() {
                return Err(CompileError::UnbalancedBlocks);
            }
            break;
        }
    }

    if !c.blocks.is_empty() {
        return Err(CompileError::UnbalancedBlocks);
    }

    let args = func.sig.params.len();
    Ok(CompiledFunction {
        code: c.code,
        branch_tables: c.tables,
        max_depth: c.max_depth as usize,
        total_local_vars: args + body.local_count(),
        args,
        returns,
        name: func.name().to_string(),
        offsets: c.offsets,
    })
}

impl<'m> Compiler<'m> {
    fn instruction(&mut self, instr: &Instr) -> Result<(), CompileError> {
        // Skip code made unreachable by br/return/unreachable, while
        // still tracking block nesting so the right `end` revives us.
        if let Some(level) = self.dead_at {
            match instr.op {
                op::BLOCK | op::LOOP | op::IF => {
                    self.blocks.push(Block {
                        loop_start: None,
                        arity: 0,
                        entry_depth: 0,
                        jmp_fixups: Vec::new(),
                        table_fixups: Vec::new(),
                        else_fixup: None,
                        is_if: false,
                    });
                    return Ok(());
                }
                op::ELSE if self.blocks.len() == level => {
                    self.dead_at = None;
                    // fall through to the live else handling
                }
                op::END => {
                    if self.blocks.len() > level {
                        self.blocks.pop();
                        return Ok(());
                    }
                    self.dead_at = None;
                    // fall through to the live end handling
                }
                _ => return Ok(()),
            }
        }

        match instr.op {
            op::NOP => self.emit(op::NOP),
            op::UNREACHABLE => {
                self.emit(op::UNREACHABLE);
                self.dead_at = Some(self.blocks.len());
            }

            op::BLOCK | op::LOOP => {
                let bt = match &instr.imm {
                    Imm::Block(bt) => *bt,
                    _ => return Err(CompileError::BadImmediate(instr.op)),
                };
                self.blocks.push(Block {
                    loop_start: (instr.op == op::LOOP).then_some(self.code.len() as i64),
                    arity: bt.arity(),
                    entry_depth: self.depth,
                    jmp_fixups: Vec::new(),
                    table_fixups: Vec::new(),
                    else_fixup: None,
                    is_if: false,
                });
            }

            op::IF => {
                let bt = match &instr.imm {
                    Imm::Block(bt) => *bt,
                    _ => return Err(CompileError::BadImmediate(instr.op)),
                };
                self.pop(1)?;
                self.emit(op::JMP_Z);
                let fixup = self.emit_i64_placeholder();
                self.blocks.push(Block {
                    loop_start: None,
                    arity: bt.arity(),
                    entry_depth: self.depth,
                    jmp_fixups: Vec::new(),
                    table_fixups: Vec::new(),
                    else_fixup: Some(fixup),
                    is_if: true,
                });
            }

            op::ELSE => {
                let here;
                {
                    let block = self.blocks.last_mut().ok_or(CompileError::UnbalancedBlocks)?;
                    if !block.is_if {
                        return Err(CompileError::UnbalancedBlocks);
                    }
                    self.code.push(op::JMP);
                    let fixup = self.code.len();
                    self.code.extend_from_slice(&0i64.to_le_bytes());
                    here = self.code.len() as i64;
                    block.jmp_fixups.push(fixup);
                }
                let block = self.blocks.last_mut().ok_or(CompileError::UnbalancedBlocks)?;
                if let Some(pos) = block.else_fixup.take() {
                    patch_i64(&mut self.code, pos, here);
                }
                self.depth = block.entry_depth;
            }

            op::END => {
                let block = self.blocks.pop().ok_or(CompileError::UnbalancedBlocks)?;
                let here = self.code.len() as i64;
                if let Some(pos) = block.else_fixup {
                    patch_i64(&mut self.code, pos, here);
                }
                for pos in block.jmp_fixups {
                    patch_i64(&mut self.code, pos, here);
                }
                for (table, arm) in block.table_fixups {
                    let t = &mut self.tables[table];
                    match arm {
                        Some(i) => t.targets[i].addr = here,
                        None => t.default_target.addr = here,
                    }
                }
                self.depth = block.entry_depth + block.arity as i64;
                self.note_depth();
            }

            op::BR => {
                let depth = self.branch_depth(instr)?;
                self.branch_to(depth)?;
                self.dead_at = Some(self.blocks.len());
            }

            op::BR_IF => {
                let depth = self.branch_depth(instr)?;
                self.pop(1)?;
                let idx = self.block_index(depth)?;
                let (preserve, discard) = {
                    let block = &self.blocks[idx];
                    let arity = if idx == 0 { block.arity } else { block.branch_arity() };
                    self.fixup_amounts(block.entry_depth, arity)
                };

                self.emit(op::JMP_NZ);
                let pos = self.emit_i64_placeholder();
                self.emit(u8::from(preserve));
                self.emit_i64(discard);

                let block = &mut self.blocks[idx];
                if let Some(start) = block.loop_start {
                    patch_i64(&mut self.code, pos, start);
                } else {
                    block.jmp_fixups.push(pos);
                }
            }

            op::BR_TABLE => {
                let (targets, default) = match &instr.imm {
                    Imm::BrTable { targets, default } => (targets.clone(), *default),
                    _ => return Err(CompileError::BadImmediate(instr.op)),
                };
                self.pop(1)?;

                let table_index = self.tables.len();
                self.tables.push(BranchTable::default());

                let mut arms = Vec::with_capacity(targets.len());
                for (arm, d) in targets.iter().enumerate() {
                    arms.push(self.table_target(table_index, Some(arm), *d)?);
                }
                let default_target = self.table_target(table_index, None, default)?;
                let t = &mut self.tables[table_index];
                t.targets = arms;
                t.default_target = default_target;

                self.emit(op::BR_TABLE);
                self.emit_i64(table_index as i64);
                self.dead_at = Some(self.blocks.len());
            }

            op::RETURN => {
                self.emit(op::RETURN);
                self.dead_at = Some(self.blocks.len());
            }

            op::CALL => {
                let index = self.index_imm(instr)?;
                let (params, results) = {
                    let func = self
                        .module
                        .funcs
                        .get(index as usize)
                        .ok_or(CompileError::UnknownIndex(index))?;
                    (func.sig.params.len(), func.sig.results.len())
                };
                self.pop(params as i64)?;
                self.push(results as i64);
                self.emit(op::CALL);
                self.emit_u32(index);
            }

            op::CALL_INDIRECT => {
                let type_index = self.index_imm(instr)?;
                let (params, results) = {
                    let sig = self
                        .module
                        .types
                        .get(type_index as usize)
                        .ok_or(CompileError::UnknownIndex(type_index))?;
                    (sig.params.len(), sig.results.len())
                };
                self.pop(1)?; // table element index
                self.pop(params as i64)?;
                self.push(results as i64);
                self.emit(op::CALL_INDIRECT);
                self.emit_u32(type_index);
            }

            op::DROP => {
                self.pop(1)?;
                self.emit(op::DROP);
            }

            op::SELECT => {
                self.pop(2)?;
                self.emit(op::SELECT);
            }

            op::LOCAL_GET | op::GLOBAL_GET => {
                let index = self.index_imm(instr)?;
                self.push(1);
                self.emit(instr.op);
                self.emit_u32(index);
            }

            op::LOCAL_SET | op::GLOBAL_SET => {
                let index = self.index_imm(instr)?;
                self.pop(1)?;
                self.emit(instr.op);
                self.emit_u32(index);
            }

            op::LOCAL_TEE => {
                let index = self.index_imm(instr)?;
                self.emit(instr.op);
                self.emit_u32(index);
            }

            op::I32_LOAD..=op::I64_LOAD32_U => {
                let offset = self.mem_imm(instr)?;
                self.emit(instr.op);
                self.emit_u32(offset);
            }

            op::I32_STORE..=op::I64_STORE32 => {
                let offset = self.mem_imm(instr)?;
                self.pop(2)?;
                self.emit(instr.op);
                self.emit_u32(offset);
            }

            op::MEMORY_SIZE => {
                self.push(1);
                self.emit(op::MEMORY_SIZE);
                self.emit(0); // reserved
            }

            op::MEMORY_GROW => {
                self.emit(op::MEMORY_GROW);
                self.emit(0); // reserved
            }

            op::I32_CONST => {
                let v = match instr.imm {
                    Imm::I32(v) => v,
                    _ => return Err(CompileError::BadImmediate(instr.op)),
                };
                self.push(1);
                self.emit(op::I32_CONST);
                self.code.extend_from_slice(&v.to_le_bytes());
            }

            op::I64_CONST => {
                let v = match instr.imm {
                    Imm::I64(v) => v,
                    _ => return Err(CompileError::BadImmediate(instr.op)),
                };
                self.push(1);
                self.emit(op::I64_CONST);
                self.code.extend_from_slice(&v.to_le_bytes());
            }

            op::F32_CONST => {
                let v = match instr.imm {
                    Imm::F32(v) => v,
                    _ => return Err(CompileError::BadImmediate(instr.op)),
                };
                self.push(1);
                self.emit(op::F32_CONST);
                self.code.extend_from_slice(&v.to_bits().to_le_bytes());
            }

            op::F64_CONST => {
                let v = match instr.imm {
                    Imm::F64(v) => v,
                    _ => return Err(CompileError::BadImmediate(instr.op)),
                };
                self.push(1);
                self.emit(op::F64_CONST);
                self.code.extend_from_slice(&v.to_bits().to_le_bytes());
            }

            other => {
                // Numeric, comparison, and conversion ops carry no
                // immediates; their stack behavior is positional.
                let delta = numeric_delta(other).ok_or(CompileError::BadImmediate(other))?;
                if delta < 0 {
                    self.pop(-delta)?;
                } else {
                    self.push(delta);
                }
                self.emit(other);
            }
        }

        Ok(())
    }

    // ---- branch helpers ------------------------------------------------

    fn branch_depth(&self, instr: &Instr) -> Result<u32, CompileError> {
        match instr.imm {
            Imm::Depth(d) => Ok(d),
            _ => Err(CompileError::BadImmediate(instr.op)),
        }
    }

    fn block_index(&self, depth: u32) -> Result<usize, CompileError> {
        self.blocks
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or(CompileError::BadBranchDepth(depth))
    }

    /// Discard bookkeeping for a branch landing at `entry + arity`.
    fn fixup_amounts(&self, entry_depth: i64, arity: usize) -> (bool, i64) {
        let target = entry_depth + arity as i64;
        if arity == 1 {
            let place = self.depth - target + 1;
            (place > 1, if place > 1 { place } else { 0 })
        } else {
            let place = self.depth - target;
            (false, place.max(0))
        }
    }

    /// Lower an unconditional branch.
    fn branch_to(&mut self, depth: u32) -> Result<(), CompileError> {
        let idx = self.block_index(depth)?;

        if idx == 0 {
            // Branching to the function block leaves the function; the
            // return value (if any) is already on top and everything
            // beneath it dies with the frame.
            self.emit(op::RETURN);
            return Ok(());
        }

        let (arity, entry_depth, loop_start) = {
            let b = &self.blocks[idx];
            (b.branch_arity(), b.entry_depth, b.loop_start)
        };
        let (preserve, discard) = self.fixup_amounts(entry_depth, arity);
        if preserve {
            self.emit(op::DISCARD_PRESERVE_TOP);
            self.emit_i64(discard);
        } else if discard > 0 {
            self.emit(op::DISCARD);
            self.emit_i64(discard);
        }

        self.emit(op::JMP);
        let pos = self.emit_i64_placeholder();
        match loop_start {
            Some(start) => patch_i64(&mut self.code, pos, start),
            None => self.blocks[idx].jmp_fixups.push(pos),
        }
        Ok(())
    }

    /// Build one br_table arm.
    fn table_target(
        &mut self,
        table: usize,
        arm: Option<usize>,
        depth: u32,
    ) -> Result<Target, CompileError> {
        let idx = self.block_index(depth)?;
        if idx == 0 {
            return Ok(Target {
                return_: true,
                ..Target::default()
            });
        }

        let (arity, entry_depth, loop_start) = {
            let b = &self.blocks[idx];
            (b.branch_arity(), b.entry_depth, b.loop_start)
        };
        let (preserve_top, discard) = self.fixup_amounts(entry_depth, arity);
        let mut target = Target {
            addr: 0,
            discard,
            preserve_top,
            return_: false,
        };
        match loop_start {
            Some(start) => target.addr = start,
            None => self.blocks[idx].table_fixups.push((table, arm)),
        }
        Ok(target)
    }

    // ---- emission ------------------------------------------------------

    fn emit(&mut self, b: u8) {
        self.code.push(b);
    }

    fn emit_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i64(&mut self, v: i64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i64_placeholder(&mut self) -> usize {
        let pos = self.code.len();
        self.code.extend_from_slice(&0i64.to_le_bytes());
        pos
    }

    fn index_imm(&self, instr: &Instr) -> Result<u32, CompileError> {
        match instr.imm {
            Imm::Index(i) => Ok(i),
            _ => Err(CompileError::BadImmediate(instr.op)),
        }
    }

    fn mem_imm(&self, instr: &Instr) -> Result<u32, CompileError> {
        match instr.imm {
            Imm::Mem { offset, .. } => Ok(offset),
            _ => Err(CompileError::BadImmediate(instr.op)),
        }
    }

    // ---- stack model ---------------------------------------------------

    fn push(&mut self, n: i64) {
        self.depth += n;
        self.note_depth();
    }

    fn pop(&mut self, n: i64) -> Result<(), CompileError> {
        self.depth -= n;
        if self.depth < 0 {
            return Err(CompileError::StackUnderflow);
        }
        Ok(())
    }

    fn note_depth(&mut self) {
        if self.depth > self.max_depth {
            self.max_depth = self.depth;
        }
    }
}

fn patch_i64(code: &mut [u8], pos: usize, v: i64) {
    code[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
}

/// Net stack effect of a no-immediate numeric/comparison/conversion op.
fn numeric_delta(opcode: u8) -> Option<i64> {
    Some(match opcode {
        // eqz tests are unary
        op::I32_EQZ | op::I64_EQZ => 0,
        // binary comparisons
        op::I32_EQ..=op::I32_GE_U => -1,
        op::I64_EQ..=op::I64_GE_U => -1,
        op::F32_EQ..=op::F32_GE => -1,
        op::F64_EQ..=op::F64_GE => -1,
        // unary integer ops
        op::I32_CLZ | op::I32_CTZ | op::I32_POPCNT => 0,
        op::I64_CLZ | op::I64_CTZ | op::I64_POPCNT => 0,
        // binary integer arithmetic
        op::I32_ADD..=op::I32_ROTR => -1,
        op::I64_ADD..=op::I64_ROTR => -1,
        // unary float ops
        op::F32_ABS..=op::F32_SQRT => 0,
        op::F64_ABS..=op::F64_SQRT => 0,
        // binary float arithmetic
        op::F32_ADD..=op::F32_COPYSIGN => -1,
        op::F64_ADD..=op::F64_COPYSIGN => -1,
        // conversions and reinterprets
        op::I32_WRAP_I64..=op::F64_REINTERPRET_I64 => 0,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::{BlockType, Function, FunctionBody, FunctionSig, ValueType};

    fn module_with_body(
        params: Vec<ValueType>,
        results: Vec<ValueType>,
        code: Vec<Instr>,
    ) -> Module {
        let mut m = Module::new();
        m.funcs.push(Function::compiled(
            FunctionSig::new(params, results),
            FunctionBody {
                locals: Vec::new(),
                code,
                offsets: Vec::new(),
            },
            Some("f".to_string()),
        ));
        m
    }

    #[test]
    fn test_straight_line() {
        let m = module_with_body(
            vec![],
            vec![ValueType::I32],
            vec![
                Instr::i32_const(1),
                Instr::i32_const(2),
                Instr::op(op::I32_ADD),
                Instr::end(),
            ],
        );
        let cf = compile_function(&m, 0).unwrap();

        assert!(cf.returns);
        assert_eq!(cf.max_depth, 2);
        // const(5) + const(5) + add(1)
        assert_eq!(cf.code.len(), 11);
        assert_eq!(cf.code[0], op::I32_CONST);
        assert_eq!(cf.code[10], op::I32_ADD);
    }

    #[test]
    fn test_if_else_lowering() {
        let m = module_with_body(
            vec![ValueType::I32],
            vec![ValueType::I32],
            vec![
                Instr::local_get(0),
                Instr::if_(BlockType::Value(ValueType::I32)),
                Instr::i32_const(10),
                Instr::else_(),
                Instr::i32_const(20),
                Instr::end(),
                Instr::end(),
            ],
        );
        let cf = compile_function(&m, 0).unwrap();

        // local.get; jmp_z -> else; const 10; jmp -> end; const 20
        assert_eq!(cf.code[5], op::JMP_Z);
        let else_addr = i64::from_le_bytes(cf.code[6..14].try_into().unwrap());
        // The else arm begins right after the then arm's closing JMP.
        let jmp_at = 14 + 5; // const(5 bytes) then JMP
        assert_eq!(cf.code[jmp_at], op::JMP);
        assert_eq!(else_addr as usize, jmp_at + 9);
        let end_addr = i64::from_le_bytes(cf.code[jmp_at + 1..jmp_at + 9].try_into().unwrap());
        assert_eq!(end_addr as usize, cf.code.len());
    }

    #[test]
    fn test_loop_branch_goes_backwards() {
        // loop { br 0 } is an infinite loop: the br must target the
        // loop start, not its end.
        let m = module_with_body(
            vec![],
            vec![],
            vec![
                Instr::loop_(BlockType::Empty),
                Instr::br(0),
                Instr::end(),
                Instr::end(),
            ],
        );
        let cf = compile_function(&m, 0).unwrap();

        assert_eq!(cf.code[0], op::JMP);
        let target = i64::from_le_bytes(cf.code[1..9].try_into().unwrap());
        assert_eq!(target, 0);
    }

    #[test]
    fn test_br_to_function_level_is_return() {
        let m = module_with_body(
            vec![],
            vec![ValueType::I32],
            vec![Instr::i32_const(3), Instr::br(0), Instr::end()],
        );
        let cf = compile_function(&m, 0).unwrap();
        assert_eq!(cf.code[5], op::RETURN);
    }

    #[test]
    fn test_block_br_discards_intermediate_values() {
        // block (result i32) { const 1; const 2; br 0 }: the branch
        // keeps the top value and discards the one beneath it.
        let m = module_with_body(
            vec![],
            vec![ValueType::I32],
            vec![
                Instr::block(BlockType::Value(ValueType::I32)),
                Instr::i32_const(1),
                Instr::i32_const(2),
                Instr::br(0),
                Instr::end(),
                Instr::end(),
            ],
        );
        let cf = compile_function(&m, 0).unwrap();

        assert_eq!(cf.code[10], op::DISCARD_PRESERVE_TOP);
        let n = i64::from_le_bytes(cf.code[11..19].try_into().unwrap());
        assert_eq!(n, 2);
        assert_eq!(cf.code[19], op::JMP);
        let target = i64::from_le_bytes(cf.code[20..28].try_into().unwrap());
        assert_eq!(target as usize, cf.code.len());
    }

    #[test]
    fn test_br_table_arms() {
        // block { block { br_table [1, 0] default 1 } }
        let m = module_with_body(
            vec![ValueType::I32],
            vec![],
            vec![
                Instr::block(BlockType::Empty),
                Instr::block(BlockType::Empty),
                Instr::local_get(0),
                Instr::br_table(vec![1, 0], 1),
                Instr::end(),
                Instr::end(),
                Instr::end(),
            ],
        );
        let cf = compile_function(&m, 0).unwrap();

        assert_eq!(cf.branch_tables.len(), 1);
        let table = &cf.branch_tables[0];
        assert_eq!(table.targets.len(), 2);
        // Arm 0 branches to the outer block's end (code end); arm 1 to
        // the inner block's end.
        assert_eq!(table.targets[0].addr as usize, cf.code.len());
        assert!(table.targets[1].addr <= table.targets[0].addr);
        assert_eq!(table.default_target.addr as usize, cf.code.len());
    }

    #[test]
    fn test_dead_code_is_dropped() {
        let m = module_with_body(
            vec![],
            vec![],
            vec![
                Instr::op(op::RETURN),
                Instr::i32_const(1),
                Instr::op(op::DROP),
                Instr::end(),
            ],
        );
        let cf = compile_function(&m, 0).unwrap();
        assert_eq!(cf.code, vec![op::RETURN]);
    }

    #[test]
    fn test_unbalanced_blocks_rejected() {
        let m = module_with_body(
            vec![],
            vec![],
            vec![Instr::block(BlockType::Empty), Instr::end()],
        );
        assert_eq!(
            compile_function(&m, 0).unwrap_err(),
            CompileError::UnbalancedBlocks
        );
    }

    #[test]
    fn test_host_function_not_compiled() {
        let mut m = Module::new();
        m.funcs.push(Function::host(
            FunctionSig::default(),
            "h",
            std::sync::Arc::new(|_, _, _| None),
        ));
        assert_eq!(
            compile_function(&m, 0).unwrap_err(),
            CompileError::NotCompiled(0)
        );
    }
}
