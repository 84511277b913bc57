//! Guest execution: bytecode compilation and the interpreter.

pub mod compile;
mod numeric;
mod vm;

pub use compile::{BranchTable, CompileError, CompiledFunction, Target};
pub use vm::{
    prepare_module, ExecError, Frame, FuncKind, HostCtx, HostFunction, JmpBuf, PreparedModule,
    Trap, Vm, MAX_FRAMES,
};

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::memory::{VirtualMemory, WASM_PAGE_SIZE};
    use crate::wasm::{
        op, BlockType, Function, FunctionBody, FunctionSig, Instr, MemoryDescriptor, Module,
        ValueType,
    };

    fn one_page_memory() -> Arc<Mutex<VirtualMemory>> {
        let mut mem = VirtualMemory::new();
        mem.new_region(0, WASM_PAGE_SIZE).unwrap();
        Arc::new(Mutex::new(mem))
    }

    fn single_func_module(sig: FunctionSig, code: Vec<Instr>) -> Arc<PreparedModule> {
        let mut m = Module::new();
        m.memory = Some(MemoryDescriptor {
            initial_pages: 1,
            maximum_pages: None,
        });
        m.funcs.push(Function::compiled(
            sig,
            FunctionBody {
                locals: Vec::new(),
                code,
                offsets: Vec::new(),
            },
            Some("main".to_string()),
        ));
        Arc::new(prepare_module(m).unwrap())
    }

    fn run_i32(code: Vec<Instr>) -> i32 {
        run_i32_with_args(code, &[], Vec::new())
    }

    fn run_i32_with_args(code: Vec<Instr>, args: &[u64], params: Vec<ValueType>) -> i32 {
        let pm = single_func_module(
            FunctionSig::new(params, vec![ValueType::I32]),
            code,
        );
        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        vm.exec_code(&ctx, 0, args).unwrap().unwrap() as u32 as i32
    }

    #[test]
    fn test_constant_arithmetic() {
        let v = run_i32(vec![
            Instr::i32_const(40),
            Instr::i32_const(2),
            Instr::op(op::I32_ADD),
            Instr::end(),
        ]);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_arguments_are_locals() {
        let v = run_i32_with_args(
            vec![
                Instr::local_get(0),
                Instr::local_get(1),
                Instr::op(op::I32_SUB),
                Instr::end(),
            ],
            &[50, 8],
            vec![ValueType::I32, ValueType::I32],
        );
        assert_eq!(v, 42);
    }

    #[test]
    fn test_if_else() {
        let code = |cond: i32| {
            vec![
                Instr::i32_const(cond),
                Instr::if_(BlockType::Value(ValueType::I32)),
                Instr::i32_const(1),
                Instr::else_(),
                Instr::i32_const(2),
                Instr::end(),
                Instr::end(),
            ]
        };
        assert_eq!(run_i32(code(1)), 1);
        assert_eq!(run_i32(code(0)), 2);
    }

    #[test]
    fn test_loop_counts_to_ten() {
        // local0 counts up; br_if re-enters the loop while local0 < 10.
        let code = vec![
            Instr::block(BlockType::Empty),
            Instr::loop_(BlockType::Empty),
            Instr::local_get(0),
            Instr::i32_const(1),
            Instr::op(op::I32_ADD),
            Instr::local_set(0),
            Instr::local_get(0),
            Instr::i32_const(10),
            Instr::op(op::I32_LT_S),
            Instr::br_if(0),
            Instr::end(),
            Instr::end(),
            Instr::local_get(0),
            Instr::end(),
        ];

        let mut m = Module::new();
        m.memory = Some(MemoryDescriptor {
            initial_pages: 1,
            maximum_pages: None,
        });
        m.funcs.push(Function::compiled(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            FunctionBody {
                locals: vec![(1, ValueType::I32)],
                code,
                offsets: Vec::new(),
            },
            Some("count".to_string()),
        ));
        let pm = Arc::new(prepare_module(m).unwrap());

        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        assert_eq!(vm.exec_code(&ctx, 0, &[]).unwrap(), Some(10));
    }

    #[test]
    fn test_nested_calls_pass_args_in_place() {
        // main() calls add(3, 4); add's locals alias main's pushes.
        let mut m = Module::new();
        m.memory = Some(MemoryDescriptor {
            initial_pages: 1,
            maximum_pages: None,
        });
        m.funcs.push(Function::compiled(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            FunctionBody {
                locals: Vec::new(),
                code: vec![
                    Instr::i32_const(3),
                    Instr::i32_const(4),
                    Instr::call(1),
                    Instr::end(),
                ],
                offsets: Vec::new(),
            },
            Some("main".to_string()),
        ));
        m.funcs.push(Function::compiled(
            FunctionSig::new(
                vec![ValueType::I32, ValueType::I32],
                vec![ValueType::I32],
            ),
            FunctionBody {
                locals: Vec::new(),
                code: vec![
                    Instr::local_get(0),
                    Instr::local_get(1),
                    Instr::op(op::I32_ADD),
                    Instr::end(),
                ],
                offsets: Vec::new(),
            },
            Some("add".to_string()),
        ));
        let pm = Arc::new(prepare_module(m).unwrap());

        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        assert_eq!(vm.exec_code(&ctx, 0, &[]).unwrap(), Some(7));
    }

    #[test]
    fn test_memory_store_load() {
        let v = run_i32(vec![
            Instr::i32_const(0x100),
            Instr::i32_const(0x11223344),
            Instr::store(op::I32_STORE, 0),
            Instr::i32_const(0x100),
            Instr::load(op::I32_LOAD, 2),
            Instr::end(),
        ]);
        // Offset 2 reads the upper two bytes plus two zero bytes.
        assert_eq!(v, 0x1122);
    }

    #[test]
    fn test_memory_grow_reports_old_size() {
        let v = run_i32(vec![
            Instr::i32_const(2),
            Instr::op(op::MEMORY_GROW),
            Instr::end(),
        ]);
        assert_eq!(v, 1);

        let v = run_i32(vec![Instr::op(op::MEMORY_SIZE), Instr::end()]);
        assert_eq!(v, 1);
    }

    #[test]
    fn test_division_by_zero_traps() {
        let pm = single_func_module(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            vec![
                Instr::i32_const(1),
                Instr::i32_const(0),
                Instr::op(op::I32_DIV_S),
                Instr::end(),
            ],
        );
        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        vm.recover_panic = true;
        match vm.exec_code(&ctx, 0, &[]) {
            Err(ExecError::Trap(Trap::IntegerDivideByZero)) => {}
            other => panic!("expected divide-by-zero trap, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_unreachable_traps() {
        let pm = single_func_module(
            FunctionSig::new(vec![], vec![]),
            vec![Instr::op(op::UNREACHABLE), Instr::end()],
        );
        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        vm.recover_panic = true;
        assert!(matches!(
            vm.exec_code(&ctx, 0, &[]),
            Err(ExecError::Trap(Trap::Unreachable))
        ));
    }

    #[test]
    fn test_bad_argument_count() {
        let pm = single_func_module(
            FunctionSig::new(vec![ValueType::I32], vec![]),
            vec![Instr::end()],
        );
        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        assert!(matches!(
            vm.exec_code(&ctx, 0, &[]),
            Err(ExecError::InvalidArgumentCount { expected: 1, got: 0 })
        ));
    }

    #[test]
    fn test_host_function_receives_popped_args() {
        let seen = Arc::new(AtomicI64::new(0));
        let seen2 = Arc::clone(&seen);

        let mut m = Module::new();
        m.memory = Some(MemoryDescriptor {
            initial_pages: 1,
            maximum_pages: None,
        });
        m.funcs.push(Function::host(
            FunctionSig::new(
                vec![ValueType::I32, ValueType::I32],
                vec![ValueType::I32],
            ),
            "host_sub",
            Arc::new(move |_vm, _ctx, args| {
                let a = args[0] as u32 as i32;
                let b = args[1] as u32 as i32;
                seen2.store((a - b) as i64, Ordering::SeqCst);
                Some((a - b) as i64 as u64)
            }),
        ));
        m.funcs.push(Function::compiled(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            FunctionBody {
                locals: Vec::new(),
                code: vec![
                    Instr::i32_const(50),
                    Instr::i32_const(8),
                    Instr::call(0),
                    Instr::end(),
                ],
                offsets: Vec::new(),
            },
            Some("main".to_string()),
        ));
        let pm = Arc::new(prepare_module(m).unwrap());

        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        let ret = vm.exec_code(&ctx, 1, &[]).unwrap();
        assert_eq!(ret.map(|v| v as u32 as i32), Some(42));
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_call_indirect_through_table() {
        let mut m = Module::new();
        m.memory = Some(MemoryDescriptor {
            initial_pages: 1,
            maximum_pages: None,
        });
        let sig = FunctionSig::new(vec![], vec![ValueType::I32]);
        m.types.push(sig.clone());
        m.funcs.push(Function::compiled(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            FunctionBody {
                locals: Vec::new(),
                code: vec![
                    Instr::i32_const(0),
                    Instr::call_indirect(0),
                    Instr::end(),
                ],
                offsets: Vec::new(),
            },
            Some("main".to_string()),
        ));
        m.funcs.push(Function::compiled(
            sig,
            FunctionBody {
                locals: Vec::new(),
                code: vec![Instr::i32_const(99), Instr::end()],
                offsets: Vec::new(),
            },
            Some("target".to_string()),
        ));
        m.table = vec![1];
        let pm = Arc::new(prepare_module(m).unwrap());

        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        assert_eq!(vm.exec_code(&ctx, 0, &[]).unwrap(), Some(99));
    }

    #[test]
    fn test_get_set_context_is_push_equivalent() {
        // A host function captures the context and immediately longjmps
        // back with 7; the guest must observe 7 exactly as if it had
        // been pushed.
        let mut m = Module::new();
        m.memory = Some(MemoryDescriptor {
            initial_pages: 1,
            maximum_pages: None,
        });
        m.funcs.push(Function::host(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            "snap",
            Arc::new(|vm, _ctx, _args| {
                let buf = vm.get_context();
                vm.set_context(&buf, 7).unwrap();
                None
            }),
        ));
        m.funcs.push(Function::compiled(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            FunctionBody {
                locals: Vec::new(),
                code: vec![Instr::call(0), Instr::end()],
                offsets: Vec::new(),
            },
            Some("main".to_string()),
        ));
        let pm = Arc::new(prepare_module(m).unwrap());

        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        assert_eq!(vm.exec_code(&ctx, 1, &[]).unwrap(), Some(7));
    }

    #[test]
    fn test_setup_into_function_round_trip() {
        // A host function injects handler(5); the handler stores its
        // argument to memory and returns. The syscall's effective
        // return must be the prev_ret passed to setup_into_function.
        let mut m = Module::new();
        m.memory = Some(MemoryDescriptor {
            initial_pages: 1,
            maximum_pages: None,
        });
        m.funcs.push(Function::host(
            FunctionSig::new(vec![ValueType::I32], vec![ValueType::I32]),
            "interruptible",
            Arc::new(|vm, _ctx, _args| {
                vm.setup_into_function(-4, 2, &[5]).unwrap();
                Some(0xdead) // must NOT land on the stack
            }),
        ));
        m.funcs.push(Function::compiled(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            FunctionBody {
                locals: Vec::new(),
                code: vec![Instr::i32_const(0), Instr::call(0), Instr::end()],
                offsets: Vec::new(),
            },
            Some("main".to_string()),
        ));
        m.funcs.push(Function::compiled(
            FunctionSig::new(vec![ValueType::I32], vec![]),
            FunctionBody {
                locals: Vec::new(),
                code: vec![
                    Instr::i32_const(0x80),
                    Instr::local_get(0),
                    Instr::store(op::I32_STORE, 0),
                    Instr::end(),
                ],
                offsets: Vec::new(),
            },
            Some("handler".to_string()),
        ));
        let pm = Arc::new(prepare_module(m).unwrap());

        let ctx = HostCtx::background();
        let memory = one_page_memory();
        let mut vm = Vm::new(&ctx, Arc::clone(&pm), Arc::clone(&memory)).unwrap();
        let ret = vm.exec_code(&ctx, 1, &[]).unwrap();

        // The handler ran with its argument...
        let mut mem = memory.lock().unwrap();
        let slice = mem.project(0x80, 4).unwrap();
        assert_eq!(i32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]), 5);
        // ...and the interrupted call returned prev_ret.
        assert_eq!(ret.map(|v| v as u32 as i32), Some(-4));
    }

    #[test]
    fn test_fork_copies_interpreter_state() {
        // A host function forks mid-call; the child resumes via
        // restart(0) and both sides write their return to memory.
        let forked: Arc<Mutex<Option<(Vm, Arc<Mutex<VirtualMemory>>)>>> =
            Arc::new(Mutex::new(None));
        let forked2 = Arc::clone(&forked);

        let mut m = Module::new();
        m.memory = Some(MemoryDescriptor {
            initial_pages: 1,
            maximum_pages: None,
        });
        m.funcs.push(Function::host(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            "do_fork",
            Arc::new(move |vm, _ctx, _args| {
                let child_mem = Arc::new(Mutex::new(vm.memory().lock().unwrap().fork()));
                let child = vm.fork(Arc::clone(&child_mem));
                *forked2.lock().unwrap() = Some((child, child_mem));
                Some(1) // parent sees pid 1
            }),
        ));
        m.funcs.push(Function::compiled(
            FunctionSig::new(vec![], vec![]),
            FunctionBody {
                locals: Vec::new(),
                code: vec![
                    Instr::i32_const(0x40),
                    Instr::call(0),
                    Instr::store(op::I32_STORE, 0),
                    Instr::end(),
                ],
                offsets: Vec::new(),
            },
            Some("main".to_string()),
        ));
        let pm = Arc::new(prepare_module(m).unwrap());

        let ctx = HostCtx::background();
        let parent_mem = one_page_memory();
        let mut vm = Vm::new(&ctx, pm, Arc::clone(&parent_mem)).unwrap();
        vm.exec_code(&ctx, 1, &[]).unwrap();

        // Parent stored 1.
        {
            let mut mem = parent_mem.lock().unwrap();
            let s = mem.project(0x40, 4).unwrap();
            assert_eq!(u32::from_le_bytes([s[0], s[1], s[2], s[3]]), 1);
        }

        // Child resumes as if the host call returned 0.
        let (mut child, child_mem) = forked.lock().unwrap().take().unwrap();
        child.restart(&ctx, &[0]).unwrap();
        let mut mem = child_mem.lock().unwrap();
        let s = mem.project(0x40, 4).unwrap();
        assert_eq!(u32::from_le_bytes([s[0], s[1], s[2], s[3]]), 0);
    }

    #[test]
    fn test_terminate_stops_the_loop() {
        // An infinite loop; aborting from the host function breaks it.
        let mut m = Module::new();
        m.memory = Some(MemoryDescriptor {
            initial_pages: 1,
            maximum_pages: None,
        });
        m.funcs.push(Function::host(
            FunctionSig::new(vec![], vec![]),
            "quit",
            Arc::new(|vm, _ctx, _args| {
                vm.terminate();
                None
            }),
        ));
        m.funcs.push(Function::compiled(
            FunctionSig::new(vec![], vec![]),
            FunctionBody {
                locals: Vec::new(),
                code: vec![
                    Instr::loop_(BlockType::Empty),
                    Instr::call(0),
                    Instr::br(0),
                    Instr::end(),
                    Instr::end(),
                ],
                offsets: Vec::new(),
            },
            Some("main".to_string()),
        ));
        let pm = Arc::new(prepare_module(m).unwrap());

        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        vm.exec_code(&ctx, 1, &[]).unwrap();
    }

    #[test]
    fn test_longjmp_wrong_direction_refused() {
        let pm = single_func_module(
            FunctionSig::new(vec![], vec![ValueType::I32]),
            vec![Instr::i32_const(0), Instr::end()],
        );
        let ctx = HostCtx::background();
        let mut vm = Vm::new(&ctx, pm, one_page_memory()).unwrap();
        vm.exec_code(&ctx, 0, &[]).unwrap();

        let buf = JmpBuf {
            sp: 0,
            ip: 0,
            frame: 5,
        };
        assert_eq!(
            vm.set_context(&buf, 1),
            Err(Trap::LongjmpWrongDirection)
        );
    }
}
