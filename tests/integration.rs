//! End-to-end scenarios
//!
//! Each test mounts a tar image, boots a guest program, and checks
//! what comes out on stdout and in the exit status. Guest programs are
//! hand-assembled instruction streams resolved by a stub decoder (the
//! binary decoder proper is a collaborator); the file content in the
//! tar image names which program to build.

use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use atlantis::boundary::WasmInterface;
use atlantis::fs::namespace::MountNamespace;
use atlantis::fs::tarfs::TarFs;
use atlantis::kernel::{Kernel, Process, ProcessStatus, SharedBuffer};
use atlantis::loader::{LoadError, ModuleDecoder};
use atlantis::syscalls::Invoker;
use atlantis::wasm::{
    op, BlockType, ExportEntry, ExternalKind, Function, FunctionBody, FunctionSig, GlobalEntry,
    GlobalInit, Instr, MemoryDescriptor, Module, ValueType,
};

const PASSWD: &[u8] = b"root:x:0:0:root:/root:/bin/sh\n";

// Host function indices in the environment module.
const SYS0: u32 = 0;
const SYS1: u32 = 1;
const SYS2: u32 = 2;
const SYS3: u32 = 3;
const SETJMP: u32 = 6;
const LONGJMP: u32 = 7;
const SYS_PACKED: u32 = 9;

/// Guest address map shared by the test programs.
const STR_AT: i32 = 0x40;
const ACT_AT: i32 = 0x300;
const PIPE_AT: i32 = 0x310;
const SCRATCH: i32 = 0x400;

struct TestDecoder;

impl ModuleDecoder for TestDecoder {
    fn decode(&self, bytes: &[u8], env: &Module) -> Result<Module, LoadError> {
        let program = match bytes {
            b"hello" => hello_program(env),
            b"forker" => forker_program(env),
            b"sigchld" => sigchld_program(env),
            b"mmaper" => mmaper_program(env),
            b"statter" => statter_program(env),
            b"jumper" => jumper_program(env),
            b"execer" => execer_program(env),
            other => {
                return Err(LoadError::Decode(format!(
                    "unknown test program {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        Ok(program)
    }
}

/// The common scaffolding: env imports at indices 0..=10, one page of
/// memory, and a `__heap_base` global at 0x8000.
fn base_module(env: &Module, image_writes: &[(i32, &[u8])]) -> Module {
    let mut m = Module::new();
    m.funcs = env.funcs.clone();
    m.memory = Some(MemoryDescriptor {
        initial_pages: 1,
        maximum_pages: None,
    });

    let mut image = vec![0u8; 0x1000];
    for (addr, bytes) in image_writes {
        let addr = *addr as usize;
        image[addr..addr + bytes.len()].copy_from_slice(bytes);
    }
    m.memory_image = image;

    m.globals.push(GlobalEntry {
        ty: ValueType::I32,
        mutable: false,
        init: GlobalInit::I32(0x8000),
    });
    m.exports.insert(
        "__heap_base".to_string(),
        ExportEntry {
            kind: ExternalKind::Global,
            index: 0,
        },
    );

    m
}

/// Append `_start` with the given locals and body.
fn add_start(m: &mut Module, locals: Vec<(u32, ValueType)>, code: Vec<Instr>) {
    let index = m.funcs.len() as u32;
    m.funcs.push(Function::compiled(
        FunctionSig::default(),
        FunctionBody {
            locals,
            code,
            offsets: Vec::new(),
        },
        Some("_start".to_string()),
    ));
    m.exports.insert(
        "_start".to_string(),
        ExportEntry {
            kind: ExternalKind::Function,
            index,
        },
    );
}

/// `exit_group(code)`
fn exit_with(code: i32) -> Vec<Instr> {
    vec![
        Instr::i32_const(252),
        Instr::i32_const(code),
        Instr::call(SYS1),
        Instr::op(op::DROP),
    ]
}

/// `write(fd, ptr, len)`, result dropped.
fn write_bytes(fd: i32, ptr: i32, len: i32) -> Vec<Instr> {
    vec![
        Instr::i32_const(4),
        Instr::i32_const(fd),
        Instr::i32_const(ptr),
        Instr::i32_const(len),
        Instr::call(SYS3),
        Instr::op(op::DROP),
    ]
}

struct Boot {
    kernel: Arc<Kernel>,
    proc: Arc<Process>,
    stdout: SharedBuffer,
}

/// Build a tar image with the program marker at /bin/main plus an
/// /etc/passwd, mount it, and run the program to completion.
fn boot(program: &str) -> Boot {
    let invoker = Arc::new(Invoker::new());
    let env = WasmInterface::new(invoker).env_module();
    let kernel = Kernel::new(env, Box::new(TestDecoder));

    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in [
        ("bin/main", program.as_bytes()),
        ("bin/hello", b"hello".as_slice()),
        ("etc/passwd", PASSWD),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_path(path).unwrap();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append(&header, body).unwrap();
    }
    let image = builder.into_inner().unwrap();

    let fs = TarFs::new(Cursor::new(image)).unwrap();
    let mount = Arc::new(MountNamespace::new(fs.root()));

    let (proc, mut vm) = kernel
        .init_process(mount, "/bin/main", &["main".to_string()], &[])
        .unwrap();

    let stdout = SharedBuffer::new();
    proc.hookup_stdio(
        Box::new(std::io::empty()),
        Box::new(stdout.clone()),
        Box::new(std::io::sink()),
    );

    kernel.start_process(&proc, &mut vm).unwrap();

    Boot {
        kernel,
        proc,
        stdout,
    }
}

/// Exec replaces the interpreter thread; wait for the process itself.
fn wait_for_exit(proc: &Arc<Process>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while proc.status() != ProcessStatus::Dead {
        assert!(Instant::now() < deadline, "process did not exit in time");
        thread::sleep(Duration::from_millis(5));
    }
}

// ---- programs --------------------------------------------------------

/// Writes "hello\n" to stdout and exits 0.
fn hello_program(env: &Module) -> Module {
    let mut m = base_module(env, &[(STR_AT, b"hello\n")]);
    let mut code = write_bytes(1, STR_AT, 6);
    code.extend(exit_with(0));
    code.push(Instr::end());
    add_start(&mut m, Vec::new(), code);
    m
}

/// Forks; the child exits 7, the parent waits and reports the reaped
/// pid and status word on stdout.
fn forker_program(env: &Module) -> Module {
    let mut m = base_module(env, &[]);
    let mut code = vec![
        // pid = fork()
        Instr::i32_const(2),
        Instr::call(SYS0),
        Instr::local_set(0),
        Instr::local_get(0),
        Instr::op(op::I32_EQZ),
        Instr::if_(BlockType::Empty),
    ];
    code.extend(exit_with(7)); // child
    code.push(Instr::end());

    // parent: mem[SCRATCH+0x10] = wait4(-1, SCRATCH, 0)
    code.extend([
        Instr::i32_const(SCRATCH + 0x10),
        Instr::i32_const(114),
        Instr::i32_const(-1),
        Instr::i32_const(SCRATCH),
        Instr::i32_const(0),
        Instr::call(SYS3),
        Instr::store(op::I32_STORE, 0),
    ]);
    code.extend(write_bytes(1, SCRATCH + 0x10, 4)); // reaped pid
    code.extend(write_bytes(1, SCRATCH, 4)); // status word
    code.extend(exit_with(0));
    code.push(Instr::end());

    add_start(&mut m, vec![(1, ValueType::I32)], code);
    m
}

/// Installs a SIGCHLD handler, forks, and blocks reading an empty pipe
/// whose write end stays open. The child burns some time and exits;
/// the read fails with EINTR, the handler reports the signal number,
/// and the interrupted read is not restarted.
fn sigchld_program(env: &Module) -> Module {
    // act = { handler: table index 1, flags: 0 }
    let mut m = base_module(
        env,
        &[(ACT_AT, &1i32.to_le_bytes()), (ACT_AT + 4, &0i32.to_le_bytes())],
    );

    let mut code = vec![
        // rt_sigaction(SIGCHLD, act)
        Instr::i32_const(174),
        Instr::i32_const(17),
        Instr::i32_const(ACT_AT),
        Instr::call(SYS2),
        Instr::op(op::DROP),
        // pipe(&fds) -> read 3, write 4
        Instr::i32_const(42),
        Instr::i32_const(PIPE_AT),
        Instr::call(SYS1),
        Instr::op(op::DROP),
        // pid = fork()
        Instr::i32_const(2),
        Instr::call(SYS0),
        Instr::local_set(0),
        Instr::local_get(0),
        Instr::op(op::I32_EQZ),
        Instr::if_(BlockType::Empty),
    ];

    // Child: enough cheap syscalls to let the parent reach its read,
    // then exit.
    code.extend([
        Instr::block(BlockType::Empty),
        Instr::loop_(BlockType::Empty),
        Instr::i32_const(199),
        Instr::call(SYS0),
        Instr::op(op::DROP),
        Instr::local_get(1),
        Instr::i32_const(1),
        Instr::op(op::I32_ADD),
        Instr::local_tee(1),
        Instr::i32_const(10_000),
        Instr::op(op::I32_LT_S),
        Instr::br_if(0),
        Instr::end(),
        Instr::end(),
    ]);
    code.extend(exit_with(3));
    code.push(Instr::end());

    // Parent: r = read_pipe(); the syscall is issued from a
    // value-returning wrapper, the way libc wrappers do, so the
    // injected handler's continuation value lands where the wrapper's
    // return belongs.
    let read_fn_index = env.funcs.len() as u32 + 2; // _start, handler, read_pipe
    code.extend([
        Instr::i32_const(SCRATCH + 0x20),
        Instr::call(read_fn_index),
        Instr::store(op::I32_STORE, 0),
    ]);
    code.extend(write_bytes(1, SCRATCH + 0x20, 4)); // the EINTR result
    code.extend(exit_with(0));
    code.push(Instr::end());

    add_start(&mut m, vec![(2, ValueType::I32)], code);

    // handler(signo): store the signal number and write it to stdout.
    let handler_index = m.funcs.len() as u32;
    let mut hcode = vec![
        Instr::i32_const(SCRATCH + 0x40),
        Instr::local_get(0),
        Instr::store(op::I32_STORE8, 0),
    ];
    hcode.extend(write_bytes(1, SCRATCH + 0x40, 1));
    hcode.push(Instr::end());
    m.funcs.push(Function::compiled(
        FunctionSig::new(vec![ValueType::I32], vec![]),
        FunctionBody {
            locals: Vec::new(),
            code: hcode,
            offsets: Vec::new(),
        },
        Some("handle_chld".to_string()),
    ));

    // read_pipe() -> i32: a blocking read of the empty pipe.
    m.funcs.push(Function::compiled(
        FunctionSig::new(vec![], vec![ValueType::I32]),
        FunctionBody {
            locals: Vec::new(),
            code: vec![
                Instr::i32_const(3),
                Instr::i32_const(3),
                Instr::i32_const(SCRATCH),
                Instr::i32_const(16),
                Instr::call(SYS3),
                Instr::end(),
            ],
            offsets: Vec::new(),
        },
        Some("read_pipe".to_string()),
    ));

    // Table slot 0 stays empty (0 means "remove handler" in
    // rt_sigaction); the handler lives at slot 1.
    m.table = vec![0, handler_index];
    m
}

/// Two anonymous mmaps; reports both returned addresses.
fn mmaper_program(env: &Module) -> Module {
    // mmap request: addr=0 len=64KiB prot=RW flags=PRIVATE|ANONYMOUS
    let mut req = Vec::new();
    for v in [0i32, 65536, 3, 0x22, -1, 0, 0] {
        req.extend_from_slice(&v.to_le_bytes());
    }
    let mut m = base_module(env, &[(0x200, &req)]);

    let mut code = Vec::new();
    for slot in [0, 4] {
        code.extend([
            Instr::i32_const(SCRATCH + slot),
            Instr::i32_const(192),
            Instr::i32_const(0x200),
            Instr::call(SYS_PACKED),
            Instr::store(op::I32_STORE, 0),
        ]);
    }
    code.extend(write_bytes(1, SCRATCH, 8));
    code.extend(exit_with(0));
    code.push(Instr::end());

    add_start(&mut m, Vec::new(), code);
    m
}

/// stat64 + open + read of /etc/passwd; emits content, size, and mode.
fn statter_program(env: &Module) -> Module {
    let stat_at = 0x600;
    let buf_at = 0x700;
    let mut m = base_module(env, &[(STR_AT, b"/etc/passwd\0")]);

    let mut code = vec![
        // stat64(path, statbuf)
        Instr::i32_const(195),
        Instr::i32_const(STR_AT),
        Instr::i32_const(stat_at),
        Instr::call(SYS2),
        Instr::op(op::DROP),
        // fd = open(path, 0)
        Instr::i32_const(5),
        Instr::i32_const(STR_AT),
        Instr::i32_const(0),
        Instr::call(SYS2),
        Instr::local_set(0),
        // n = read(fd, buf, 256)
        Instr::i32_const(3),
        Instr::local_get(0),
        Instr::i32_const(buf_at),
        Instr::i32_const(256),
        Instr::call(SYS3),
        Instr::local_set(1),
        // write(1, buf, n)
        Instr::i32_const(4),
        Instr::i32_const(1),
        Instr::i32_const(buf_at),
        Instr::local_get(1),
        Instr::call(SYS3),
        Instr::op(op::DROP),
    ];
    // stat.size (low word, offset 28) then stat.mode (offset 16)
    code.extend(write_bytes(1, stat_at + 28, 4));
    code.extend(write_bytes(1, stat_at + 16, 4));
    code.extend(exit_with(0));
    code.push(Instr::end());

    add_start(&mut m, vec![(2, ValueType::I32)], code);
    m
}

/// setjmp, then a longjmp(42) from a few calls deep; reports the
/// second setjmp return.
fn jumper_program(env: &Module) -> Module {
    let buf_at = 0x800;
    let mut m = base_module(env, &[]);

    let helper_index = (env.funcs.len() + 1) as u32;

    let mut code = vec![
        // r = setjmp(buf)
        Instr::i32_const(buf_at),
        Instr::call(SETJMP),
        Instr::local_set(0),
        Instr::local_get(0),
        Instr::op(op::I32_EQZ),
        Instr::if_(BlockType::Empty),
        Instr::call(helper_index),
        Instr::end(),
        // write r
        Instr::i32_const(SCRATCH),
        Instr::local_get(0),
        Instr::store(op::I32_STORE, 0),
    ];
    code.extend(write_bytes(1, SCRATCH, 4));
    code.extend(exit_with(0));
    code.push(Instr::end());

    add_start(&mut m, vec![(1, ValueType::I32)], code);

    // helper: longjmp(buf, 42) and never return.
    m.funcs.push(Function::compiled(
        FunctionSig::default(),
        FunctionBody {
            locals: Vec::new(),
            code: vec![
                Instr::i32_const(buf_at),
                Instr::i32_const(42),
                Instr::call(LONGJMP),
                Instr::end(),
            ],
            offsets: Vec::new(),
        },
        Some("descend".to_string()),
    ));

    m
}

/// execve("/bin/hello") under the same pid.
fn execer_program(env: &Module) -> Module {
    let argv_at = 0x60;
    let mut m = base_module(
        env,
        &[(STR_AT, b"/bin/hello\0"), (argv_at, &0u32.to_le_bytes())],
    );

    let mut code = vec![
        Instr::i32_const(11),
        Instr::i32_const(STR_AT),
        Instr::i32_const(argv_at),
        Instr::i32_const(argv_at),
        Instr::call(SYS3),
        Instr::op(op::DROP),
    ];
    // Only reached if exec failed.
    code.extend(exit_with(111));
    code.push(Instr::end());

    add_start(&mut m, Vec::new(), code);
    m
}

// ---- scenarios -------------------------------------------------------

#[test]
fn test_hello_writes_stdout_and_exits_zero() {
    let b = boot("hello");

    assert_eq!(b.stdout.contents(), b"hello\n");
    assert_eq!(b.proc.pid, 1);
    assert_eq!(b.proc.status(), ProcessStatus::Dead);
    assert_eq!(b.proc.exit_status().code, 0);
}

#[test]
fn test_fork_wait_reports_child_status() {
    let b = boot("forker");

    let out = b.stdout.contents();
    assert_eq!(out.len(), 8);

    let reaped = i32::from_le_bytes(out[0..4].try_into().unwrap());
    let status = i32::from_le_bytes(out[4..8].try_into().unwrap());

    assert_eq!(reaped, 2);
    // {code: 7, signo: 0}
    assert_eq!(status >> 8 & 0xff, 7);
    assert_eq!(status & 0xff, 0);

    // The reaped child's pid was released.
    assert!(b.kernel.processes().get(2).is_none());
}

#[test]
fn test_sigchld_interrupts_blocked_read() {
    let b = boot("sigchld");

    let out = b.stdout.contents();
    assert_eq!(out.len(), 5, "stdout: {:?}", out);

    // The handler ran first, with the signal number as argument.
    assert_eq!(out[0], 17);

    // Then the read returned EINTR and was not restarted.
    let r = i32::from_le_bytes(out[1..5].try_into().unwrap());
    assert_eq!(r, -4);

    assert_eq!(b.proc.exit_status().code, 0);
}

#[test]
fn test_mmap_addresses_advance() {
    let b = boot("mmaper");

    let out = b.stdout.contents();
    assert_eq!(out.len(), 8);

    let a1 = u32::from_le_bytes(out[0..4].try_into().unwrap());
    let a2 = u32::from_le_bytes(out[4..8].try_into().unwrap());

    assert!(a1 >= 0x10000);
    assert_eq!(a1 % 65536, 0);
    // Cursor advances by at least page_round(64 KiB + 1 MiB).
    assert!(a2 >= a1 + 0x110000);
}

#[test]
fn test_stat_open_read_consistency() {
    let b = boot("statter");

    let out = b.stdout.contents();
    let n = PASSWD.len();
    assert_eq!(out.len(), n + 8);

    assert_eq!(&out[..n], PASSWD);

    let size = u32::from_le_bytes(out[n..n + 4].try_into().unwrap());
    assert_eq!(size as usize, n);

    let mode = u32::from_le_bytes(out[n + 4..n + 8].try_into().unwrap());
    assert_eq!(mode & 0o170000, 0o100000); // regular file
    assert_eq!(mode & 0o777, 0o644);
}

#[test]
fn test_setjmp_longjmp_round_trip() {
    let b = boot("jumper");

    let out = b.stdout.contents();
    assert_eq!(out.len(), 4, "the value must be observed exactly once");
    assert_eq!(i32::from_le_bytes(out[0..4].try_into().unwrap()), 42);
    assert_eq!(b.proc.exit_status().code, 0);
}

#[test]
fn test_execve_replaces_program_same_pid() {
    let b = boot("execer");

    // The exec'd program runs on its own thread; wait for it.
    wait_for_exit(&b.proc);

    assert_eq!(b.proc.pid, 1);
    assert_eq!(b.stdout.contents(), b"hello\n");
    assert_eq!(b.proc.exit_status().code, 0);
}
