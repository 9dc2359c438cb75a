//! Program spawn, argv delivery over pipes, and the pipe EOF contract
//! between two tasks.

use std::sync::Arc;

use minikern::{Errno, Kernel, ProgramCtx, ProgramDesc, ProgramStatus};

fn boot() -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = Kernel::with_default_fs();
    kernel.mount("lfs", "", "/", "").unwrap();
    kernel.vfs().mkdir("/dev", 0o755).unwrap();
    kernel.mount("devfs", "", "/dev", "").unwrap();
    kernel.register_programs(PROGRAMS).unwrap();
    kernel
}

fn echo_argv_main(ctx: &ProgramCtx, argv: &[String]) -> i32 {
    let Some(stdout) = ctx.process.stdout() else {
        return -1;
    };
    let joined = argv.join("\n");
    ctx.kernel.vfs().write(stdout, joined.as_bytes()).unwrap();
    argv.len() as i32
}

fn pipe_writer_main(ctx: &ProgramCtx, argv: &[String]) -> i32 {
    let fd = ctx.kernel.vfs().open(&argv[0], "w").unwrap();
    ctx.kernel.vfs().write(fd, b"hello").unwrap();
    ctx.kernel.vfs().close(fd).unwrap();
    0
}

fn pipe_reader_main(ctx: &ProgramCtx, argv: &[String]) -> i32 {
    let vfs = ctx.kernel.vfs();
    let fd = vfs.open(&argv[0], "r").unwrap();
    let mut buf = [0u8; 5];
    if vfs.read(fd, &mut buf).unwrap() != 5 || &buf != b"hello" {
        return 1;
    }
    // The writer closed its side: the next read drains to EOF.
    if vfs.read(fd, &mut buf).unwrap() != 0 {
        return 2;
    }
    vfs.close(fd).unwrap();
    0
}

fn globals_main(ctx: &ProgramCtx, _argv: &[String]) -> i32 {
    ctx.process.with_globals(|globals| {
        if globals.iter().any(|&b| b != 0) {
            return 1;
        }
        globals[0] = 0xA5;
        0
    })
}

static PROGRAMS: &[ProgramDesc] = &[
    ProgramDesc {
        name: "echo-argv",
        main: echo_argv_main,
        globals_size: 0,
        stack_size: 64 * 1024,
    },
    ProgramDesc {
        name: "pipe-writer",
        main: pipe_writer_main,
        globals_size: 0,
        stack_size: 64 * 1024,
    },
    ProgramDesc {
        name: "pipe-reader",
        main: pipe_reader_main,
        globals_size: 0,
        stack_size: 64 * 1024,
    },
    ProgramDesc {
        name: "globals",
        main: globals_main,
        globals_size: 256,
        stack_size: 0,
    },
];

#[test]
fn argv_tokenizing_reaches_the_program() {
    let kernel = boot();
    let vfs = kernel.vfs();
    vfs.mkfifo("/dev/out").unwrap();
    let stdout = vfs.open("/dev/out", "w").unwrap();

    let pid = kernel
        .spawn(
            "echo-argv",
            r#"   foo  "hello world"  bar\ baz "#,
            "/",
            None,
            Some(stdout),
        )
        .unwrap();
    assert_eq!(kernel.wait(pid).unwrap(), 3);

    let expected = b"foo\nhello world\nbar baz";
    let out = vfs.open("/dev/out", "r").unwrap();
    let mut buf = vec![0u8; expected.len()];
    assert_eq!(vfs.read(out, &mut buf).unwrap(), expected.len());
    assert_eq!(&buf, expected);
    vfs.close(out).unwrap();
    vfs.close(stdout).unwrap();
    kernel.reap(pid).unwrap();
}

#[test]
fn two_tasks_share_a_pipe_with_eof() {
    let kernel = boot();
    kernel.vfs().mkfifo("/dev/p").unwrap();

    let writer = kernel
        .spawn("pipe-writer", "/dev/p", "/", None, None)
        .unwrap();
    let reader = kernel
        .spawn("pipe-reader", "/dev/p", "/", None, None)
        .unwrap();

    assert_eq!(kernel.wait(writer).unwrap(), 0);
    assert_eq!(kernel.wait(reader).unwrap(), 0);
}

#[test]
fn globals_block_is_zeroed_per_program() {
    let kernel = boot();
    let pid = kernel.spawn("globals", "", "/", None, None).unwrap();
    assert_eq!(kernel.wait(pid).unwrap(), 0);
    let process = kernel.process(pid).unwrap();
    assert_eq!(process.status(), ProgramStatus::Ended);
    process.with_globals(|globals| assert_eq!(globals[0], 0xA5));
}

#[test]
fn mismatched_quotes_set_argument_error() {
    let kernel = boot();
    let err = kernel
        .spawn("echo-argv", "broken \"quote", "/", None, None)
        .unwrap_err();
    assert_eq!(err, Errno::Inval);
    // The record is retained with the failure status.
    let pid = kernel
        .spawn("echo-argv", "ok", "/", None, None)
        .unwrap();
    kernel.wait(pid).unwrap();
}

#[test]
fn unknown_program_is_noent() {
    let kernel = boot();
    assert_eq!(
        kernel.spawn("no-such", "", "/", None, None).unwrap_err(),
        Errno::NoEnt
    );
}

#[test]
fn reap_removes_ended_programs() {
    let kernel = boot();
    let pid = kernel.spawn("globals", "", "/", None, None).unwrap();
    kernel.wait(pid).unwrap();
    kernel.reap(pid).unwrap();
    assert_eq!(kernel.process(pid).unwrap_err(), Errno::NoEnt);
}

#[test]
fn cwd_is_joined_for_relative_paths() {
    let kernel = boot();
    assert_eq!(kernel.absolutize("/abs"), "/abs");
    assert_eq!(kernel.absolutize("rel"), "/rel");
}
