//! Process/thread runtime.
//!
//! Programs come from a compile-time registry giving each a `main` entry
//! point, a globals-block size and a stack size. `spawn` tokenizes the
//! argument string, allocates the zero-initialised globals block, starts a
//! task with the program's stack size and records it in the process table.
//!
//! Each spawned task carries its stdin/stdout descriptors, an owned working
//! directory, the globals block and an exit code; user code reaches its own
//! record through [`current`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::thread::JoinHandle;

use log::{debug, error};
use smallvec::SmallVec;

use crate::errno::{Errno, KResult, set_last_error};
use crate::kernel::Kernel;
use crate::sync::KMutex;
use crate::vfs::Fd;

/// Entry point signature for registered programs.
pub type ProgramMain = fn(&ProgramCtx, &[String]) -> i32;

/// One compile-time registry entry.
#[derive(Debug, Clone, Copy)]
pub struct ProgramDesc {
    /// Name `spawn` looks the program up by.
    pub name: &'static str,
    /// Program entry point.
    pub main: ProgramMain,
    /// Byte size of the program's zero-initialised globals block.
    pub globals_size: usize,
    /// Stack size for the program's task; 0 means the platform default.
    pub stack_size: usize,
}

/// Lifecycle state of a spawned program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStatus {
    /// The task is running (or not yet started).
    Running,
    /// `main` returned; the exit code is valid.
    Ended,
    /// Allocating the globals block failed.
    FailedAlloc,
    /// The argument string did not tokenize (mismatched quote).
    ArgError,
    /// The scheduler refused to create the task.
    SpawnError,
}

/// Kernel-side record of a spawned program.
pub struct Process {
    pid: u32,
    name: String,
    stdin: Option<Fd>,
    stdout: Option<Fd>,
    cwd: KMutex<String>,
    globals: KMutex<Box<[u8]>>,
    exit_code: AtomicI32,
    status: KMutex<ProgramStatus>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Process {
    /// Task id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Registered program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Standard input descriptor, if one was supplied.
    pub fn stdin(&self) -> Option<Fd> {
        self.stdin
    }

    /// Standard output descriptor, if one was supplied.
    pub fn stdout(&self) -> Option<Fd> {
        self.stdout
    }

    /// The task's current working directory.
    pub fn cwd(&self) -> String {
        self.cwd.force_lock().clone()
    }

    /// Replace the task's working directory.
    pub fn set_cwd(&self, cwd: &str) {
        *self.cwd.force_lock() = cwd.to_string();
    }

    /// Exit code; meaningful once the status is [`ProgramStatus::Ended`].
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ProgramStatus {
        *self.status.force_lock()
    }

    fn set_status(&self, status: ProgramStatus) {
        *self.status.force_lock() = status;
    }

    /// Run `f` over the program's globals block.
    pub fn with_globals<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut globals = self.globals.force_lock();
        f(&mut globals)
    }
}

/// What a program's `main` receives besides its argv.
#[derive(Debug, Clone)]
pub struct ProgramCtx {
    /// The kernel the program runs on.
    pub kernel: Arc<Kernel>,
    /// The program's own process record.
    pub process: Arc<Process>,
}

struct ProcEntry {
    process: Arc<Process>,
    handle: Option<JoinHandle<()>>,
}

/// The kernel's process table.
pub(crate) struct ProcTable {
    entries: KMutex<HashMap<u32, ProcEntry>>,
    next_pid: AtomicU32,
}

impl std::fmt::Debug for ProcTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcTable").finish_non_exhaustive()
    }
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        ProcTable {
            entries: KMutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1),
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Process>>> = const { RefCell::new(None) };
}

/// The process record of the calling task, if it is a spawned program.
pub fn current() -> Option<Arc<Process>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Split an argument string into an argv table.
///
/// Single- and double-quoted substrings are atomic tokens; a backslash
/// passes the next byte through literally, inside or outside quotes. A
/// quote left open (or a trailing backslash) is an error.
pub fn tokenize_args(args: &str) -> KResult<Vec<String>> {
    let mut argv: SmallVec<[String; 8]> = SmallVec::new();
    let mut token = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut bytes = args.chars();

    while let Some(ch) = bytes.next() {
        match ch {
            '\\' => {
                let escaped = bytes.next().ok_or(Errno::Inval)?;
                token.push(escaped);
                in_token = true;
            }
            '\'' | '"' if quote == Some(ch) => {
                quote = None;
            }
            '\'' | '"' if quote.is_none() => {
                quote = Some(ch);
                in_token = true;
            }
            c if c.is_ascii_whitespace() && quote.is_none() => {
                if in_token {
                    argv.push(std::mem::take(&mut token));
                    in_token = false;
                }
            }
            c => {
                token.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(Errno::Inval);
    }
    if in_token {
        argv.push(token);
    }
    Ok(argv.into_vec())
}

impl Kernel {
    /// Spawn the registered program `name`.
    ///
    /// `args` is the raw command line (tokenized here), `cwd` the initial
    /// working directory, `stdin`/`stdout` the task's standard streams.
    /// The returned pid stays in the process table, with a terminal status,
    /// until [`Kernel::reap`] removes it.
    pub fn spawn(
        self: &Arc<Self>,
        name: &str,
        args: &str,
        cwd: &str,
        stdin: Option<Fd>,
        stdout: Option<Fd>,
    ) -> KResult<u32> {
        let desc = self
            .program(name)
            .ok_or_else(|| set_last_error(Errno::NoEnt))?;

        let pid = self.procs.next_pid.fetch_add(1, Ordering::Relaxed);
        let process = Arc::new(Process {
            pid,
            name: name.to_string(),
            stdin,
            stdout,
            cwd: KMutex::new(cwd.to_string()),
            globals: KMutex::new(Box::default()),
            exit_code: AtomicI32::new(0),
            status: KMutex::new(ProgramStatus::Running),
        });
        self.procs.entries.force_lock().insert(
            pid,
            ProcEntry {
                process: process.clone(),
                handle: None,
            },
        );

        let argv = match tokenize_args(args) {
            Ok(argv) => argv,
            Err(err) => {
                process.set_status(ProgramStatus::ArgError);
                return Err(set_last_error(err));
            }
        };

        let globals = match zeroed_block(desc.globals_size) {
            Ok(block) => block,
            Err(err) => {
                process.set_status(ProgramStatus::FailedAlloc);
                return Err(set_last_error(err));
            }
        };
        *process.globals.force_lock() = globals;

        let ctx = ProgramCtx {
            kernel: self.clone(),
            process: process.clone(),
        };
        let main = desc.main;
        let task_process = process.clone();
        let mut builder = std::thread::Builder::new().name(format!("{name}:{pid}"));
        if desc.stack_size > 0 {
            builder = builder.stack_size(desc.stack_size);
        }
        let spawned = builder.spawn(move || {
            CURRENT.with(|slot| *slot.borrow_mut() = Some(task_process.clone()));
            let argv_ref = argv;
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| main(&ctx, &argv_ref)));
            let code = match outcome {
                Ok(code) => code,
                Err(_) => {
                    error!("program {}:{} panicked", task_process.name, task_process.pid);
                    -1
                }
            };
            task_process.exit_code.store(code, Ordering::Release);
            task_process.set_status(ProgramStatus::Ended);
            CURRENT.with(|slot| *slot.borrow_mut() = None);
        });
        match spawned {
            Ok(handle) => {
                if let Some(entry) = self.procs.entries.force_lock().get_mut(&pid) {
                    entry.handle = Some(handle);
                }
                debug!("runtime: spawned {name}:{pid}");
                Ok(pid)
            }
            Err(err) => {
                error!("runtime: task creation for {name} failed: {err}");
                process.set_status(ProgramStatus::SpawnError);
                Err(set_last_error(Errno::Again))
            }
        }
    }

    /// The process record for `pid`.
    pub fn process(&self, pid: u32) -> KResult<Arc<Process>> {
        let entries = self.procs.entries.force_lock();
        entries
            .get(&pid)
            .map(|entry| entry.process.clone())
            .ok_or(Errno::NoEnt)
    }

    /// Block until the program ends; returns its exit code.
    pub fn wait(&self, pid: u32) -> KResult<i32> {
        let (process, handle) = {
            let mut entries = self.procs.entries.force_lock();
            let entry = entries.get_mut(&pid).ok_or(Errno::NoEnt)?;
            (entry.process.clone(), entry.handle.take())
        };
        if let Some(handle) = handle {
            // A program panic already downgraded to exit code -1.
            let _ = handle.join();
        }
        match process.status() {
            ProgramStatus::Ended => Ok(process.exit_code()),
            ProgramStatus::Running => Err(Errno::Again),
            _ => Err(Errno::Io),
        }
    }

    /// Advisory kill: force-close the task's standard streams so blocked
    /// I/O unblocks. Backends see the same force-close as driver teardown.
    pub fn kill(&self, pid: u32) -> KResult<()> {
        let process = self.process(pid)?;
        for fd in [process.stdin(), process.stdout()].into_iter().flatten() {
            let _ = self.vfs().close_forced(fd);
        }
        Ok(())
    }

    /// Drop the process-table entry of a program in a terminal state.
    pub fn reap(&self, pid: u32) -> KResult<()> {
        let mut entries = self.procs.entries.force_lock();
        let entry = entries.get(&pid).ok_or(Errno::NoEnt)?;
        if entry.process.status() == ProgramStatus::Running {
            return Err(Errno::Busy);
        }
        entries.remove(&pid);
        Ok(())
    }
}

fn zeroed_block(size: usize) -> KResult<Box<[u8]>> {
    let mut block = Vec::new();
    block.try_reserve_exact(size).map_err(|_| Errno::NoMem)?;
    block.resize(size, 0);
    Ok(block.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_splits_respecting_quotes_and_escapes() {
        let argv = tokenize_args(r#"   foo  "hello world"  bar\ baz "#).unwrap();
        assert_eq!(argv, vec!["foo", "hello world", "bar baz"]);
    }

    #[test]
    fn tokenizer_handles_single_quotes_and_empty_tokens() {
        let argv = tokenize_args("a 'b c' \"\" d").unwrap();
        assert_eq!(argv, vec!["a", "b c", "", "d"]);
    }

    #[test]
    fn tokenizer_rejects_mismatched_quotes() {
        assert_eq!(tokenize_args("a \"open").unwrap_err(), Errno::Inval);
        assert_eq!(tokenize_args("a 'open").unwrap_err(), Errno::Inval);
        assert_eq!(tokenize_args("trailing\\").unwrap_err(), Errno::Inval);
    }

    #[test]
    fn tokenizer_passes_escaped_quotes_literally() {
        let argv = tokenize_args(r#"say \"hi\""#).unwrap();
        assert_eq!(argv, vec!["say", "\"hi\""]);
    }
}
