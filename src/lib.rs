//! Core runtime of a small real-time kernel for 32-bit targets: the
//! process/thread runtime, the virtual file system that uniformly exposes
//! regular files, directories, pipes and devices, and the pluggable file
//! system backends behind it (a RAM tree, a device file system, a FAT
//! driver and an ext-family driver over a cached block device).
//!
//! The kernel is an explicit singleton: [`Kernel::new`] boots one, and every
//! public entry point goes through it or through the [`vfs::Vfs`] it owns.
//! Scheduling is delegated to the host: tasks are OS threads behind the
//! [`sync`] facade, and nothing in the crate depends on more than blocking
//! mutexes, semaphores and queues with timeouts.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::errno::{Errno, KResult, clear_last_error, last_error};
pub use crate::fs::{
    DeviceStat, DirEntry, DirStream, Driver, FileHandle, FileSystem, FileType, FsContext,
    FsInitFn, FsType, MountOptions, OpenFlags, Stat, StatFs,
};
pub use crate::kernel::{Kernel, KernelConfig};
pub use crate::pipe::Pipe;
pub use crate::runtime::{
    Process, ProgramCtx, ProgramDesc, ProgramMain, ProgramStatus, current, tokenize_args,
};
pub use crate::sync::{KClock, KMutex, KRecursiveMutex, MAX_DELAY_MS, Queue, Semaphore, sleep_ms};
pub use crate::vfs::{Dir, Fd, MntEnt, Vfs, Whence};

pub mod errno;
pub mod ext4;
pub mod fs;
pub mod kernel;
pub mod pipe;
pub mod runtime;
pub mod sync;
pub mod vfs;
