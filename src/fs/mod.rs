//! File system backends and the capability table they implement.
//!
//! Every backend supplies the same set of operations through the
//! [`FileSystem`] trait; the VFS dispatches to it without knowing which
//! concrete backend sits behind a mount. Reasonable default implementations
//! are provided so a backend only implements what it supports; absent
//! operations log and return [`Errno::NotSup`].

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use log::warn;

use crate::errno::{Errno, KResult};

pub mod devfs;
pub mod ext4fs;
pub mod fatfs;
pub mod lfs;

bitflags! {
    /// Open flags in the backends' vocabulary.
    ///
    /// The VFS produces these from the user-facing mode string
    /// (`r`, `r+`, `w`, `w+`, `a`, `a+`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
        /// Truncate to zero length on open.
        const TRUNC = 1 << 2;
        /// Create the file if it does not exist.
        const CREATE = 1 << 3;
        /// Position writes at end of file.
        const APPEND = 1 << 4;
        /// Do not block on data not yet available.
        const NONBLOCK = 1 << 5;
    }
}

impl OpenFlags {
    /// Whether the flags permit reading.
    pub fn readable(self) -> bool {
        self.contains(OpenFlags::READ)
    }

    /// Whether the flags permit writing.
    pub fn writable(self) -> bool {
        self.contains(OpenFlags::WRITE)
    }
}

/// Backend-level handle for one open file, opaque to the VFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of node a backend exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Bounded byte pipe
    Pipe,
    /// Device driver link
    Device,
}

/// File metadata returned by `stat`/`fstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Size in bytes; for pipes, the number of buffered bytes.
    pub size: u64,
    /// Node kind.
    pub file_type: FileType,
    /// Permission bits (`0o777` mask plus setuid/setgid/sticky).
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Device id for driver links (`major << 8 | minor`), 0 otherwise.
    pub dev: u32,
    /// Creation time, seconds of kernel uptime.
    pub ctime: u64,
    /// Last modification time, seconds of kernel uptime.
    pub mtime: u64,
}

impl Stat {
    /// A zeroed stat of the given kind; backends fill in the rest.
    pub fn of_kind(file_type: FileType) -> Self {
        Stat {
            size: 0,
            file_type,
            mode: 0,
            uid: 0,
            gid: 0,
            dev: 0,
            ctime: 0,
            mtime: 0,
        }
    }

    /// Whether the node is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// File system statistics returned by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    /// Fundamental block size in bytes.
    pub bsize: u32,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Total inodes (0 when the backend does not count them).
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// File system type identifier (`"lfs"`, `"devfs"`, `"fatfs"`, `"ext4fs"`).
    pub fsname: &'static str,
}

/// One directory entry yielded by a [`DirStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, without any path prefix.
    pub name: String,
    /// Node kind.
    pub file_type: FileType,
    /// Size in bytes (pipes: buffered byte count).
    pub size: u64,
}

/// Iterator state behind an open directory handle.
///
/// The VFS owns the box; dropping it is the backend's `closedir`.
pub trait DirStream: Send {
    /// Yield the next entry, or `None` at end of directory.
    fn next_entry(&mut self) -> KResult<Option<DirEntry>>;
}

/// Metadata a device driver reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStat {
    /// Major device number.
    pub major: u8,
    /// Minor device number.
    pub minor: u8,
    /// Device size in bytes, if meaningful.
    pub size: u64,
}

/// The vtable a device driver supplies to `devfs` and `lfs` device nodes.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Open the device with the requested mode flags.
    fn open(&self, flags: OpenFlags) -> KResult<()>;

    /// Close the device. With `force` set the driver must release its
    /// resources without blocking on slow I/O.
    fn close(&self, force: bool) -> KResult<()>;

    /// Read up to `buf.len()` bytes from `pos`.
    fn read(&self, buf: &mut [u8], pos: u64) -> KResult<usize>;

    /// Write `buf` at `pos`.
    fn write(&self, buf: &[u8], pos: u64) -> KResult<usize>;

    /// Driver-specific control request.
    fn ioctl(&self, cmd: u32, _arg: &mut [u8]) -> KResult<i32> {
        warn!("[Not Implemented] driver ioctl(cmd: {cmd:#x})");
        Err(Errno::NotSup)
    }

    /// Push buffered data to the hardware.
    fn flush(&self) -> KResult<()> {
        Ok(())
    }

    /// Report device metadata.
    fn stat(&self) -> KResult<DeviceStat>;
}

/// Options recognised on `mount`.
///
/// The option string is a whitespace or comma separated token list; `ro` is
/// understood, unknown tokens are ignored for forward compatibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Mount read-only.
    pub read_only: bool,
    /// Capacity cap in bytes for RAM-backed instances (`size=N`).
    pub size_limit: Option<u64>,
}

impl MountOptions {
    /// Parse an option string.
    pub fn parse(opts: &str) -> Self {
        let mut parsed = MountOptions::default();
        for token in opts.split([' ', ',', '\t']).filter(|t| !t.is_empty()) {
            if token == "ro" {
                parsed.read_only = true;
            } else if let Some(limit) = token.strip_prefix("size=") {
                match limit.parse::<u64>() {
                    Ok(bytes) => parsed.size_limit = Some(bytes),
                    Err(_) => warn!("ignoring malformed mount option {token:?}"),
                }
            } else {
                warn!("ignoring unknown mount option {token:?}");
            }
        }
        parsed
    }
}

/// Everything a backend's `init` needs to bring up an instance.
pub struct FsContext {
    /// The VFS, for backends whose backing store is a file on another mount.
    pub vfs: Arc<crate::vfs::Vfs>,
    /// Kernel clock for timestamps.
    pub clock: crate::sync::KClock,
    /// Source path; interpretation is backend-specific, may be empty.
    pub source: String,
    /// Parsed mount options.
    pub options: MountOptions,
    /// Byte capacity for pipes this instance creates.
    pub pipe_capacity: usize,
    /// Block-cache slot count for device-backed instances.
    pub bcache_slots: usize,
}

impl fmt::Debug for FsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsContext")
            .field("source", &self.source)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Constructor signature registered for each file system type.
pub type FsInitFn = fn(&FsContext) -> KResult<Box<dyn FileSystem>>;

/// A registered file system type: its name plus its `init` entry point.
#[derive(Debug, Clone, Copy)]
pub struct FsType {
    /// Name used as the first argument of `mount` (`"lfs"`, `"fatfs"`, ...).
    pub name: &'static str,
    /// Instance constructor.
    pub init: FsInitFn,
}

/// Capability table every file system backend implements.
///
/// All paths handed to a backend are the remainder after the VFS stripped
/// the mount prefix; they always begin with `/`, and `/` alone denotes the
/// mount root. A trailing `/` means the caller requires a directory.
#[allow(unused_variables)]
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Tear the instance down; called by `umount` once no files are open.
    fn release(&self) -> KResult<()> {
        Ok(())
    }

    /// Open the file at `path`.
    fn open(&self, path: &str, flags: OpenFlags) -> KResult<FileHandle> {
        warn!("[Not Implemented] open(path: {path:?}, flags: {flags:?})");
        Err(Errno::NotSup)
    }

    /// Close an open file. With `force` set the backend must finish without
    /// blocking on the device (task teardown path).
    fn close(&self, fh: FileHandle, force: bool) -> KResult<()> {
        warn!("[Not Implemented] close(fh: {fh}, force: {force})");
        Err(Errno::NotSup)
    }

    /// Read up to `buf.len()` bytes from byte offset `pos`.
    fn read(&self, fh: FileHandle, buf: &mut [u8], pos: u64) -> KResult<usize> {
        warn!("[Not Implemented] read(fh: {fh}, pos: {pos})");
        Err(Errno::NotSup)
    }

    /// Write `buf` at byte offset `pos`.
    fn write(&self, fh: FileHandle, buf: &[u8], pos: u64) -> KResult<usize> {
        warn!("[Not Implemented] write(fh: {fh}, pos: {pos})");
        Err(Errno::NotSup)
    }

    /// Control request on an open file.
    fn ioctl(&self, fh: FileHandle, cmd: u32, arg: &mut [u8]) -> KResult<i32> {
        warn!("[Not Implemented] ioctl(fh: {fh}, cmd: {cmd:#x})");
        Err(Errno::NotSup)
    }

    /// Flush buffered data for one open file.
    fn flush(&self, fh: FileHandle) -> KResult<()> {
        warn!("[Not Implemented] flush(fh: {fh})");
        Err(Errno::NotSup)
    }

    /// Metadata of an open file.
    fn fstat(&self, fh: FileHandle) -> KResult<Stat> {
        warn!("[Not Implemented] fstat(fh: {fh})");
        Err(Errno::NotSup)
    }

    /// Create a directory.
    fn mkdir(&self, path: &str, mode: u32) -> KResult<()> {
        warn!("[Not Implemented] mkdir(path: {path:?}, mode: {mode:o})");
        Err(Errno::NotSup)
    }

    /// Create a device node bound to `driver`.
    fn mknod(&self, path: &str, driver: Arc<dyn Driver>) -> KResult<()> {
        warn!("[Not Implemented] mknod(path: {path:?})");
        Err(Errno::NotSup)
    }

    /// Create a pipe node.
    fn mkfifo(&self, path: &str) -> KResult<()> {
        warn!("[Not Implemented] mkfifo(path: {path:?})");
        Err(Errno::NotSup)
    }

    /// Open a directory for iteration.
    fn opendir(&self, path: &str) -> KResult<Box<dyn DirStream>> {
        warn!("[Not Implemented] opendir(path: {path:?})");
        Err(Errno::NotSup)
    }

    /// Remove a file, empty directory, pipe or device node.
    fn remove(&self, path: &str) -> KResult<()> {
        warn!("[Not Implemented] remove(path: {path:?})");
        Err(Errno::NotSup)
    }

    /// Rename/move within this instance. Cross-mount renames never reach
    /// the backend; the VFS refuses them first.
    fn rename(&self, old_path: &str, new_path: &str) -> KResult<()> {
        warn!("[Not Implemented] rename(old: {old_path:?}, new: {new_path:?})");
        Err(Errno::NotSup)
    }

    /// Change permission bits.
    fn chmod(&self, path: &str, mode: u32) -> KResult<()> {
        warn!("[Not Implemented] chmod(path: {path:?}, mode: {mode:o})");
        Err(Errno::NotSup)
    }

    /// Change ownership.
    fn chown(&self, path: &str, uid: u32, gid: u32) -> KResult<()> {
        warn!("[Not Implemented] chown(path: {path:?}, uid: {uid}, gid: {gid})");
        Err(Errno::NotSup)
    }

    /// Metadata of the node at `path`.
    fn stat(&self, path: &str) -> KResult<Stat> {
        warn!("[Not Implemented] stat(path: {path:?})");
        Err(Errno::NotSup)
    }

    /// File system statistics.
    fn statfs(&self) -> KResult<StatFs> {
        warn!("[Not Implemented] statfs()");
        Err(Errno::NotSup)
    }

    /// Flush all buffered data to the backing store.
    fn sync(&self) -> KResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_options_recognise_ro_and_ignore_unknown() {
        assert!(MountOptions::parse("ro").read_only);
        assert!(MountOptions::parse("noatime,ro future-flag").read_only);
        assert!(!MountOptions::parse("").read_only);
        assert!(!MountOptions::parse("rw something").read_only);
        assert_eq!(MountOptions::parse("size=4096").size_limit, Some(4096));
        assert_eq!(MountOptions::parse("size=bogus").size_limit, None);
    }

    #[derive(Debug)]
    struct Bare;
    impl FileSystem for Bare {}

    #[test]
    fn absent_operations_report_not_supported() {
        let fs = Bare;
        assert_eq!(fs.mkdir("/x", 0o755).unwrap_err(), Errno::NotSup);
        assert_eq!(fs.stat("/x").unwrap_err(), Errno::NotSup);
        assert!(fs.release().is_ok());
    }
}
