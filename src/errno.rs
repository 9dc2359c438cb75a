//! Kernel error codes.
//!
//! Errors travel as a small enum rather than raw integers so that match
//! arms stay exhaustive; the numeric value only matters at the user-space
//! boundary, where [`Errno::code`] maps onto the libc constants.

use std::cell::Cell;
use std::fmt;

/// Result alias used across the kernel.
pub type KResult<T> = Result<T, Errno>;

/// Error kinds surfaced by kernel services and file system backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Errno {
    /// No such file or directory
    NoEnt,
    /// Not a directory
    NotDir,
    /// Is a directory
    IsDir,
    /// Permission denied
    Acces,
    /// Device or resource busy
    Busy,
    /// Out of memory
    NoMem,
    /// No space left on device
    NoSpc,
    /// File exists
    Exist,
    /// Invalid argument
    Inval,
    /// Input/output error
    Io,
    /// Operation not supported
    NotSup,
    /// Operation not permitted
    Perm,
    /// Connection timed out
    TimedOut,
    /// Result out of range
    Range,
    /// File name too long
    NameTooLong,
    /// Bad file descriptor
    BadF,
    /// Directory not empty
    NotEmpty,
    /// Cross-device link
    XDev,
    /// Read-only file system
    Rofs,
    /// Broken pipe
    Pipe,
    /// Resource temporarily unavailable
    Again,
}

impl Errno {
    /// The libc error code for this kind.
    pub fn code(self) -> i32 {
        match self {
            Errno::NoEnt => libc::ENOENT,
            Errno::NotDir => libc::ENOTDIR,
            Errno::IsDir => libc::EISDIR,
            Errno::Acces => libc::EACCES,
            Errno::Busy => libc::EBUSY,
            Errno::NoMem => libc::ENOMEM,
            Errno::NoSpc => libc::ENOSPC,
            Errno::Exist => libc::EEXIST,
            Errno::Inval => libc::EINVAL,
            Errno::Io => libc::EIO,
            Errno::NotSup => libc::ENOTSUP,
            Errno::Perm => libc::EPERM,
            Errno::TimedOut => libc::ETIMEDOUT,
            Errno::Range => libc::ERANGE,
            Errno::NameTooLong => libc::ENAMETOOLONG,
            Errno::BadF => libc::EBADF,
            Errno::NotEmpty => libc::ENOTEMPTY,
            Errno::XDev => libc::EXDEV,
            Errno::Rofs => libc::EROFS,
            Errno::Pipe => libc::EPIPE,
            Errno::Again => libc::EAGAIN,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Errno::NoEnt => "No such file or directory",
            Errno::NotDir => "Not a directory",
            Errno::IsDir => "Is a directory",
            Errno::Acces => "Permission denied",
            Errno::Busy => "Device or resource busy",
            Errno::NoMem => "Out of memory",
            Errno::NoSpc => "No space left on device",
            Errno::Exist => "File exists",
            Errno::Inval => "Invalid argument",
            Errno::Io => "Input/output error",
            Errno::NotSup => "Operation not supported",
            Errno::Perm => "Operation not permitted",
            Errno::TimedOut => "Connection timed out",
            Errno::Range => "Result out of range",
            Errno::NameTooLong => "File name too long",
            Errno::BadF => "Bad file descriptor",
            Errno::NotEmpty => "Directory not empty",
            Errno::XDev => "Cross-device link",
            Errno::Rofs => "Read-only file system",
            Errno::Pipe => "Broken pipe",
            Errno::Again => "Resource temporarily unavailable",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for Errno {}

thread_local! {
    static LAST_ERROR: Cell<Option<Errno>> = const { Cell::new(None) };
}

/// Record `err` in the calling task's last-error slot and pass it through.
///
/// Kernel entry points call this on their way out so user code that only
/// checks a boolean result can still ask what went wrong.
pub(crate) fn set_last_error(err: Errno) -> Errno {
    LAST_ERROR.with(|slot| slot.set(Some(err)));
    err
}

/// The most recent error recorded on the calling task, if any.
pub fn last_error() -> Option<Errno> {
    LAST_ERROR.with(Cell::get)
}

/// Clear the calling task's last-error slot.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.set(None));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_libc() {
        assert_eq!(Errno::NoEnt.code(), libc::ENOENT);
        assert_eq!(Errno::TimedOut.code(), libc::ETIMEDOUT);
        assert_eq!(Errno::NameTooLong.code(), libc::ENAMETOOLONG);
    }

    #[test]
    fn last_error_is_per_thread() {
        set_last_error(Errno::Busy);
        assert_eq!(last_error(), Some(Errno::Busy));
        std::thread::spawn(|| assert_eq!(last_error(), None))
            .join()
            .unwrap();
        clear_last_error();
        assert_eq!(last_error(), None);
    }
}
