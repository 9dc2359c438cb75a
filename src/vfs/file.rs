//! Open file descriptions and directory handles.

use std::fmt;

use crate::fs::{DirEntry, DirStream, FileHandle, OpenFlags};

/// Validation cookie stored in live file descriptions.
pub(crate) const FILE_VALIDATION: u32 = 0x495D_47CB;

/// Validation cookie stored in live directory handles.
pub(crate) const DIR_VALIDATION: u32 = 0x297E_823D;

/// Descriptor for an open file, handed to user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub u32);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptor for an open directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dir(pub u32);

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Origin for [`crate::vfs::Vfs::lseek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file.
    Set,
    /// Relative to the current position.
    Cur,
    /// Relative to the end of the file.
    End,
}

/// The kernel-owned record behind an [`Fd`].
pub(crate) struct OpenFile {
    /// Mount the file lives on; index into the VFS mount pin table.
    pub(crate) mount: std::sync::Arc<super::Mount>,
    /// Backend handle.
    pub(crate) fh: FileHandle,
    /// Current seek offset.
    pub(crate) pos: u64,
    /// Flags the file was opened with.
    pub(crate) flags: OpenFlags,
    /// Set when a read returned zero bytes at end of file.
    pub(crate) eof: bool,
    /// Set when the backend reported an error.
    pub(crate) error: bool,
    /// [`FILE_VALIDATION`] while the description is live.
    pub(crate) validation: u32,
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("fh", &self.fh)
            .field("pos", &self.pos)
            .field("flags", &self.flags)
            .field("eof", &self.eof)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// The kernel-owned record behind a [`Dir`].
pub(crate) struct OpenDir {
    pub(crate) mount: std::sync::Arc<super::Mount>,
    pub(crate) stream: Box<dyn DirStream>,
    /// Most recently yielded entry; owned by the handle.
    pub(crate) last: Option<DirEntry>,
    /// [`DIR_VALIDATION`] while the handle is live.
    pub(crate) validation: u32,
}

impl fmt::Debug for OpenDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenDir")
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}
