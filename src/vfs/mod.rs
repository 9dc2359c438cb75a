//! Virtual file system: the mount tree and the descriptor tables.
//!
//! The VFS resolves paths across nested mount points, pins the target file
//! system, and dispatches file, directory and metadata operations through
//! the backend's capability table. The mount-tree mutex is held only long
//! enough to resolve a path and pin the target; backend calls run without
//! it so a slow device never blocks unrelated resolutions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, warn};

use crate::errno::{Errno, KResult};
use crate::fs::{
    DirEntry, Driver, FileHandle, FileSystem, FsContext, FsType, MountOptions, OpenFlags, Stat,
    StatFs,
};
use crate::sync::{KClock, KMutex};

pub mod file;
pub mod mode;
pub mod path;

pub use file::{Dir, Fd, Whence};

use file::{DIR_VALIDATION, FILE_VALIDATION, OpenDir, OpenFile};

/// Probe timeout on the mount-tree mutex; paths that can give up (umount)
/// use it and surface [`Errno::TimedOut`] instead of risking a deadlock.
const MOUNT_MTX_TIMEOUT_MS: u32 = 10;

/// One mounted file system instance.
pub(crate) struct Mount {
    mount_point: String,
    fs: Box<dyn FileSystem>,
    fsname: &'static str,
    /// Live VFS descriptors referring to this instance.
    opened_files: AtomicU32,
    /// File systems mounted on directories of this instance.
    mounted_beneath: AtomicU32,
    /// The mount the mount point itself lives on.
    parent: Weak<Mount>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("mount_point", &self.mount_point)
            .field("fsname", &self.fsname)
            .field("opened_files", &self.opened_files)
            .field("mounted_beneath", &self.mounted_beneath)
            .finish_non_exhaustive()
    }
}

/// One row of the mount table as reported by [`Vfs::getmntent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MntEnt {
    /// File system type identifier.
    pub fsname: &'static str,
    /// Mount point path.
    pub dir: String,
    /// Total capacity in bytes.
    pub total: u64,
    /// Free capacity in bytes.
    pub free: u64,
}

/// The VFS root: mount table plus descriptor tables.
pub struct Vfs {
    mounts: KMutex<Vec<Arc<Mount>>>,
    files: KMutex<HashMap<u32, OpenFile>>,
    dirs: KMutex<HashMap<u32, OpenDir>>,
    next_id: AtomicU32,
    clock: KClock,
    max_path: usize,
    pipe_capacity: usize,
    bcache_slots: usize,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs").finish_non_exhaustive()
    }
}

impl Vfs {
    /// Create an empty VFS with no mounts.
    pub fn new(clock: KClock, config: &crate::kernel::KernelConfig) -> Arc<Self> {
        Arc::new(Vfs {
            mounts: KMutex::new(Vec::new()),
            files: KMutex::new(HashMap::new()),
            dirs: KMutex::new(HashMap::new()),
            next_id: AtomicU32::new(3),
            clock,
            max_path: config.max_path_len(),
            pipe_capacity: config.pipe_capacity(),
            bcache_slots: config.bcache_slots(),
        })
    }

    fn validate(&self, p: &str) -> KResult<()> {
        path::validate(p, self.max_path).map_err(|err| match err {
            path::PathError::NotAbsolute => Errno::Inval,
            path::PathError::TooLong => Errno::NameTooLong,
        })
    }

    fn alloc_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Longest-prefix mount lookup (whole components). Does not pin.
    fn resolve(&self, p: &str) -> KResult<(Arc<Mount>, usize)> {
        let mounts = self.mounts.force_lock();
        resolve_in(&mounts, p)
    }

    /// Longest-prefix mount lookup that also pins the target by bumping its
    /// open-files counter; the caller must unpin on failure.
    fn resolve_pinned(&self, p: &str) -> KResult<(Arc<Mount>, usize)> {
        let mounts = self.mounts.force_lock();
        let (mount, len) = resolve_in(&mounts, p)?;
        mount.opened_files.fetch_add(1, Ordering::AcqRel);
        Ok((mount, len))
    }

    // ---- mount table ----------------------------------------------------

    /// Mount a new `fstype` instance at `mount_point`.
    ///
    /// `source` is interpreted by the backend and may be empty; `opts` is a
    /// token string (`ro` recognised, unknown tokens ignored). The first
    /// mount must be at `/`.
    pub fn mount(
        self: &Arc<Self>,
        fstype: FsType,
        source: &str,
        mount_point: &str,
        opts: &str,
    ) -> KResult<()> {
        self.validate(mount_point)?;
        let mp = normalize_mount_point(mount_point);
        let options = MountOptions::parse(opts);

        // Probe the table first so an impossible mount never constructs a
        // backend instance.
        let parent = {
            let mounts = self.mounts.force_lock();
            if mounts.iter().any(|m| m.mount_point == mp) {
                return Err(Errno::Busy);
            }
            if mounts.is_empty() {
                if mp != "/" {
                    return Err(Errno::NoEnt);
                }
                None
            } else {
                let (parent, plen) = resolve_in(&mounts, &mp)?;
                Some((parent, plen))
            }
        };

        // The mount point must exist on the enclosing file system and be a
        // directory. Checked outside the table lock: stat may touch a device.
        if let Some((parent, plen)) = &parent {
            let rem = path::remainder(&mp, *plen);
            if rem != "/" {
                let st = parent.fs.stat(rem)?;
                if !st.is_dir() {
                    return Err(Errno::NotDir);
                }
            }
        }

        let ctx = FsContext {
            vfs: self.clone(),
            clock: self.clock,
            source: source.to_string(),
            options,
            pipe_capacity: self.pipe_capacity,
            bcache_slots: self.bcache_slots,
        };
        let fs = (fstype.init)(&ctx)?;

        let mut mounts = self.mounts.force_lock();
        // The table may have changed while init ran.
        if mounts.iter().any(|m| m.mount_point == mp) {
            drop(mounts);
            let _ = fs.release();
            return Err(Errno::Busy);
        }
        let parent_weak = match &parent {
            Some((parent, _)) => {
                if !mounts.iter().any(|m| Arc::ptr_eq(m, parent)) {
                    drop(mounts);
                    let _ = fs.release();
                    return Err(Errno::NoEnt);
                }
                parent.mounted_beneath.fetch_add(1, Ordering::AcqRel);
                Arc::downgrade(parent)
            }
            None => Weak::new(),
        };
        mounts.push(Arc::new(Mount {
            mount_point: mp.clone(),
            fs,
            fsname: fstype.name,
            opened_files: AtomicU32::new(0),
            mounted_beneath: AtomicU32::new(0),
            parent: parent_weak,
        }));
        debug!("vfs: mounted {} at {mp:?}", fstype.name);
        Ok(())
    }

    /// Unmount the file system at `mount_point`.
    ///
    /// Fails with [`Errno::Busy`] while the instance has open files or other
    /// file systems mounted beneath it.
    pub fn umount(&self, mount_point: &str) -> KResult<()> {
        self.validate(mount_point)?;
        let mp = normalize_mount_point(mount_point);

        let mut mounts = self.mounts.lock(MOUNT_MTX_TIMEOUT_MS)?;
        let idx = mounts
            .iter()
            .position(|m| m.mount_point == mp)
            .ok_or(Errno::NoEnt)?;
        let mount = &mounts[idx];
        if mount.opened_files.load(Ordering::Acquire) != 0
            || mount.mounted_beneath.load(Ordering::Acquire) != 0
        {
            return Err(Errno::Busy);
        }
        mount.fs.release()?;
        let mount = mounts.remove(idx);
        if let Some(parent) = mount.parent.upgrade() {
            parent.mounted_beneath.fetch_sub(1, Ordering::AcqRel);
        }
        debug!("vfs: unmounted {mp:?}");
        Ok(())
    }

    /// Report the `index`-th mount table entry, for `df`-style listings.
    pub fn getmntent(&self, index: usize) -> KResult<MntEnt> {
        let mount = {
            let mounts = self.mounts.force_lock();
            mounts.get(index).cloned().ok_or(Errno::NoEnt)?
        };
        let (total, free) = match mount.fs.statfs() {
            Ok(sfs) => (
                sfs.blocks * u64::from(sfs.bsize),
                sfs.bfree * u64::from(sfs.bsize),
            ),
            Err(_) => (0, 0),
        };
        Ok(MntEnt {
            fsname: mount.fsname,
            dir: mount.mount_point.clone(),
            total,
            free,
        })
    }

    /// Number of mounted file systems.
    pub fn mount_count(&self) -> usize {
        self.mounts.force_lock().len()
    }

    // ---- files ----------------------------------------------------------

    /// Open the file at `p` with a C-library style mode string.
    pub fn open(&self, p: &str, mode_str: &str) -> KResult<Fd> {
        let flags = mode::parse(mode_str)?;
        self.validate(p)?;
        let (mount, plen) = self.resolve_pinned(p)?;
        let rem = path::remainder(p, plen);
        let fh = match mount.fs.open(rem, flags) {
            Ok(fh) => fh,
            Err(err) => {
                mount.opened_files.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            }
        };
        let pos = if flags.contains(OpenFlags::APPEND) {
            mount.fs.fstat(fh).map(|st| st.size).unwrap_or(0)
        } else {
            0
        };
        let id = self.alloc_id();
        self.files.force_lock().insert(
            id,
            OpenFile {
                mount,
                fh,
                pos,
                flags,
                eof: false,
                error: false,
                validation: FILE_VALIDATION,
            },
        );
        Ok(Fd(id))
    }

    /// Close an open file.
    pub fn close(&self, fd: Fd) -> KResult<()> {
        self.close_impl(fd, false)
    }

    /// Force-close an open file during task teardown; the backend must not
    /// block on the device.
    pub fn close_forced(&self, fd: Fd) -> KResult<()> {
        self.close_impl(fd, true)
    }

    fn close_impl(&self, fd: Fd, force: bool) -> KResult<()> {
        let of = {
            let mut files = self.files.force_lock();
            files.remove(&fd.0).ok_or(Errno::BadF)?
        };
        if of.validation != FILE_VALIDATION {
            error!("vfs: descriptor table corrupt (fd {fd})");
            panic!("vfs: descriptor table corrupt (fd {fd})");
        }
        let result = of.mount.fs.close(of.fh, force);
        of.mount.opened_files.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn file_fields(&self, fd: Fd) -> KResult<(Arc<Mount>, FileHandle, u64, OpenFlags)> {
        let files = self.files.force_lock();
        let of = files.get(&fd.0).ok_or(Errno::BadF)?;
        if of.validation != FILE_VALIDATION {
            error!("vfs: descriptor table corrupt (fd {fd})");
            panic!("vfs: descriptor table corrupt (fd {fd})");
        }
        Ok((of.mount.clone(), of.fh, of.pos, of.flags))
    }

    /// Read up to `buf.len()` bytes at the descriptor's seek offset.
    ///
    /// Returns the byte count; 0 at end of file (and the EOF flag is set).
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> KResult<usize> {
        let (mount, fh, pos, flags) = self.file_fields(fd)?;
        if !flags.readable() {
            return Err(Errno::Acces);
        }
        let result = mount.fs.read(fh, buf, pos);
        let mut files = self.files.force_lock();
        if let Some(of) = files.get_mut(&fd.0) {
            match &result {
                Ok(0) if !buf.is_empty() => of.eof = true,
                Ok(n) => of.pos = pos + *n as u64,
                Err(_) => of.error = true,
            }
        }
        result
    }

    /// Write `buf` at the descriptor's seek offset.
    pub fn write(&self, fd: Fd, buf: &[u8]) -> KResult<usize> {
        let (mount, fh, mut pos, flags) = self.file_fields(fd)?;
        if !flags.writable() {
            return Err(Errno::Acces);
        }
        if flags.contains(OpenFlags::APPEND) {
            pos = mount.fs.fstat(fh).map(|st| st.size).unwrap_or(pos);
        }
        let result = mount.fs.write(fh, buf, pos);
        let mut files = self.files.force_lock();
        if let Some(of) = files.get_mut(&fd.0) {
            match &result {
                Ok(n) => of.pos = pos + *n as u64,
                Err(_) => of.error = true,
            }
        }
        result
    }

    /// Move the descriptor's seek offset; returns the new offset.
    ///
    /// Seeking clears the EOF flag.
    pub fn lseek(&self, fd: Fd, offset: i64, whence: Whence) -> KResult<u64> {
        let (mount, fh, pos, _flags) = self.file_fields(fd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => pos as i64,
            Whence::End => mount.fs.fstat(fh)?.size as i64,
        };
        let target = base.checked_add(offset).ok_or(Errno::Inval)?;
        if target < 0 {
            return Err(Errno::Inval);
        }
        let mut files = self.files.force_lock();
        let of = files.get_mut(&fd.0).ok_or(Errno::BadF)?;
        of.pos = target as u64;
        of.eof = false;
        Ok(of.pos)
    }

    /// Control request on an open file.
    pub fn ioctl(&self, fd: Fd, cmd: u32, arg: &mut [u8]) -> KResult<i32> {
        let (mount, fh, _, _) = self.file_fields(fd)?;
        mount.fs.ioctl(fh, cmd, arg)
    }

    /// Flush buffered data for an open file.
    pub fn flush(&self, fd: Fd) -> KResult<()> {
        let (mount, fh, _, _) = self.file_fields(fd)?;
        mount.fs.flush(fh)
    }

    /// Metadata of an open file.
    pub fn fstat(&self, fd: Fd) -> KResult<Stat> {
        let (mount, fh, _, _) = self.file_fields(fd)?;
        mount.fs.fstat(fh)
    }

    /// Whether the descriptor has observed end of file.
    pub fn is_eof(&self, fd: Fd) -> KResult<bool> {
        let files = self.files.force_lock();
        files.get(&fd.0).map(|of| of.eof).ok_or(Errno::BadF)
    }

    /// Whether the descriptor has recorded a backend error.
    pub fn has_error(&self, fd: Fd) -> KResult<bool> {
        let files = self.files.force_lock();
        files.get(&fd.0).map(|of| of.error).ok_or(Errno::BadF)
    }

    /// Clear the descriptor's EOF and error flags.
    pub fn clear_flags(&self, fd: Fd) -> KResult<()> {
        let mut files = self.files.force_lock();
        let of = files.get_mut(&fd.0).ok_or(Errno::BadF)?;
        of.eof = false;
        of.error = false;
        Ok(())
    }

    // ---- directories ----------------------------------------------------

    /// Open the directory at `p` for iteration.
    pub fn opendir(&self, p: &str) -> KResult<Dir> {
        self.validate(p)?;
        let (mount, plen) = self.resolve_pinned(p)?;
        let rem = path::remainder(p, plen);
        let stream = match mount.fs.opendir(rem) {
            Ok(stream) => stream,
            Err(err) => {
                mount.opened_files.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            }
        };
        let id = self.alloc_id();
        self.dirs.force_lock().insert(
            id,
            OpenDir {
                mount,
                stream,
                last: None,
                validation: DIR_VALIDATION,
            },
        );
        Ok(Dir(id))
    }

    /// Yield the next entry of an open directory, or `None` at the end.
    pub fn readdir(&self, dir: Dir) -> KResult<Option<DirEntry>> {
        // The handle is taken out of the table while the backend iterates so
        // a slow volume does not stall unrelated handles.
        let mut od = {
            let mut dirs = self.dirs.force_lock();
            dirs.remove(&dir.0).ok_or(Errno::BadF)?
        };
        if od.validation != DIR_VALIDATION {
            error!("vfs: directory table corrupt (dir {dir})");
            panic!("vfs: directory table corrupt (dir {dir})");
        }
        let result = od.stream.next_entry();
        if let Ok(entry) = &result {
            od.last = entry.clone();
        }
        self.dirs.force_lock().insert(dir.0, od);
        result
    }

    /// Close an open directory.
    pub fn closedir(&self, dir: Dir) -> KResult<()> {
        let od = {
            let mut dirs = self.dirs.force_lock();
            dirs.remove(&dir.0).ok_or(Errno::BadF)?
        };
        od.mount.opened_files.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    // ---- metadata -------------------------------------------------------

    /// Metadata of the node at `p`.
    pub fn stat(&self, p: &str) -> KResult<Stat> {
        self.validate(p)?;
        let (mount, plen) = self.resolve(p)?;
        mount.fs.stat(path::remainder(p, plen))
    }

    /// Statistics of the file system `p` lives on.
    pub fn statfs(&self, p: &str) -> KResult<StatFs> {
        self.validate(p)?;
        let (mount, _) = self.resolve(p)?;
        mount.fs.statfs()
    }

    /// Create a directory.
    pub fn mkdir(&self, p: &str, mode: u32) -> KResult<()> {
        self.validate(p)?;
        let (mount, plen) = self.resolve(p)?;
        mount.fs.mkdir(path::remainder(p, plen), mode)
    }

    /// Create a device node bound to `driver`.
    pub fn mknod(&self, p: &str, driver: Arc<dyn Driver>) -> KResult<()> {
        self.validate(p)?;
        let (mount, plen) = self.resolve(p)?;
        mount.fs.mknod(path::remainder(p, plen), driver)
    }

    /// Create a pipe node.
    pub fn mkfifo(&self, p: &str) -> KResult<()> {
        self.validate(p)?;
        let (mount, plen) = self.resolve(p)?;
        mount.fs.mkfifo(path::remainder(p, plen))
    }

    /// Remove a file, empty directory, pipe or device node.
    pub fn remove(&self, p: &str) -> KResult<()> {
        self.validate(p)?;
        {
            let mp = normalize_mount_point(p);
            let mounts = self.mounts.force_lock();
            if mounts.iter().any(|m| m.mount_point == mp) {
                return Err(Errno::Busy);
            }
        }
        let (mount, plen) = self.resolve(p)?;
        mount.fs.remove(path::remainder(p, plen))
    }

    /// Rename within one file system; cross-mount renames are refused.
    pub fn rename(&self, old_path: &str, new_path: &str) -> KResult<()> {
        self.validate(old_path)?;
        self.validate(new_path)?;
        let (old_mount, old_len) = self.resolve(old_path)?;
        let (new_mount, new_len) = self.resolve(new_path)?;
        if !Arc::ptr_eq(&old_mount, &new_mount) {
            warn!("vfs: cross-mount rename {old_path:?} -> {new_path:?} refused");
            return Err(Errno::XDev);
        }
        old_mount.fs.rename(
            path::remainder(old_path, old_len),
            path::remainder(new_path, new_len),
        )
    }

    /// Change permission bits.
    pub fn chmod(&self, p: &str, mode: u32) -> KResult<()> {
        self.validate(p)?;
        let (mount, plen) = self.resolve(p)?;
        mount.fs.chmod(path::remainder(p, plen), mode)
    }

    /// Change ownership.
    pub fn chown(&self, p: &str, uid: u32, gid: u32) -> KResult<()> {
        self.validate(p)?;
        let (mount, plen) = self.resolve(p)?;
        mount.fs.chown(path::remainder(p, plen), uid, gid)
    }

    /// Flush every mounted file system.
    pub fn sync(&self) -> KResult<()> {
        let mounts: Vec<Arc<Mount>> = self.mounts.force_lock().clone();
        for mount in mounts {
            mount.fs.sync()?;
        }
        Ok(())
    }
}

fn resolve_in(mounts: &[Arc<Mount>], p: &str) -> KResult<(Arc<Mount>, usize)> {
    let mut best: Option<(&Arc<Mount>, usize)> = None;
    for mount in mounts {
        if let Some(len) = path::mount_prefix_len(&mount.mount_point, p) {
            if best.is_none_or(|(_, best_len)| len >= best_len) {
                best = Some((mount, len));
            }
        }
    }
    best.map(|(m, len)| (m.clone(), len)).ok_or(Errno::NoEnt)
}

fn normalize_mount_point(p: &str) -> String {
    let trimmed = p.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
