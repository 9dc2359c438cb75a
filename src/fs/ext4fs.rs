//! `ext4fs`: the ext-family backend.
//!
//! On mount the source path is opened through the VFS (read-only when the
//! `ro` option is present), its length learned via `fstat`, and a block
//! device installed whose reads and writes seek and act on that handle. A
//! recursive mutex wraps every library call; write-back caching is enabled
//! for writable mounts and disabled (along with journaling) for read-only
//! ones.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::errno::{Errno, KResult};
use crate::ext4::{BlockDev, BlockIo, Ext4};
use crate::fs::{
    DirEntry, DirStream, FileHandle, FileSystem, FileType, FsContext, OpenFlags, Stat, StatFs,
};
use crate::sync::{KRecursiveMutex, MAX_DELAY_MS};
use crate::vfs::{Fd, Vfs, Whence, path};

/// Physical block size the source handle is addressed in.
const PH_BSIZE: u32 = 512;

/// Backend constructor registered under the name `"ext4fs"`.
pub fn init(ctx: &FsContext) -> KResult<Box<dyn FileSystem>> {
    if ctx.source.is_empty() {
        return Err(Errno::Inval);
    }
    let mode = if ctx.options.read_only { "r" } else { "r+" };
    let src_fd = ctx.vfs.open(&ctx.source, mode)?;

    let mounted = (|| {
        let size = ctx.vfs.fstat(src_fd)?.size;
        if size < u64::from(PH_BSIZE) {
            return Err(Errno::Inval);
        }
        let io = VfsBlockIo {
            vfs: ctx.vfs.clone(),
            fd: src_fd,
        };
        let bdev = BlockDev::new(
            Box::new(io),
            PH_BSIZE,
            size / u64::from(PH_BSIZE),
            ctx.bcache_slots,
        )?;
        let mut fs = Ext4::mount(bdev, ctx.clock, ctx.options.read_only)?;
        if !fs.is_read_only() {
            fs.bdev_mut().cache_write_back(true)?;
        }
        Ok(fs)
    })();

    match mounted {
        Ok(fs) => {
            debug!("ext4fs: mounted {:?}", ctx.source);
            Ok(Box::new(Ext4Fs {
                state: KRecursiveMutex::new(Volume {
                    fs,
                    vfs: ctx.vfs.clone(),
                    src_fd,
                    opened: HashMap::new(),
                    next_fh: 1,
                }),
            }))
        }
        Err(err) => {
            let _ = ctx.vfs.close(src_fd);
            Err(err)
        }
    }
}

/// Create (or extend) the file at `source` to `bytes` and format it as an
/// empty ext volume.
pub fn mkfs(vfs: &Arc<Vfs>, source: &str, bytes: u64) -> KResult<()> {
    let fd = vfs.open(source, "w+")?;
    let result = (|| {
        // Give the file its full extent so sector reads never hit EOF.
        vfs.lseek(fd, bytes as i64 - 1, Whence::Set)?;
        vfs.write(fd, &[0u8])?;
        let io = VfsBlockIo {
            vfs: vfs.clone(),
            fd,
        };
        let mut bdev = BlockDev::new(Box::new(io), PH_BSIZE, bytes / u64::from(PH_BSIZE), 8)?;
        crate::ext4::mkfs(&mut bdev, crate::sync::KClock::start())
    })();
    let close = vfs.close(fd);
    result?;
    close
}

/// Block transport over a VFS file handle: seek, then read or write.
struct VfsBlockIo {
    vfs: Arc<Vfs>,
    fd: Fd,
}

impl BlockIo for VfsBlockIo {
    fn bread(&mut self, buf: &mut [u8], pba: u64, count: u32) -> KResult<()> {
        let len = count as usize * PH_BSIZE as usize;
        self.vfs
            .lseek(self.fd, (pba * u64::from(PH_BSIZE)) as i64, Whence::Set)?;
        let mut done = 0;
        while done < len {
            let n = self.vfs.read(self.fd, &mut buf[done..len])?;
            if n == 0 {
                return Err(Errno::Io);
            }
            done += n;
        }
        Ok(())
    }

    fn bwrite(&mut self, buf: &[u8], pba: u64, count: u32) -> KResult<()> {
        let len = count as usize * PH_BSIZE as usize;
        self.vfs
            .lseek(self.fd, (pba * u64::from(PH_BSIZE)) as i64, Whence::Set)?;
        let mut done = 0;
        while done < len {
            let n = self.vfs.write(self.fd, &buf[done..len])?;
            if n == 0 {
                return Err(Errno::Io);
            }
            done += n;
        }
        Ok(())
    }
}

struct Volume {
    fs: Ext4,
    vfs: Arc<Vfs>,
    src_fd: Fd,
    opened: HashMap<u64, u32>,
    next_fh: u64,
}

/// The ext backend instance.
pub struct Ext4Fs {
    state: KRecursiveMutex<Volume>,
}

impl std::fmt::Debug for Ext4Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext4Fs").finish_non_exhaustive()
    }
}

fn info_to_stat(info: crate::ext4::InodeInfo) -> Stat {
    Stat {
        size: info.size,
        file_type: if info.is_dir {
            FileType::Directory
        } else {
            FileType::Regular
        },
        mode: u32::from(info.mode),
        uid: u32::from(info.uid),
        gid: u32::from(info.gid),
        dev: 0,
        ctime: u64::from(info.ctime),
        mtime: u64::from(info.mtime),
    }
}

/// Resolve with trailing-slash semantics: a `p/` path must land on a
/// directory.
fn lookup_checked(fs: &mut Ext4, p: &str) -> KResult<crate::ext4::InodeInfo> {
    let ino = fs.lookup_path(p)?;
    let info = fs.inode_info(ino)?;
    if path::wants_directory(p) && !info.is_dir {
        return Err(Errno::NotDir);
    }
    Ok(info)
}

impl FileSystem for Ext4Fs {
    fn release(&self) -> KResult<()> {
        let guard = self.state.lock(MAX_DELAY_MS)?;
        let mut vol = guard.borrow_mut();
        if !vol.opened.is_empty() {
            return Err(Errno::Busy);
        }
        vol.fs.unmount()?;
        let (vfs, fd) = (vol.vfs.clone(), vol.src_fd);
        drop(vol);
        drop(guard);
        vfs.close(fd)
    }

    fn open(&self, p: &str, flags: OpenFlags) -> KResult<FileHandle> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();

        let ino = match lookup_checked(&mut vol.fs, p) {
            Ok(info) if info.is_dir => return Err(Errno::IsDir),
            Ok(info) => {
                if flags.contains(OpenFlags::TRUNC) {
                    vol.fs.truncate(info.ino)?;
                }
                info.ino
            }
            Err(Errno::NoEnt) if flags.contains(OpenFlags::CREATE) => {
                if path::wants_directory(p) {
                    return Err(Errno::NotDir);
                }
                vol.fs.create_file(p, 0o644)?
            }
            Err(err) => return Err(err),
        };

        let fh = vol.next_fh;
        vol.next_fh += 1;
        vol.opened.insert(fh, ino);
        Ok(FileHandle(fh))
    }

    fn close(&self, fh: FileHandle, _force: bool) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        vol.opened.remove(&fh.0).ok_or(Errno::BadF)?;
        Ok(())
    }

    fn read(&self, fh: FileHandle, buf: &mut [u8], pos: u64) -> KResult<usize> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        let ino = *vol.opened.get(&fh.0).ok_or(Errno::BadF)?;
        vol.fs.read_at(ino, pos, buf)
    }

    fn write(&self, fh: FileHandle, buf: &[u8], pos: u64) -> KResult<usize> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        let ino = *vol.opened.get(&fh.0).ok_or(Errno::BadF)?;
        vol.fs.write_at(ino, pos, buf)
    }

    fn flush(&self, fh: FileHandle) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        if !vol.opened.contains_key(&fh.0) {
            return Err(Errno::BadF);
        }
        vol.fs.sync()
    }

    fn fstat(&self, fh: FileHandle) -> KResult<Stat> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        let ino = *vol.opened.get(&fh.0).ok_or(Errno::BadF)?;
        vol.fs.inode_info(ino).map(info_to_stat)
    }

    fn mkdir(&self, p: &str, mode: u32) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        vol.fs.make_dir(p, (mode & 0o7777) as u16)
    }

    fn opendir(&self, p: &str) -> KResult<Box<dyn DirStream>> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        let info = lookup_checked(&mut vol.fs, p)?;
        if !info.is_dir {
            return Err(Errno::NotDir);
        }
        let mut entries = Vec::new();
        for row in vol.fs.list_dir(info.ino)? {
            let size = vol.fs.inode_info(row.ino).map(|i| i.size).unwrap_or(0);
            entries.push(DirEntry {
                name: row.name,
                file_type: if row.is_dir {
                    FileType::Directory
                } else {
                    FileType::Regular
                },
                size,
            });
        }
        Ok(Box::new(ExtDirStream { entries, cursor: 0 }))
    }

    fn remove(&self, p: &str) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        let info = lookup_checked(&mut vol.fs, p)?;
        if path::wants_directory(p) && !info.is_dir {
            return Err(Errno::NotDir);
        }
        vol.fs.remove(p)
    }

    fn rename(&self, old_path: &str, new_path: &str) -> KResult<()> {
        if path::wants_directory(old_path) || path::wants_directory(new_path) {
            return Err(Errno::Inval);
        }
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        vol.fs.rename(old_path, new_path)
    }

    fn chmod(&self, p: &str, mode: u32) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        let info = lookup_checked(&mut vol.fs, p)?;
        vol.fs.chmod(info.ino, (mode & 0o7777) as u16)
    }

    fn chown(&self, p: &str, uid: u32, gid: u32) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        let info = lookup_checked(&mut vol.fs, p)?;
        vol.fs.chown(info.ino, uid as u16, gid as u16)
    }

    fn stat(&self, p: &str) -> KResult<Stat> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        lookup_checked(&mut vol.fs, p).map(info_to_stat)
    }

    fn statfs(&self) -> KResult<StatFs> {
        let guard = self.state.force_lock();
        let vol = guard.borrow_mut();
        let (bsize, blocks, bfree, files, ffree) = vol.fs.volume_info();
        Ok(StatFs {
            bsize,
            blocks,
            bfree,
            files,
            ffree,
            fsname: "ext4fs",
        })
    }

    fn sync(&self) -> KResult<()> {
        let guard = self.state.force_lock();
        let mut vol = guard.borrow_mut();
        vol.fs.sync()
    }
}

struct ExtDirStream {
    entries: Vec<DirEntry>,
    cursor: usize,
}

impl DirStream for ExtDirStream {
    fn next_entry(&mut self) -> KResult<Option<DirEntry>> {
        let entry = self.entries.get(self.cursor).cloned();
        if entry.is_some() {
            self.cursor += 1;
        }
        Ok(entry)
    }
}
